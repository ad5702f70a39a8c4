//! Command implementations

use elif_migrate::{Applied, MigrationStream, Migrator};
use futures::StreamExt;
use tracing::warn;

use crate::output::{print_applied, print_failure, Timer};

/// Whether a command succeeded. Failures are reported before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
}

/// Print files as they are applied. Ctrl-C stops the run after the file in
/// progress.
pub async fn stream(mut stream: MigrationStream) -> Outcome {
    let timer = Timer::start();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = stream.next() => match result {
                Some(Ok(file)) => print_applied(&file),
                Some(Err(e)) => {
                    print_failure(&e);
                    return Outcome::Failed;
                }
                None => break,
            },
            _ = &mut ctrl_c, if !stream.is_cancelled() => {
                warn!("Interrupted, stopping after the current migration");
                stream.cancel();
            }
        }
    }

    timer.print();
    Outcome::Success
}

/// Print the result of a collecting operation
pub async fn collected(run: impl std::future::Future<Output = Applied>) -> Outcome {
    let timer = Timer::start();
    match run.await {
        Ok(files) => {
            files.iter().for_each(|file| print_applied(file));
            timer.print();
            Outcome::Success
        }
        Err(partial) => {
            partial.applied.iter().for_each(|file| print_applied(file));
            print_failure(&partial.failure);
            Outcome::Failed
        }
    }
}

pub async fn version(migrator: &Migrator) -> anyhow::Result<Outcome> {
    println!("{}", migrator.version().await?);
    Ok(Outcome::Success)
}

pub async fn lock_status(migrator: &Migrator) -> anyhow::Result<Outcome> {
    match migrator.lock_info().await? {
        Some(info) => println!("locked: {}", info),
        None => println!("unlocked"),
    }
    Ok(Outcome::Success)
}

pub async fn force_unlock(migrator: &Migrator) -> anyhow::Result<Outcome> {
    migrator.force_unlock().await?;
    println!("lock removed");
    Ok(Outcome::Success)
}
