//! Apply engine - lock-protected sequential execution
//!
//! One background task per invocation takes the driver lock, reads the
//! current version, asks the caller which files to run from there and
//! applies them strictly in order. Every applied file is sent down a bounded
//! channel as soon as it is done; the first failure is sent last and ends
//! the run. The lock is released exactly once unless taking it failed.
//!
//! Consumers see the channel through [`MigrationStream`]. Dropping the
//! stream, or calling [`MigrationStream::cancel`], stops the run before the
//! next file.

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::driver::Driver;
use crate::error::{ApplyError, MigrateError, PartialApply};
use crate::file::MigrationFile;

/// One item of a [`MigrationStream`]
pub type ApplyResult = Result<Arc<MigrationFile>, ApplyError>;

/// Ordered results of one apply invocation.
///
/// Yields every applied file in apply order, then at most one error, then
/// ends. The end of the stream is the completion signal.
pub struct MigrationStream {
    rx: mpsc::Receiver<ApplyResult>,
    token: CancellationToken,
    _guard: DropGuard,
}

impl MigrationStream {
    /// Ask the run to stop before its next file. The file currently being
    /// applied still finishes and is reported.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Receive the next result, `None` once the run is over
    pub async fn next_result(&mut self) -> Option<ApplyResult> {
        self.rx.recv().await
    }

    /// Drain the stream, collecting applied files until it ends or a
    /// failure arrives.
    pub async fn wait(mut self) -> Result<Vec<Arc<MigrationFile>>, PartialApply> {
        let mut applied = Vec::new();
        while let Some(result) = self.rx.recv().await {
            match result {
                Ok(file) => applied.push(file),
                Err(failure) => return Err(PartialApply { applied, failure }),
            }
        }
        Ok(applied)
    }
}

impl Stream for MigrationStream {
    type Item = ApplyResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for MigrationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStream")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Producer side of a [`MigrationStream`]
#[derive(Debug, Clone)]
pub(crate) struct ResultSender {
    tx: mpsc::Sender<ApplyResult>,
    token: CancellationToken,
}

impl ResultSender {
    /// Send a result. Returns `false` when nobody is listening any more.
    pub(crate) async fn send(&self, result: ApplyResult) -> bool {
        self.tx.send(result).await.is_ok()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }

    fn is_listening(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Create a connected sender and stream buffering `capacity` results
pub(crate) fn channel(capacity: usize) -> (ResultSender, MigrationStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let token = CancellationToken::new();
    let stream = MigrationStream {
        rx,
        token: token.clone(),
        _guard: token.clone().drop_guard(),
    };
    (ResultSender { tx, token }, stream)
}

/// How the file loop ended
enum Outcome {
    Completed(usize),
    Failed(ApplyError),
    Cancelled,
}

/// Runs selected files against a driver under its lock
#[derive(Clone)]
pub struct ApplyEngine {
    driver: Arc<dyn Driver>,
}

impl ApplyEngine {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    /// Apply a fixed sequence of files in a background task
    pub fn apply(&self, files: Vec<Arc<MigrationFile>>, capacity: usize) -> MigrationStream {
        self.spawn(capacity, move |_| files)
    }

    /// Apply the files `select` picks for the version read under the lock,
    /// in a background task
    pub fn spawn<S>(&self, capacity: usize, select: S) -> MigrationStream
    where
        S: FnOnce(u64) -> Vec<Arc<MigrationFile>> + Send + 'static,
    {
        let (sender, stream) = channel(capacity);
        let engine = self.clone();
        tokio::spawn(async move { engine.run(&sender, select).await });
        stream
    }

    /// Lock, select, apply, release. Results go to `sender`.
    pub(crate) async fn run<S>(&self, sender: &ResultSender, select: S)
    where
        S: FnOnce(u64) -> Vec<Arc<MigrationFile>>,
    {
        if let Err(e) = self.driver.lock().await {
            warn!(driver = self.driver.name(), "Could not take migration lock: {}", e);
            sender.send(Err(ApplyError::setup(e))).await;
            return;
        }

        let outcome = self.apply_locked(sender, select).await;
        let released = self.driver.release().await;

        match outcome {
            Outcome::Completed(count) => match released {
                Ok(()) => info!(count, "Migrations applied"),
                Err(e) => {
                    sender.send(Err(ApplyError::setup(e))).await;
                }
            },
            Outcome::Failed(failure) => {
                if let Err(e) = released {
                    error!("Lock release after failed migration also failed: {}", e);
                }
                sender.send(Err(failure)).await;
            }
            Outcome::Cancelled => {
                if let Err(e) = released {
                    error!("Lock release after cancellation failed: {}", e);
                }
                info!("Migration run cancelled");
                if sender.is_listening() {
                    sender.send(Err(ApplyError::setup(MigrateError::Cancelled))).await;
                }
            }
        }
    }

    async fn apply_locked<S>(&self, sender: &ResultSender, select: S) -> Outcome
    where
        S: FnOnce(u64) -> Vec<Arc<MigrationFile>>,
    {
        let version = match self.driver.version().await {
            Ok(version) => version,
            Err(e) => return Outcome::Failed(ApplyError::setup(e)),
        };

        let files = select(version);
        debug!(version, count = files.len(), "Selected migrations");

        let mut applied = 0;
        for file in files {
            if sender.is_cancelled() {
                return Outcome::Cancelled;
            }

            let span = info_span!(
                "migration",
                file = %file.file_name(),
                version = file.version(),
                direction = %file.direction()
            );
            let result = async {
                file.content().await?;
                self.driver.migrate(&file).await
            }
            .instrument(span)
            .await;

            match result {
                Ok(()) => {
                    debug!(file = %file.file_name(), "Migration applied");
                    applied += 1;
                    if !sender.send(Ok(file)).await {
                        return Outcome::Cancelled;
                    }
                }
                Err(e) => {
                    warn!(file = %file.file_name(), "Migration failed: {}", e);
                    if !self.driver.capabilities().transactional {
                        warn!(
                            driver = self.driver.name(),
                            file = %file.file_name(),
                            "Driver is not transactional, statements before the failure may remain applied"
                        );
                    }
                    return Outcome::Failed(ApplyError::at(file, e));
                }
            }
        }

        Outcome::Completed(applied)
    }
}
