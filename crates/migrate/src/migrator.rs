//! Orchestrator tying a reader, a driver and the apply engine together
//!
//! Each `*_async` operation returns a [`MigrationStream`] right away and does
//! its work in a background task: initialize the driver, build the manager
//! from the reader (cached after the first success), then hand the selection
//! to the [`ApplyEngine`]. The selection itself runs under the driver lock
//! against the version read there.
//!
//! The plain operations drain that stream and return the applied files or a
//! [`PartialApply`] describing how far they got.

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, info_span, warn, Instrument};

use crate::config::MigrateConfig;
use crate::driver::{Driver, DriverRegistry, LockInfo};
use crate::engine::{self, ApplyEngine, MigrationStream};
use crate::error::{ApplyError, MigrateResult, PartialApply};
use crate::file::MigrationFile;
use crate::manager::MigrationManager;
use crate::reader::{DirectoryReader, Reader};

/// Files applied by a collecting operation
pub type Applied = Result<Vec<Arc<MigrationFile>>, PartialApply>;

struct MigratorInner {
    driver: Arc<dyn Driver>,
    reader: Arc<dyn Reader>,
    config: MigrateConfig,
    manager: OnceCell<Arc<MigrationManager>>,
}

impl MigratorInner {
    async fn manager(&self) -> MigrateResult<Arc<MigrationManager>> {
        self.manager
            .get_or_try_init(|| async {
                let files = self.reader.read().await?;
                let manager = MigrationManager::build(
                    files,
                    self.driver.file_extension(),
                    *self.config.get_unparsed_files(),
                )?;
                Ok::<_, crate::error::MigrateError>(Arc::new(manager))
            })
            .await
            .cloned()
    }

    async fn prepare(&self) -> MigrateResult<Arc<MigrationManager>> {
        self.driver.initialize().await?;
        self.manager().await
    }
}

/// Runs migrations from one source against one target
#[derive(Clone)]
pub struct Migrator {
    inner: Arc<MigratorInner>,
}

impl Migrator {
    pub fn new(driver: Arc<dyn Driver>, reader: Arc<dyn Reader>, config: MigrateConfig) -> Self {
        Self {
            inner: Arc::new(MigratorInner {
                driver,
                reader,
                config,
                manager: OnceCell::new(),
            }),
        }
    }

    /// Open the driver for `config.database_url` through `registry` and read
    /// files from `config.migrations_dir`
    pub fn from_config(registry: &DriverRegistry, config: MigrateConfig) -> MigrateResult<Self> {
        config.validate()?;
        let driver = registry.open(config.require_database_url()?, &config)?;
        let reader = Arc::new(DirectoryReader::new(config.get_migrations_dir().clone()));
        Ok(Self::new(driver, reader, config))
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    pub fn config(&self) -> &MigrateConfig {
        &self.inner.config
    }

    /// The migrations known to this migrator
    pub async fn migrations(&self) -> MigrateResult<Arc<MigrationManager>> {
        self.inner.manager().await
    }

    fn start<S>(&self, operation: &'static str, select: S) -> MigrationStream
    where
        S: FnOnce(&MigrationManager, u64) -> Vec<Arc<MigrationFile>> + Send + 'static,
    {
        let (sender, stream) = engine::channel(*self.inner.config.get_channel_capacity());
        let inner = self.inner.clone();
        let span = info_span!("migrate", operation, driver = inner.driver.name());

        tokio::spawn(
            async move {
                let manager = match inner.prepare().await {
                    Ok(manager) => manager,
                    Err(e) => {
                        warn!("Migration setup failed: {}", e);
                        sender.send(Err(ApplyError::setup(e))).await;
                        return;
                    }
                };

                ApplyEngine::new(inner.driver.clone())
                    .run(&sender, move |version| select(manager.as_ref(), version))
                    .await;
            }
            .instrument(span),
        );

        stream
    }

    /// Apply every pending up migration
    pub fn up_async(&self) -> MigrationStream {
        self.start("up", |manager, version| manager.to_last_from(version))
    }

    /// Roll back every applied migration
    pub fn down_async(&self) -> MigrationStream {
        self.start("down", |manager, version| manager.to_first_from(version))
    }

    /// Apply `relative` files: up when positive, down when negative
    pub fn migrate_async(&self, relative: i64) -> MigrationStream {
        self.start("migrate", move |manager, version| manager.from(version, relative))
    }

    /// Move towards `target`, treating the version difference as a step count
    pub fn goto_async(&self, target: u64) -> MigrationStream {
        self.start("goto", move |manager, version| manager.goto(version, target))
    }

    pub async fn up(&self) -> Applied {
        self.up_async().wait().await
    }

    pub async fn down(&self) -> Applied {
        self.down_async().wait().await
    }

    pub async fn migrate(&self, relative: i64) -> Applied {
        self.migrate_async(relative).wait().await
    }

    pub async fn goto(&self, target: u64) -> Applied {
        self.goto_async(target).wait().await
    }

    /// Roll everything back, then apply everything again
    pub async fn reset(&self) -> Applied {
        let down = self.down().await?;
        chain(down, self.up().await)
    }

    /// Roll back the latest migration and apply it again
    pub async fn redo(&self) -> Applied {
        let back = self.migrate(-1).await?;
        chain(back, self.migrate(1).await)
    }

    /// Latest applied version, 0 when nothing has been applied
    pub async fn version(&self) -> MigrateResult<u64> {
        self.inner.driver.initialize().await?;
        self.inner.driver.version().await
    }

    /// Remove the lock regardless of its holder
    pub async fn force_unlock(&self) -> MigrateResult<()> {
        let holder = self.inner.driver.lock_info().await?;
        self.inner.driver.force_release().await?;
        match holder {
            Some(info) => warn!("Forcibly removed migration lock {}", info),
            None => info!("Migration lock was not held"),
        }
        Ok(())
    }

    /// Current lock holder, if any
    pub async fn lock_info(&self) -> MigrateResult<Option<LockInfo>> {
        self.inner.driver.lock_info().await
    }

    /// Close the driver
    pub async fn close(&self) -> MigrateResult<()> {
        self.inner.driver.close().await
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("driver", &self.inner.driver.name())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Append the outcome of a second step to the files of a first one
fn chain(mut first: Vec<Arc<MigrationFile>>, second: Applied) -> Applied {
    match second {
        Ok(files) => {
            first.extend(files);
            Ok(first)
        }
        Err(mut partial) => {
            first.append(&mut partial.applied);
            partial.applied = first;
            Err(partial)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::error::MigrateError;
    use crate::reader::MemoryReader;

    fn migrator(driver: &MemoryDriver) -> Migrator {
        let reader = MemoryReader::new()
            .with_file("1_users.up.sql", "CREATE TABLE users (id INTEGER);")
            .with_file("1_users.down.sql", "DROP TABLE users;")
            .with_file("2_posts.up.sql", "CREATE TABLE posts (id INTEGER);")
            .with_file("2_posts.down.sql", "DROP TABLE posts;");
        Migrator::new(Arc::new(driver.clone()), Arc::new(reader), MigrateConfig::default())
    }

    fn names(files: &[Arc<MigrationFile>]) -> Vec<&str> {
        files.iter().map(|f| f.file_name()).collect()
    }

    #[tokio::test]
    async fn test_up_then_down() {
        let driver = MemoryDriver::new();
        let migrator = migrator(&driver);

        let up = migrator.up().await.unwrap();
        assert_eq!(names(&up), vec!["1_users.up.sql", "2_posts.up.sql"]);
        assert_eq!(migrator.version().await.unwrap(), 2);

        let down = migrator.down().await.unwrap();
        assert_eq!(names(&down), vec!["2_posts.down.sql", "1_users.down.sql"]);
        assert_eq!(migrator.version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_init_failure_is_sole_result() {
        let driver = MemoryDriver::new().fail_initialize();
        let migrator = migrator(&driver);

        let err = migrator.up().await.unwrap_err();
        assert_eq!(err.applied_count(), 0);
        assert!(matches!(err.error(), MigrateError::DriverInit(_)));
        assert_eq!(driver.calls().lock, 0);
    }

    #[test]
    fn test_chain_keeps_first_files() {
        let file = |name: &str| {
            Arc::new(
                MigrationFile::parse(name, "sql", Arc::new(crate::file::BytesContent::new(""))).unwrap(),
            )
        };
        let partial = PartialApply {
            applied: vec![file("1_a.up.sql")],
            failure: ApplyError::setup(MigrateError::Cancelled),
        };

        let err = chain(vec![file("1_a.down.sql")], Err(partial)).unwrap_err();
        assert_eq!(names(&err.applied), vec!["1_a.down.sql", "1_a.up.sql"]);
    }
}
