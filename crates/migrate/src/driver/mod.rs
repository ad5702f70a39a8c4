//! Driver contract and registry
//!
//! A [`Driver`] adapts one storage backend to the engine: it persists the
//! current version, applies a single file, and provides the advisory lock
//! that keeps two migrators from moving the version at the same time.
//!
//! Drivers are looked up by URL scheme through a [`DriverRegistry`] that the
//! caller builds and hands to the [`Migrator`](crate::Migrator).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::MigrateConfig;
use crate::error::{MigrateError, MigrateResult};
use crate::file::MigrationFile;

pub mod memory;
pub mod sql;

#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryDriver;
#[cfg(feature = "mysql")]
pub use mysql::MySqlDriver;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDriver;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDriver;

/// What a driver guarantees about applying one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCapabilities {
    /// A file body and its version update commit or fail as one unit.
    /// Files may still opt out (see [`sql::NO_TRANSACTION_MARKER`]). When
    /// false, statements run one by one and a failure can leave the
    /// statements before it applied.
    pub transactional: bool,
}

impl Default for DriverCapabilities {
    fn default() -> Self {
        Self { transactional: true }
    }
}

/// Current holder of the lock sentinel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Token of the process that took the lock
    pub holder: String,
    /// When the lock was taken, if the backend recorded it
    pub locked_at: Option<DateTime<Utc>>,
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.locked_at {
            Some(at) => write!(f, "held by {} since {}", self.holder, at.to_rfc3339()),
            None => write!(f, "held by {}", self.holder),
        }
    }
}

/// Storage backend contract
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    /// Open connections and make sure the version table exists.
    /// Called before every operation, so it must be idempotent.
    async fn initialize(&self) -> MigrateResult<()>;

    /// Close any open connections
    async fn close(&self) -> MigrateResult<()>;

    /// Extension of the migration files this driver runs, without the dot
    fn file_extension(&self) -> &str {
        "sql"
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    /// Latest applied version, 0 when nothing has been applied
    async fn version(&self) -> MigrateResult<u64>;

    /// Apply `file` and move the persisted version accordingly: an up file
    /// for V makes V current, a down file for V removes it. On failure the
    /// persisted version must be left untouched.
    async fn migrate(&self, file: &MigrationFile) -> MigrateResult<()>;

    /// Take the lock sentinel, failing if someone else holds it
    async fn lock(&self) -> MigrateResult<()>;

    /// Remove the lock sentinel taken by [`Driver::lock`]
    async fn release(&self) -> MigrateResult<()>;

    /// Remove the lock sentinel regardless of who holds it
    async fn force_release(&self) -> MigrateResult<()>;

    /// Who holds the lock, if anyone
    async fn lock_info(&self) -> MigrateResult<Option<LockInfo>>;
}

/// Creates a driver for a URL
pub type DriverFactory =
    Arc<dyn Fn(&str, &MigrateConfig) -> MigrateResult<Arc<dyn Driver>> + Send + Sync>;

/// Scheme → driver factory map
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver compiled into this build
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register("memory", |_, _| Ok(Arc::new(MemoryDriver::new()) as Arc<dyn Driver>));

        #[cfg(feature = "sqlite")]
        registry.register("sqlite", |url, config| {
            Ok(Arc::new(SqliteDriver::new(url, config.clone())?) as Arc<dyn Driver>)
        });

        #[cfg(feature = "postgres")]
        {
            let factory = |url: &str, config: &MigrateConfig| -> MigrateResult<Arc<dyn Driver>> {
                Ok(Arc::new(PostgresDriver::new(url, config.clone())?) as Arc<dyn Driver>)
            };
            registry.register("postgres", factory);
            registry.register("postgresql", factory);
        }

        #[cfg(feature = "mysql")]
        registry.register("mysql", |url, config| {
            Ok(Arc::new(MySqlDriver::new(url, config.clone())?) as Arc<dyn Driver>)
        });

        registry
    }

    /// Register a factory for `scheme`, replacing any previous one
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&str, &MigrateConfig) -> MigrateResult<Arc<dyn Driver>> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.to_lowercase(), Arc::new(factory));
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_lowercase())
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Create the driver responsible for `url`
    pub fn open(&self, url: &str, config: &MigrateConfig) -> MigrateResult<Arc<dyn Driver>> {
        let scheme = detect_scheme(url)?;
        let factory = self
            .factories
            .get(&scheme)
            .ok_or_else(|| MigrateError::UnknownDriver(scheme.clone()))?;

        tracing::debug!(scheme = %scheme, "Opening migration driver");
        factory(url, config)
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

/// Scheme of a database URL, lower-cased
fn detect_scheme(url: &str) -> MigrateResult<String> {
    match url::Url::parse(url) {
        Ok(parsed) => Ok(parsed.scheme().to_lowercase()),
        Err(e) => Err(MigrateError::Configuration(format!(
            "Unable to detect driver from URL '{}': {}",
            url, e
        ))),
    }
}
