//! # elif-migrate
//!
//! Versioned, reversible SQL migrations for the elif.rs framework.
//!
//! ## Features
//!
//! - **Versioned files**: `<version>_<name>.<up|down>.<ext>` pairs grouped by version
//! - **Lock-protected apply**: one lock/release pair brackets every run
//! - **Streaming results**: applied files are reported as they complete
//! - **Cancellation**: dropping or cancelling a stream stops the run between files
//! - **Multi-backend support**: SQLite, PostgreSQL, MySQL and an in-memory driver
//!
//! ## Quick Start
//!
//! ```rust
//! use elif_migrate::{MemoryDriver, MemoryReader, MigrateConfig, Migrator};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let reader = MemoryReader::new()
//!     .with_file("1_create_users.up.sql", "CREATE TABLE users (id INTEGER);")
//!     .with_file("1_create_users.down.sql", "DROP TABLE users;");
//!
//! let migrator = Migrator::new(
//!     Arc::new(MemoryDriver::new()),
//!     Arc::new(reader),
//!     MigrateConfig::default(),
//! );
//!
//! let applied = migrator.up().await.unwrap();
//! assert_eq!(applied.len(), 1);
//! assert_eq!(migrator.version().await.unwrap(), 1);
//! # });
//! ```

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod file;
pub mod manager;
pub mod migration;
pub mod migrator;
pub mod reader;

// Re-export main types
pub use config::{MigrateConfig, MigrateConfigBuilder, UnparsedFilePolicy};
pub use driver::{Driver, DriverCapabilities, DriverRegistry, LockInfo, MemoryDriver};
pub use engine::{ApplyEngine, ApplyResult, MigrationStream};
pub use error::{ApplyError, MigrateError, MigrateResult, PartialApply};
pub use file::{format_file_name, Direction, MigrationFile};
pub use manager::MigrationManager;
pub use migration::Migration;
pub use migrator::{Applied, Migrator};
pub use reader::{DirectoryReader, MemoryReader, RawFile, Reader};

#[cfg(feature = "mysql")]
pub use driver::MySqlDriver;
#[cfg(feature = "postgres")]
pub use driver::PostgresDriver;
#[cfg(feature = "sqlite")]
pub use driver::SqliteDriver;
