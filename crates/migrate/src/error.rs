//! Error types for the migration system
//!
//! Every failure the engine can surface is a [`MigrateError`]. Streamed
//! failures additionally carry the file that was being applied
//! ([`ApplyError`]), and the collecting wrappers report what got applied
//! before things went wrong ([`PartialApply`]).

use std::sync::Arc;
use thiserror::Error;

use crate::file::MigrationFile;

/// Result type for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Migration errors
#[derive(Error, Debug)]
pub enum MigrateError {
    /// File name does not follow `<version>_<name>.<up|down>.<ext>`
    #[error("Unable to parse migration file name '{file_name}': {reason}")]
    Parse { file_name: String, reason: String },

    /// The body of a migration file could not be materialized
    #[error("Failed to read content of '{file_name}': {source}")]
    ContentRead {
        file_name: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection or setup failure inside a driver
    #[error("Driver initialization failed: {0}")]
    DriverInit(String),

    /// The lock sentinel could not be acquired
    #[error("Failed to acquire migration lock: {0}")]
    Lock(String),

    /// The lock sentinel could not be removed
    #[error("Failed to release migration lock: {0}")]
    Release(String),

    /// The target rejected a statement of a migration file
    #[error("Migration '{file_name}' failed: {detail}")]
    Execution { file_name: String, detail: String },

    /// The persisted version could not be read
    #[error("Failed to read current version: {0}")]
    Version(String),

    /// The reader could not enumerate migration files
    #[error("Failed to read migrations: {0}")]
    Reader(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No driver is registered for the URL scheme
    #[error("No driver registered for scheme '{0}'")]
    UnknownDriver(String),

    /// The apply task stopped before the selected files were exhausted
    #[error("Migration run was cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Build a [`MigrateError::Parse`]
    pub fn parse(file_name: impl Into<String>, reason: impl Into<String>) -> Self {
        MigrateError::Parse {
            file_name: file_name.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`MigrateError::Execution`]
    pub fn execution(file_name: impl Into<String>, detail: impl Into<String>) -> Self {
        MigrateError::Execution {
            file_name: file_name.into(),
            detail: detail.into(),
        }
    }

    /// Whether this error came from the lock protocol
    pub fn is_lock_error(&self) -> bool {
        matches!(self, MigrateError::Lock(_) | MigrateError::Release(_))
    }
}

/// A failed step of an apply run.
///
/// `file` is `None` when the failure happened outside of a single file,
/// e.g. while locking, reading the version or loading the manager.
#[derive(Error, Debug)]
#[error("{}", display_apply_error(.file, .source))]
pub struct ApplyError {
    pub file: Option<Arc<MigrationFile>>,
    #[source]
    pub source: MigrateError,
}

fn display_apply_error(file: &Option<Arc<MigrationFile>>, source: &MigrateError) -> String {
    match file {
        Some(file) => format!("{}: {}", file.file_name(), source),
        None => source.to_string(),
    }
}

impl ApplyError {
    /// A failure not tied to a particular file
    pub fn setup(source: MigrateError) -> Self {
        Self { file: None, source }
    }

    /// A failure while applying `file`
    pub fn at(file: Arc<MigrationFile>, source: MigrateError) -> Self {
        Self {
            file: Some(file),
            source,
        }
    }
}

/// Outcome of a collecting (non-streaming) operation that stopped early.
#[derive(Error, Debug)]
#[error("{failure} ({} migration(s) applied before the failure)", .applied.len())]
pub struct PartialApply {
    /// Files applied successfully before the failure, in apply order
    pub applied: Vec<Arc<MigrationFile>>,
    /// The failure that ended the run
    #[source]
    pub failure: ApplyError,
}

impl PartialApply {
    /// Number of files applied before the failure
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// The underlying error
    pub fn error(&self) -> &MigrateError {
        &self.failure.source
    }
}
