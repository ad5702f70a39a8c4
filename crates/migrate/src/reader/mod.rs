//! Readers enumerate raw migration files.
//!
//! A reader only produces names and content sources; parsing and the
//! handling of unparsable names happen when the
//! [`MigrationManager`](crate::manager::MigrationManager) is built.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::error::MigrateResult;
use crate::file::ContentSource;

pub mod fs;
pub mod memory;

pub use fs::DirectoryReader;
pub use memory::MemoryReader;

/// An unparsed migration file
#[derive(Clone)]
pub struct RawFile {
    pub file_name: String,
    pub content: Arc<dyn ContentSource>,
}

impl RawFile {
    pub fn new(file_name: impl Into<String>, content: Arc<dyn ContentSource>) -> Self {
        Self {
            file_name: file_name.into(),
            content,
        }
    }
}

impl fmt::Debug for RawFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFile")
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

/// Source of migration files
#[async_trait]
pub trait Reader: Send + Sync {
    /// List every candidate file
    async fn read(&self) -> MigrateResult<Vec<RawFile>>;
}
