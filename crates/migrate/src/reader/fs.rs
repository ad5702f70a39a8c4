//! Directory reader

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{RawFile, Reader};
use crate::error::{MigrateError, MigrateResult};
use crate::file::FsContent;

/// Reads migration files from a single directory (not recursive).
/// File bodies are read from disk only when a file is applied.
#[derive(Debug, Clone)]
pub struct DirectoryReader {
    path: PathBuf,
}

impl DirectoryReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Reader for DirectoryReader {
    async fn read(&self) -> MigrateResult<Vec<RawFile>> {
        let mut entries = tokio::fs::read_dir(&self.path).await.map_err(|e| {
            MigrateError::Reader(format!(
                "Failed to read migrations directory {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MigrateError::Reader(format!("Failed to read directory entry: {}", e)))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| MigrateError::Reader(format!("Failed to stat directory entry: {}", e)))?;
            if !file_type.is_file() {
                continue;
            }

            let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                debug!("Skipping non UTF-8 file name {:?}", entry.file_name());
                continue;
            };

            files.push(RawFile::new(file_name, Arc::new(FsContent::new(entry.path()))));
        }

        debug!(path = %self.path.display(), "Found {} file(s)", files.len());
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_files_lazily() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("001_init.up.sql"), "CREATE TABLE a (id INTEGER);").unwrap();
        fs::write(temp_dir.path().join("001_init.down.sql"), "DROP TABLE a;").unwrap();
        fs::create_dir(temp_dir.path().join("002_dir.up.sql")).unwrap();

        let reader = DirectoryReader::new(temp_dir.path());
        let mut files = reader.read().await.unwrap();
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));

        let names: Vec<&str> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["001_init.down.sql", "001_init.up.sql"]);

        // Content is read on demand, so a deleted file only fails at load time
        fs::remove_file(temp_dir.path().join("001_init.down.sql")).unwrap();
        assert!(files[0].content.load().await.is_err());
        assert_eq!(files[1].content.load().await.unwrap(), b"CREATE TABLE a (id INTEGER);");
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let reader = DirectoryReader::new("/definitely/not/here");
        assert!(matches!(reader.read().await, Err(MigrateError::Reader(_))));
    }
}
