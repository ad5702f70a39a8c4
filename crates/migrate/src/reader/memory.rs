//! In-memory reader for tests and embedded migrations

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{RawFile, Reader};
use crate::error::MigrateResult;
use crate::file::BytesContent;

/// Serves migration files from a name → body map
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file
    pub fn with_file(mut self, file_name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(file_name.into(), content.into());
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for MemoryReader
where
    K: Into<String>,
    V: Into<Vec<u8>>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            files: iter
                .into_iter()
                .map(|(name, body)| (name.into(), body.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl Reader for MemoryReader {
    async fn read(&self) -> MigrateResult<Vec<RawFile>> {
        Ok(self
            .files
            .iter()
            .map(|(name, body)| RawFile::new(name.clone(), Arc::new(BytesContent::new(body.clone()))))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_reader() {
        let reader: MemoryReader = [
            ("1_a.up.sql", "CREATE TABLE a (id INTEGER);"),
            ("1_a.down.sql", "DROP TABLE a;"),
        ]
        .into_iter()
        .collect();
        assert_eq!(reader.len(), 2);

        let files = reader.read().await.unwrap();
        assert_eq!(files.len(), 2);
        let down = files.iter().find(|f| f.file_name == "1_a.down.sql").unwrap();
        assert_eq!(down.content.load().await.unwrap(), b"DROP TABLE a;");
    }
}
