//! Migration files
//!
//! A [`MigrationFile`] is one parsed `<version>_<name>.<up|down>.<ext>`
//! file. Parsing only looks at the name; the body is fetched from its
//! [`ContentSource`] the first time it is requested and cached from then on.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::error::{MigrateError, MigrateResult};

/// Migration direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Apply the migration
    Up,
    /// Revert the migration
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(MigrateError::parse(
                other,
                "direction must be exactly 'up' or 'down'",
            )),
        }
    }
}

/// Where the body of a migration file comes from
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Load the full body. Called at most once per successfully loaded file.
    async fn load(&self) -> std::io::Result<Vec<u8>>;
}

/// Content read from a path on disk
#[derive(Debug, Clone)]
pub struct FsContent {
    path: PathBuf,
}

impl FsContent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ContentSource for FsContent {
    async fn load(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }
}

/// Content already held in memory
#[derive(Debug, Clone)]
pub struct BytesContent(Arc<[u8]>);

impl BytesContent {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self(Arc::from(bytes))
    }
}

#[async_trait]
impl ContentSource for BytesContent {
    async fn load(&self) -> std::io::Result<Vec<u8>> {
        Ok(self.0.to_vec())
    }
}

/// Compiled file name pattern for one extension
#[derive(Debug, Clone)]
pub struct FileNameParser {
    extension: String,
    pattern: Regex,
}

impl FileNameParser {
    /// Build a parser for files ending in `.<extension>` (no leading dot)
    pub fn new(extension: &str) -> MigrateResult<Self> {
        let extension = extension.trim_start_matches('.');
        if extension.is_empty() {
            return Err(MigrateError::Configuration(
                "migration file extension must not be empty".to_string(),
            ));
        }

        let pattern = Regex::new(&format!(
            r"^([0-9]+)_(.*)\.(up|down)\.{}$",
            regex::escape(extension)
        ))
        .map_err(|e| MigrateError::Configuration(format!("Invalid extension pattern: {}", e)))?;

        Ok(Self {
            extension: extension.to_string(),
            pattern,
        })
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Split a file name into `(version, name, direction)`
    pub fn parse_name(&self, file_name: &str) -> MigrateResult<(u64, String, Direction)> {
        let captures = self.pattern.captures(file_name).ok_or_else(|| {
            MigrateError::parse(
                file_name,
                format!(
                    "expected <version>_<name>.<up|down>.{}",
                    self.extension
                ),
            )
        })?;

        let version = captures[1].parse::<u64>().map_err(|e| {
            MigrateError::parse(file_name, format!("invalid version '{}': {}", &captures[1], e))
        })?;
        let direction = captures[3].parse::<Direction>()?;

        Ok((version, captures[2].to_string(), direction))
    }

    /// Parse a file name and attach its content source
    pub fn parse(
        &self,
        file_name: &str,
        content: Arc<dyn ContentSource>,
    ) -> MigrateResult<MigrationFile> {
        let (version, name, direction) = self.parse_name(file_name)?;
        Ok(MigrationFile {
            file_name: file_name.to_string(),
            version,
            name,
            direction,
            source: content,
            content: OnceCell::new(),
        })
    }
}

/// One migration file
pub struct MigrationFile {
    file_name: String,
    version: u64,
    name: String,
    direction: Direction,
    source: Arc<dyn ContentSource>,
    content: OnceCell<Vec<u8>>,
}

impl MigrationFile {
    /// Parse `file_name` for the given extension
    pub fn parse(
        file_name: &str,
        extension: &str,
        content: Arc<dyn ContentSource>,
    ) -> MigrateResult<Self> {
        FileNameParser::new(extension)?.parse(file_name, content)
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the body has been loaded already
    pub fn is_loaded(&self) -> bool {
        self.content.initialized()
    }

    /// The file body, loaded on first access and cached afterwards.
    ///
    /// A failed load is not cached; the next call tries again.
    pub async fn content(&self) -> MigrateResult<&[u8]> {
        let bytes = self
            .content
            .get_or_try_init(|| async {
                tracing::debug!(file = %self.file_name, "Loading migration content");
                self.source
                    .load()
                    .await
                    .map_err(|source| MigrateError::ContentRead {
                        file_name: self.file_name.clone(),
                        source,
                    })
            })
            .await?;
        Ok(bytes.as_slice())
    }

    /// The body as UTF-8 text
    pub async fn content_str(&self) -> MigrateResult<&str> {
        let bytes = self.content().await?;
        std::str::from_utf8(bytes).map_err(|e| MigrateError::ContentRead {
            file_name: self.file_name.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }
}

impl fmt::Debug for MigrationFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationFile")
            .field("file_name", &self.file_name)
            .field("version", &self.version)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Build the canonical file name for a migration
pub fn format_file_name(version: u64, name: &str, direction: Direction, extension: &str) -> String {
    format!(
        "{}_{}.{}.{}",
        version,
        name,
        direction,
        extension.trim_start_matches('.')
    )
}

/// 1-based line and column of a byte offset inside `data`.
///
/// Offsets past the end are clamped to the end of the data.
pub fn line_column_from_offset(data: &[u8], offset: usize) -> (usize, usize) {
    let offset = offset.min(data.len());
    let before = &data[..offset];
    let line = before.iter().filter(|&&b| b == b'\n').count() + 1;
    let line_start = before
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    (line, offset - line_start + 1)
}

/// The lines surrounding 1-based `line`: `before` lines above it, the line
/// itself and `after` lines below. With `numbered`, each line is prefixed
/// with its right-aligned line number.
pub fn lines_around(data: &[u8], line: usize, before: usize, after: usize, numbered: bool) -> String {
    let text = String::from_utf8_lossy(data);
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.is_empty() || line == 0 {
        return String::new();
    }

    let first = line.saturating_sub(before).max(1);
    let last = (line + after).min(lines.len());
    if first > last {
        return String::new();
    }
    let width = last.to_string().len();

    (first..=last)
        .map(|number| {
            let content = lines[number - 1];
            if numbered {
                format!("{:>width$}: {}", number, content, width = width)
            } else {
                content.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        body: &'static [u8],
    }

    #[async_trait]
    impl ContentSource for CountingSource {
        async fn load(&self) -> std::io::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.to_vec())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ContentSource for FailingSource {
        async fn load(&self) -> std::io::Result<Vec<u8>> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
        }
    }

    fn content() -> Arc<dyn ContentSource> {
        Arc::new(BytesContent::new("test"))
    }

    #[test]
    fn test_parse_valid_names() {
        let cases = [
            ("001_test_file.up.sql", 1, "test_file", Direction::Up),
            ("001_test_file.down.sql", 1, "test_file", Direction::Down),
            ("10034_test_file.down.sql", 10034, "test_file", Direction::Down),
            ("0000_.up.sql", 0, "", Direction::Up),
            ("7_add.up.index.up.sql", 7, "add.up.index", Direction::Up),
        ];

        for (file_name, version, name, direction) in cases {
            let file = MigrationFile::parse(file_name, "sql", content()).unwrap();
            assert_eq!(file.version(), version, "{}", file_name);
            assert_eq!(file.name(), name, "{}", file_name);
            assert_eq!(file.direction(), direction, "{}", file_name);
            assert_eq!(file.file_name(), file_name);
        }
    }

    #[test]
    fn test_parse_invalid_names() {
        let invalid = [
            "-1_test_file.down.sql",
            "test_file.down.sql",
            "100_test_file.down",
            "100_test_file.sql",
            "100_test_file",
            "test_file",
            "100",
            ".sql",
            "up.sql",
            "down.sql",
            "100_test_file.sideways.sql",
            "100_test_file.up.cql",
            "99999999999999999999999_overflow.up.sql",
        ];

        for file_name in invalid {
            let result = MigrationFile::parse(file_name, "sql", content());
            assert!(
                matches!(result, Err(MigrateError::Parse { .. })),
                "expected parse error for {}",
                file_name
            );
        }
    }

    #[test]
    fn test_extension_is_literal() {
        let parser = FileNameParser::new("c.l").unwrap();
        assert!(parser.parse_name("1_x.up.c.l").is_ok());
        assert!(parser.parse_name("1_x.up.cxl").is_err());
        assert!(FileNameParser::new("").is_err());
        assert_eq!(FileNameParser::new(".cql").unwrap().extension(), "cql");
    }

    #[test]
    fn test_format_then_parse() {
        let parser = FileNameParser::new("sql").unwrap();
        for (version, name, direction) in [
            (1, "create_users", Direction::Up),
            (20240101120000, "drop users table", Direction::Down),
        ] {
            let file_name = format_file_name(version, name, direction, "sql");
            assert_eq!(
                parser.parse_name(&file_name).unwrap(),
                (version, name.to_string(), direction)
            );
        }
    }

    #[tokio::test]
    async fn test_content_is_loaded_once() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            body: b"CREATE TABLE t (id INTEGER);",
        });
        let file = MigrationFile::parse("1_t.up.sql", "sql", source.clone()).unwrap();
        assert!(!file.is_loaded());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);

        let first = file.content().await.unwrap().to_vec();
        let second = file.content().await.unwrap().to_vec();

        assert_eq!(first, second);
        assert_eq!(first, b"CREATE TABLE t (id INTEGER);");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(file.is_loaded());
    }

    #[tokio::test]
    async fn test_empty_content_is_cached() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            body: b"",
        });
        let file = MigrationFile::parse("1_t.up.sql", "sql", source.clone()).unwrap();
        assert!(file.content().await.unwrap().is_empty());
        assert!(file.content().await.unwrap().is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_content_error_surfaces_on_access() {
        let file = MigrationFile::parse("1_t.up.sql", "sql", Arc::new(FailingSource)).unwrap();
        let err = file.content().await.unwrap_err();
        assert!(matches!(err, MigrateError::ContentRead { ref file_name, .. } if file_name == "1_t.up.sql"));
        assert!(!file.is_loaded());
    }

    #[test]
    fn test_line_column_from_offset() {
        let data = b"SELECT 1;\nSELEC 2;\nSELECT 3;";
        assert_eq!(line_column_from_offset(data, 0), (1, 1));
        assert_eq!(line_column_from_offset(data, 10), (2, 1));
        assert_eq!(line_column_from_offset(data, 14), (2, 5));
        assert_eq!(line_column_from_offset(data, 1000), (3, 10));
    }

    #[test]
    fn test_lines_around() {
        let data = b"a\nb\nc\nd\ne";
        assert_eq!(lines_around(data, 3, 1, 1, false), "b\nc\nd");
        assert_eq!(lines_around(data, 1, 5, 1, true), "1: a\n2: b");
        assert_eq!(lines_around(data, 5, 0, 5, true), "5: e");

        let long: Vec<u8> = (1..=12).map(|n| n.to_string()).collect::<Vec<_>>().join("\n").into_bytes();
        assert_eq!(lines_around(&long, 10, 1, 5, true), " 9: 9\n10: 10\n11: 11\n12: 12");
    }
}
