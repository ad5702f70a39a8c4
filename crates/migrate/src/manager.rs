//! Migration Manager - selects which files to run next
//!
//! The manager groups parsed files into [`Migration`] pairs keyed by version
//! and answers the selection questions the orchestrator asks: everything up
//! to the latest version, everything back to nothing, or `n` steps in either
//! direction.
//!
//! Counts are measured in files applied, not versions travelled: a version
//! that lacks the file for the requested direction is skipped without using
//! up one of the `n` steps.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::UnparsedFilePolicy;
use crate::error::{MigrateError, MigrateResult};
use crate::file::{Direction, FileNameParser, MigrationFile};
use crate::migration::Migration;
use crate::reader::RawFile;

/// Ordered set of migrations
#[derive(Debug, Clone, Default)]
pub struct MigrationManager {
    migrations: BTreeMap<u64, Migration>,
}

impl MigrationManager {
    /// Parse raw files and group them by version.
    ///
    /// Files whose names do not parse are handled according to `policy`;
    /// with anything but [`UnparsedFilePolicy::Reject`] they are left out of
    /// the set and the build carries on.
    pub fn build(
        files: Vec<RawFile>,
        extension: &str,
        policy: UnparsedFilePolicy,
    ) -> MigrateResult<Self> {
        let parser = FileNameParser::new(extension)?;
        let mut parsed = Vec::with_capacity(files.len());

        for raw in files {
            match parser.parse(&raw.file_name, raw.content) {
                Ok(file) => parsed.push(file),
                Err(e) => match policy {
                    UnparsedFilePolicy::Ignore => {
                        debug!(file = %raw.file_name, "Skipping unparsable migration file: {}", e)
                    }
                    UnparsedFilePolicy::Warn => {
                        warn!(file = %raw.file_name, "Skipping unparsable migration file: {}", e)
                    }
                    UnparsedFilePolicy::Reject => return Err(e),
                },
            }
        }

        Ok(Self::from_files(parsed))
    }

    /// Group already parsed files. A later file replaces an earlier one
    /// with the same version and direction.
    pub fn from_files(files: impl IntoIterator<Item = MigrationFile>) -> Self {
        let mut migrations: BTreeMap<u64, Migration> = BTreeMap::new();

        for file in files {
            let version = file.version();
            let file = Arc::new(file);
            let replaced = migrations
                .entry(version)
                .or_insert_with(|| Migration::new(version))
                .insert(file.clone());

            if let Some(previous) = replaced {
                warn!(
                    version,
                    kept = %file.file_name(),
                    dropped = %previous.file_name(),
                    "Duplicate {} migration for version", file.direction()
                );
            }
        }

        debug!("Loaded {} migration version(s)", migrations.len());
        Self { migrations }
    }

    /// Number of distinct versions
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Migrations in ascending version order
    pub fn migrations(&self) -> impl DoubleEndedIterator<Item = &Migration> {
        self.migrations.values()
    }

    pub fn get(&self, version: u64) -> Option<&Migration> {
        self.migrations.get(&version)
    }

    /// Highest version that has an up file
    pub fn latest_version(&self) -> Option<u64> {
        self.migrations
            .values()
            .rev()
            .find(|m| m.up_file().is_some())
            .map(Migration::version)
    }

    /// All up files above `version`, ascending
    pub fn to_last_from(&self, version: u64) -> Vec<Arc<MigrationFile>> {
        self.select(version, Direction::Up, usize::MAX)
    }

    /// All down files at or below `version`, descending
    pub fn to_first_from(&self, version: u64) -> Vec<Arc<MigrationFile>> {
        self.select(version, Direction::Down, usize::MAX)
    }

    /// Walk `relative` files from `version`: up files above it when positive,
    /// down files at or below it when negative, nothing for zero. Running out
    /// of migrations yields a shorter list rather than an error.
    pub fn from(&self, version: u64, relative: i64) -> Vec<Arc<MigrationFile>> {
        let count = usize::try_from(relative.unsigned_abs()).unwrap_or(usize::MAX);
        match relative.signum() {
            1 => self.select(version, Direction::Up, count),
            -1 => self.select(version, Direction::Down, count),
            _ => Vec::new(),
        }
    }

    /// Move from `current` towards `target` by treating the version
    /// difference as a relative step count.
    pub fn goto(&self, current: u64, target: u64) -> Vec<Arc<MigrationFile>> {
        let delta = i128::from(target) - i128::from(current);
        let relative = i64::try_from(delta).unwrap_or(if delta > 0 { i64::MAX } else { i64::MIN });
        self.from(current, relative)
    }

    fn select(&self, version: u64, direction: Direction, limit: usize) -> Vec<Arc<MigrationFile>> {
        let candidates: Box<dyn Iterator<Item = &Migration>> = match direction {
            Direction::Up => Box::new(self.migrations.range(version.saturating_add(1)..).map(|(_, m)| m)),
            Direction::Down => Box::new(self.migrations.range(..=version).rev().map(|(_, m)| m)),
        };

        // `version + 1` saturates at u64::MAX, which must not count as "above"
        let candidates = candidates.filter(|m| direction == Direction::Down || m.version() > version);

        candidates
            .filter_map(|m| m.file(direction).cloned())
            .take(limit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::BytesContent;

    fn raw(name: &str) -> RawFile {
        RawFile::new(name, Arc::new(BytesContent::new("")))
    }

    /// Versions 1, 2, 101, 301, 401 with 101 both ways, 301 up only and
    /// 401 down only.
    fn fixture() -> MigrationManager {
        let files = vec![
            raw("001_migrationfile.up.sql"),
            raw("001_migrationfile.down.sql"),
            raw("002_migrationfile.up.sql"),
            raw("002_migrationfile.down.sql"),
            raw("101_create_table.up.sql"),
            raw("101_drop_tables.down.sql"),
            raw("301_migrationfile.up.sql"),
            raw("401_migrationfile.down.sql"),
        ];
        MigrationManager::build(files, "sql", UnparsedFilePolicy::Warn).unwrap()
    }

    fn versions(files: &[Arc<MigrationFile>]) -> Vec<u64> {
        files.iter().map(|f| f.version()).collect()
    }

    #[test]
    fn test_build_groups_pairs() {
        let manager = fixture();
        assert_eq!(manager.len(), 5);

        let presence: Vec<(u64, bool, bool)> = manager
            .migrations()
            .map(|m| (m.version(), m.up_file().is_some(), m.down_file().is_some()))
            .collect();
        assert_eq!(
            presence,
            vec![
                (1, true, true),
                (2, true, true),
                (101, true, true),
                (301, true, false),
                (401, false, true),
            ]
        );
        assert_eq!(manager.latest_version(), Some(301));
    }

    #[test]
    fn test_build_skips_unparsable_files() {
        let files = vec![
            raw("001_ok.up.sql"),
            raw("README.md"),
            raw("002_missing_direction.sql"),
            raw("abc_bad.up.sql"),
        ];
        let manager = MigrationManager::build(files, "sql", UnparsedFilePolicy::Ignore).unwrap();
        assert_eq!(manager.len(), 1);
        assert!(manager.get(1).is_some());
    }

    #[test]
    fn test_build_reject_policy_fails() {
        let files = vec![raw("001_ok.up.sql"), raw("README.md")];
        let result = MigrationManager::build(files, "sql", UnparsedFilePolicy::Reject);
        assert!(matches!(result, Err(MigrateError::Parse { .. })));
    }

    #[test]
    fn test_duplicate_direction_last_wins() {
        let files = vec![raw("5_first.up.sql"), raw("5_second.up.sql")];
        let manager = MigrationManager::build(files, "sql", UnparsedFilePolicy::Warn).unwrap();
        assert_eq!(manager.get(5).unwrap().up_file().unwrap().name(), "second");
    }

    #[test]
    fn test_to_first_from() {
        let files = fixture().to_first_from(401);
        assert_eq!(versions(&files), vec![401, 101, 2, 1]);
        assert!(files.iter().all(|f| f.direction() == Direction::Down));

        assert_eq!(versions(&fixture().to_first_from(101)), vec![101, 2, 1]);
        assert!(fixture().to_first_from(0).is_empty());
    }

    #[test]
    fn test_to_last_from() {
        let files = fixture().to_last_from(1);
        assert_eq!(versions(&files), vec![2, 101, 301]);
        assert!(files.iter().all(|f| f.direction() == Direction::Up));

        assert!(fixture().to_last_from(301).is_empty());
        assert!(fixture().to_last_from(u64::MAX).is_empty());
    }

    #[test]
    fn test_from() {
        let manager = fixture();
        let cases: Vec<(u64, i64, Vec<u64>, Option<Direction>)> = vec![
            (0, 2, vec![1, 2], Some(Direction::Up)),
            (1, 4, vec![2, 101, 301], Some(Direction::Up)),
            (1, 0, vec![], None),
            (0, 1, vec![1], Some(Direction::Up)),
            (0, 0, vec![], None),
            (101, -2, vec![101, 2], Some(Direction::Down)),
            (401, -1, vec![401], Some(Direction::Down)),
            (350, -1, vec![101], Some(Direction::Down)),
            (0, -3, vec![], None),
        ];

        for (from, relative, expected, direction) in cases {
            let files = manager.from(from, relative);
            assert_eq!(versions(&files), expected, "from({}, {})", from, relative);
            if let Some(direction) = direction {
                assert!(files.iter().all(|f| f.direction() == direction));
            }
        }
    }

    #[test]
    fn test_from_zero_is_always_empty() {
        let manager = fixture();
        for version in [0, 1, 2, 101, 301, 401, u64::MAX] {
            assert!(manager.from(version, 0).is_empty());
        }
    }

    #[test]
    fn test_missing_direction_does_not_consume_a_step() {
        // 2 is down only and 3 is up only
        let files = vec![
            raw("1_a.up.sql"),
            raw("1_a.down.sql"),
            raw("2_b.down.sql"),
            raw("3_c.up.sql"),
            raw("4_d.up.sql"),
            raw("4_d.down.sql"),
        ];
        let manager = MigrationManager::build(files, "sql", UnparsedFilePolicy::Warn).unwrap();

        assert_eq!(versions(&manager.from(1, 1)), vec![3]);
        assert_eq!(versions(&manager.from(1, 2)), vec![3, 4]);
        assert_eq!(versions(&manager.from(4, -2)), vec![4, 2]);
        assert_eq!(versions(&manager.from(3, -1)), vec![2]);

        // nothing up-able after 301 in the shared fixture
        assert!(fixture().from(301, 1).is_empty());
    }

    #[test]
    fn test_goto() {
        let manager = fixture();
        assert_eq!(versions(&manager.goto(0, 2)), vec![1, 2]);
        assert_eq!(versions(&manager.goto(2, 0)), vec![2, 1]);
        assert!(manager.goto(101, 101).is_empty());
        assert_eq!(versions(&manager.goto(0, u64::MAX)), vec![1, 2, 101, 301]);
    }
}
