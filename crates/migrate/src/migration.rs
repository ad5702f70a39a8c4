//! Migration pairs

use std::sync::Arc;

use crate::file::{Direction, MigrationFile};

/// The up and down files sharing one version. Either side may be missing.
#[derive(Debug, Clone)]
pub struct Migration {
    version: u64,
    up: Option<Arc<MigrationFile>>,
    down: Option<Arc<MigrationFile>>,
}

impl Migration {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            up: None,
            down: None,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn up_file(&self) -> Option<&Arc<MigrationFile>> {
        self.up.as_ref()
    }

    pub fn down_file(&self) -> Option<&Arc<MigrationFile>> {
        self.down.as_ref()
    }

    /// The file for `direction`, if this version has one
    pub fn file(&self, direction: Direction) -> Option<&Arc<MigrationFile>> {
        match direction {
            Direction::Up => self.up_file(),
            Direction::Down => self.down_file(),
        }
    }

    /// Put `file` into the slot of its direction, returning what it replaced
    pub(crate) fn insert(&mut self, file: Arc<MigrationFile>) -> Option<Arc<MigrationFile>> {
        debug_assert_eq!(file.version(), self.version);
        let slot = match file.direction() {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        };
        slot.replace(file)
    }
}
