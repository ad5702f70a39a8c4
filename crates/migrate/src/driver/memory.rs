//! In-memory driver for development and testing
//!
//! Keeps the applied versions and the lock flag in process memory. Faults
//! can be injected per operation and every call is counted, which makes it
//! the reference driver for exercising the apply engine.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{Driver, LockInfo};
use crate::error::{MigrateError, MigrateResult};
use crate::file::{Direction, MigrationFile};

/// Call counters of a [`MemoryDriver`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub initialize: usize,
    pub lock: usize,
    pub release: usize,
    pub migrate: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    applied: BTreeSet<u64>,
    lock: Option<LockInfo>,
    history: Vec<String>,
    calls: CallCounts,
    fail_initialize: bool,
    fail_lock: bool,
    fail_release: bool,
    fail_files: HashSet<(u64, Direction)>,
    migrate_delay: Option<Duration>,
}

/// Driver backed by process memory. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    token: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDriver {
    /// Create a new memory driver with nothing applied
    pub fn new() -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// A second handle on the same store with its own lock token, as a
    /// second process would have
    pub fn sibling(&self) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            state: self.state.clone(),
        }
    }

    /// Start with `versions` already applied
    pub fn with_applied(self, versions: impl IntoIterator<Item = u64>) -> Self {
        self.state.lock().applied.extend(versions);
        self
    }

    /// Make `initialize` fail
    pub fn fail_initialize(self) -> Self {
        self.state.lock().fail_initialize = true;
        self
    }

    /// Make `lock` fail
    pub fn fail_lock(self) -> Self {
        self.state.lock().fail_lock = true;
        self
    }

    /// Make `release` fail
    pub fn fail_release(self) -> Self {
        self.state.lock().fail_release = true;
        self
    }

    /// Make applying the given file fail
    pub fn fail_file(self, version: u64, direction: Direction) -> Self {
        self.state.lock().fail_files.insert((version, direction));
        self
    }

    /// Sleep this long inside every `migrate`
    pub fn with_migrate_delay(self, delay: Duration) -> Self {
        self.state.lock().migrate_delay = Some(delay);
        self
    }

    /// Versions currently applied, ascending
    pub fn applied_versions(&self) -> Vec<u64> {
        self.state.lock().applied.iter().copied().collect()
    }

    /// Names of all files applied so far, in order
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().lock.is_some()
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> MigrateResult<()> {
        let mut state = self.state.lock();
        state.calls.initialize += 1;
        if state.fail_initialize {
            return Err(MigrateError::DriverInit("memory driver configured to fail".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> MigrateResult<()> {
        Ok(())
    }

    async fn version(&self) -> MigrateResult<u64> {
        Ok(self.state.lock().applied.iter().next_back().copied().unwrap_or(0))
    }

    async fn migrate(&self, file: &MigrationFile) -> MigrateResult<()> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.migrate += 1;
            state.migrate_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // Bodies are not executed, but loading them exercises content errors
        file.content().await?;

        let mut state = self.state.lock();
        if state.fail_files.contains(&(file.version(), file.direction())) {
            return Err(MigrateError::execution(
                file.file_name(),
                "memory driver configured to fail this file",
            ));
        }

        match file.direction() {
            Direction::Up => {
                state.applied.insert(file.version());
            }
            Direction::Down => {
                state.applied.remove(&file.version());
            }
        }
        state.history.push(file.file_name().to_string());
        Ok(())
    }

    async fn lock(&self) -> MigrateResult<()> {
        let mut state = self.state.lock();
        state.calls.lock += 1;
        if state.fail_lock {
            return Err(MigrateError::Lock("memory driver configured to fail".to_string()));
        }
        if let Some(info) = &state.lock {
            return Err(MigrateError::Lock(format!("lock is {}", info)));
        }
        state.lock = Some(LockInfo {
            holder: self.token.clone(),
            locked_at: Some(Utc::now()),
        });
        Ok(())
    }

    async fn release(&self) -> MigrateResult<()> {
        let mut state = self.state.lock();
        state.calls.release += 1;
        if state.fail_release {
            return Err(MigrateError::Release("memory driver configured to fail".to_string()));
        }
        match &state.lock {
            Some(info) if info.holder == self.token => {
                state.lock = None;
                Ok(())
            }
            Some(info) => Err(MigrateError::Release(format!("lock is {}", info))),
            None => Err(MigrateError::Release("lock is not held".to_string())),
        }
    }

    async fn force_release(&self) -> MigrateResult<()> {
        self.state.lock().lock = None;
        Ok(())
    }

    async fn lock_info(&self) -> MigrateResult<Option<LockInfo>> {
        Ok(self.state.lock().lock.clone())
    }
}
