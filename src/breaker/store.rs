//! Where breaker state lives between runs.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::breaker::error::{BreakerError, BreakerResult};

/// Persisted breaker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failed_operation: Option<String>,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
}

/// Storage for [`BreakerState`].
pub trait BreakerStore: Send + Sync {
    fn load(&self) -> BreakerResult<BreakerState>;
    fn save(&self, state: &BreakerState) -> BreakerResult<()>;
}

/// `breaker.json` in the control directory.
#[derive(Debug, Clone)]
pub struct FileBreakerStore {
    path: PathBuf,
}

impl FileBreakerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BreakerStore for FileBreakerStore {
    fn load(&self) -> BreakerResult<BreakerState> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BreakerState::default()),
            Err(e) => return Err(BreakerError::io_at(&self.path, e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(state),
            Err(e) => {
                // a broken state file must not block snapshots forever
                tracing::warn!(path = %self.path.display(), error = %e, "unreadable breaker state, starting closed");
                Ok(BreakerState::default())
            }
        }
    }

    fn save(&self, state: &BreakerState) -> BreakerResult<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| BreakerError::InvalidConfig(format!("no parent for {}", self.path.display())))?;
        fs::create_dir_all(dir).map_err(|e| BreakerError::io_at(dir, e))?;

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| BreakerError::io_at(dir, e))?;
        serde_json::to_writer_pretty(&mut temp, state)?;
        temp.flush().map_err(|e| BreakerError::io_at(temp.path(), e))?;
        temp.persist(&self.path)
            .map_err(|e| BreakerError::io_at(&self.path, e.error))?;
        Ok(())
    }
}

/// In-memory store, for tests and embedders that keep no state file.
#[derive(Debug, Default)]
pub struct MemoryBreakerStore {
    state: Mutex<BreakerState>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreakerStore for MemoryBreakerStore {
    fn load(&self) -> BreakerResult<BreakerState> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &BreakerState) -> BreakerResult<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }
}
