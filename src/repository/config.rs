//! Repository configuration.
//!
//! `config.json` in the control directory holds the persisted settings; only
//! `version` is required. [`RepositoryOptions`] carries per-process choices
//! made by the embedding host.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::{BreakerConfig, DEFAULT_RESET_AFTER, DEFAULT_THRESHOLD};
use crate::diff::validate_tracked_root;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::storage::{BranchName, WriteMode};
use crate::tasks::DEFAULT_QUEUE_CAPACITY;

pub const CONFIG_VERSION: &str = "1.0";

/// Contents of `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: String,
    /// project-relative directories to snapshot; the whole project when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracked_roots: Option<Vec<String>>,
    /// fsync objects and refs before renaming them into place
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_write: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker_reset_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            tracked_roots: None,
            safe_write: None,
            default_branch: None,
            breaker_threshold: None,
            breaker_reset_secs: None,
            queue_capacity: None,
        }
    }
}

impl RepoConfig {
    /// Read and validate `config.json`.
    pub fn load(path: &Path) -> RepositoryResult<Self> {
        let bytes = fs::read(path).map_err(|e| RepositoryError::io_at(path, e))?;
        let config: RepoConfig = serde_json::from_slice(&bytes).map_err(|e| RepositoryError::InvalidConfig {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate(path)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> RepositoryResult<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| RepositoryError::InvalidConfig {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::write(path, json).map_err(|e| RepositoryError::io_at(path, e))
    }

    fn validate(&self, path: &Path) -> RepositoryResult<()> {
        let invalid = |reason: String| RepositoryError::InvalidConfig {
            path: path.to_path_buf(),
            reason,
        };

        if self.version != CONFIG_VERSION {
            return Err(invalid(format!("unsupported version '{}'", self.version)));
        }
        for root in self.tracked_roots.iter().flatten() {
            if !validate_tracked_root(root) {
                return Err(invalid(format!("tracked root '{}' is not a project-relative path", root)));
            }
        }
        if let Some(branch) = &self.default_branch {
            BranchName::new(branch.as_str()).map_err(|e| invalid(e.to_string()))?;
        }
        if self.breaker_threshold == Some(0) {
            return Err(invalid("breaker_threshold must be at least 1".to_string()));
        }
        if self.queue_capacity == Some(0) {
            return Err(invalid("queue_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn tracked_roots(&self) -> Vec<String> {
        self.tracked_roots.clone().unwrap_or_default()
    }

    pub fn write_mode(&self) -> WriteMode {
        if self.safe_write.unwrap_or(false) {
            WriteMode::Safe
        } else {
            WriteMode::Fast
        }
    }

    pub fn default_branch(&self) -> RepositoryResult<BranchName> {
        match &self.default_branch {
            Some(name) => Ok(BranchName::new(name.as_str()).map_err(crate::storage::StorageError::from)?),
            None => Ok(BranchName::main()),
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            threshold: self.breaker_threshold.unwrap_or(DEFAULT_THRESHOLD),
            reset_after: self
                .breaker_reset_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RESET_AFTER),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY)
    }
}

/// How to open a repository.
#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    /// Project root; the control directory lives below it.
    pub project_root: PathBuf,
    /// Initialize the layout if it is missing.
    pub create_if_missing: bool,
    /// Overrides `safe_write` from `config.json`.
    pub write_mode: Option<WriteMode>,
    /// Keep breaker state in memory instead of `breaker.json`.
    pub in_memory_breaker: bool,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            create_if_missing: false,
            write_mode: None,
            in_memory_breaker: false,
        }
    }
}

impl RepositoryOptions {
    /// Create options for the given project root.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            ..Default::default()
        }
    }

    /// Set create_if_missing flag.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = Some(mode);
        self
    }

    pub fn in_memory_breaker(mut self, value: bool) -> Self {
        self.in_memory_breaker = value;
        self
    }
}
