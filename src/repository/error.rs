//! Repository error types.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::breaker::BreakerError;
use crate::storage::{CommitId, StorageError};
use crate::transaction::TransactionError;

/// Result type for repository operations
pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("circuit breaker: {0}")]
    Breaker(#[from] BreakerError),

    #[error("io error at {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {}: {reason}", path.display())]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("cancelled during {during}")]
    Cancelled { during: String },

    /// pre-flight validation found error or critical issues
    #[error("validation reported {blocking} blocking issue(s); confirmation required")]
    ValidationBlocked { blocking: usize, paths: Vec<PathBuf> },

    #[error("stash {0} does not exist")]
    StashNotFound(u64),

    #[error("'{path}' is not a file in commit {commit}")]
    PathNotFound { commit: CommitId, path: String },

    #[error("index error: {0}")]
    Index(String),
}

impl RepositoryError {
    pub(crate) fn io_at(path: &Path, source: io::Error) -> Self {
        RepositoryError::IoAt {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RepositoryError::Cancelled { .. })
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            RepositoryError::Storage(e) => e.is_not_found(),
            RepositoryError::Transaction(e) => e.is_not_found(),
            RepositoryError::StashNotFound(_) | RepositoryError::PathNotFound { .. } => true,
            _ => false,
        }
    }

    /// missing objects, ref cycles, malformed objects or refs
    pub fn is_integrity_fault(&self) -> bool {
        match self {
            RepositoryError::Storage(e) => e.is_integrity_fault(),
            RepositoryError::Transaction(e) => e.is_integrity_fault(),
            _ => false,
        }
    }

    pub fn affected_paths(&self) -> Vec<PathBuf> {
        match self {
            RepositoryError::Storage(e) => e.affected_paths(),
            RepositoryError::Transaction(e) => e.affected_paths(),
            RepositoryError::Breaker(e) => e.affected_paths(),
            RepositoryError::IoAt { path, .. } | RepositoryError::InvalidConfig { path, .. } => {
                vec![path.clone()]
            }
            RepositoryError::ValidationBlocked { paths, .. } => paths.clone(),
            RepositoryError::PathNotFound { path, .. } => vec![PathBuf::from(path)],
            _ => Vec::new(),
        }
    }
}
