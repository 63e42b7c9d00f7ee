//! Circuit breaker error types.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type for breaker operations.
pub type BreakerResult<T> = Result<T, BreakerError>;

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("io error at {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("breaker state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid breaker configuration: {0}")]
    InvalidConfig(String),
}

impl BreakerError {
    pub(crate) fn io_at(path: &Path, source: io::Error) -> Self {
        BreakerError::IoAt {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn affected_paths(&self) -> Vec<PathBuf> {
        match self {
            BreakerError::IoAt { path, .. } => vec![path.clone()],
            _ => Vec::new(),
        }
    }
}
