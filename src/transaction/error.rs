//! Transaction error types.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// One step of a rollback that could not be undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackFailure {
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for RollbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// filesystem error on a specific path
    #[error("io error at {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// another transaction is already running on this manager
    #[error("transaction {tx_id} is already active")]
    AlreadyActive { tx_id: String },

    /// another handle or process holds the work-area lock
    #[error("another transaction holds the lock at {}", lock.display())]
    Locked { lock: PathBuf },

    /// Transaction was already committed or rolled back.
    #[error("transaction {tx_id} is no longer active (state: {state})")]
    NotActive { tx_id: String, state: String },

    /// a crash marker is present and recovery has not run yet
    #[error("unrecovered transaction marker at {}", marker.display())]
    RecoveryRequired { marker: PathBuf },

    /// rollback finished but some steps could not be undone
    #[error("rollback of {tx_id} incomplete: {}", failures_display(.failures))]
    RollbackIncomplete {
        tx_id: String,
        failures: Vec<RollbackFailure>,
        /// the error that triggered the rollback, if any
        cause: Option<String>,
    },

    /// marker or manifest (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid operation for current transaction state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Internal error.
    #[error("internal transaction error: {0}")]
    Internal(String),
}

fn failures_display(failures: &[RollbackFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl TransactionError {
    pub(crate) fn io_at(path: &Path, source: io::Error) -> Self {
        TransactionError::IoAt {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            TransactionError::Storage(e) => e.is_not_found(),
            TransactionError::IoAt { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_integrity_fault(&self) -> bool {
        match self {
            TransactionError::Storage(e) => e.is_integrity_fault(),
            _ => false,
        }
    }

    /// paths involved in the failure
    pub fn affected_paths(&self) -> Vec<PathBuf> {
        match self {
            TransactionError::Storage(e) => e.affected_paths(),
            TransactionError::IoAt { path, .. } => vec![path.clone()],
            TransactionError::RecoveryRequired { marker } => vec![marker.clone()],
            TransactionError::Locked { lock } => vec![lock.clone()],
            TransactionError::RollbackIncomplete { failures, .. } => {
                failures.iter().map(|f| f.path.clone()).collect()
            }
            _ => Vec::new(),
        }
    }
}
