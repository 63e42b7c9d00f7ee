//! Storage layer error types
//!
//! All errors that can occur during object store and ref store operations are
//! defined here. We use `thiserror` for ergonomic error definition and better
//! error messages

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::storage::canonical::ObjectKind;
use crate::storage::types::{InvalidNameError, ObjectId};

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error with no particular path attached
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// I/O error while touching a specific path
    #[error("io error at {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// the requested object is not in the store
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// object bytes on disk do not match their header or cannot be decoded
    #[error("corrupted object {id}: {reason}")]
    CorruptedObject { id: ObjectId, reason: String },

    /// an object was found but it is of the wrong kind
    #[error("object {id} is a {found}, expected a {expected}")]
    UnexpectedObjectKind {
        id: ObjectId,
        expected: ObjectKind,
        found: ObjectKind,
    },

    /// the specified ref was not found
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// symbolic ref resolution did not terminate
    #[error("ref cycle while resolving {name}: gave up after {depth} hops")]
    RefCycle { name: String, depth: usize },

    /// ref file content is neither a commit id nor a symbolic target
    #[error("malformed ref {name}: {reason}")]
    MalformedRef { name: String, reason: String },

    /// the ref name is not acceptable
    #[error("invalid ref name: {0}")]
    InvalidRefName(String),

    /// ref already exists and must not be overwritten
    #[error("ref already exists: {0}")]
    RefAlreadyExists(String),

    /// ref moved between the read and the update
    #[error("concurrent modification: {reference} no longer points at the expected commit")]
    ConcurrentModification { reference: String },

    /// invalid branch, tag, entry name or object id
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// commit author is empty or spans several lines
    #[error("invalid commit author {0:?}")]
    InvalidAuthor(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// data integrity check failed for a non-object file
    #[error("corrupted data at {}: {reason}", path.display())]
    CorruptedData { path: PathBuf, reason: String },

    /// repo is not initialized
    #[error("repository not initialized: {}", .0.display())]
    NotInitialized(PathBuf),

    /// repo already exists
    #[error("repository already initialized: {}", .0.display())]
    AlreadyInitialized(PathBuf),

    /// repo is empty (HEAD points at an unborn branch)
    #[error("repository is empty: no commits found")]
    EmptyRepository,

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectNotFound(_)
                | StorageError::RefNotFound(_)
                | StorageError::EmptyRepository
                | StorageError::NotInitialized(_)
        )
    }

    /// integrity faults are fatal for the operation in progress and are never
    /// retried
    pub fn is_integrity_fault(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectNotFound(_)
                | StorageError::CorruptedObject { .. }
                | StorageError::UnexpectedObjectKind { .. }
                | StorageError::RefCycle { .. }
                | StorageError::MalformedRef { .. }
                | StorageError::CorruptedData { .. }
        )
    }

    /// check if this is a plain filesystem fault
    pub fn is_io(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::IoAt { .. })
    }

    /// paths touched by the failing operation, if known
    pub fn affected_paths(&self) -> Vec<PathBuf> {
        match self {
            StorageError::IoAt { path, .. }
            | StorageError::CorruptedData { path, .. }
            | StorageError::NotInitialized(path)
            | StorageError::AlreadyInitialized(path) => vec![path.clone()],
            _ => Vec::new(),
        }
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// attach the offending path to a raw `io::Result`
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> StorageResult<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> StorageResult<T> {
        self.map_err(|source| StorageError::IoAt {
            path: path.to_path_buf(),
            source,
        })
    }
}
