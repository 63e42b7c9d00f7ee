//! Stat cache for the working tree (`index.json`).
//!
//! Remembers the blob ID, size and modification time of every file captured
//! by the last snapshot or stash, so a later walk can skip re-hashing files
//! whose stat data did not change.
//!
//! A file modified within the same timestamp tick in which the index was
//! written could keep its size and mtime, so entries are only trusted when
//! the file's mtime is strictly older than the index file itself.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::diff::{HashCache, WorkingFile};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::storage::BlobId;

pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    pub blob: BlobId,
    pub size: u64,
    /// modification time as seconds and nanoseconds since the epoch
    pub mtime_secs: u64,
    pub mtime_nanos: u32,
}

impl IndexEntry {
    /// `None` when the file has no usable modification time
    pub fn new(path: &str, blob: BlobId, file: &WorkingFile) -> Option<Self> {
        let since_epoch = file.modified?.duration_since(UNIX_EPOCH).ok()?;
        Some(Self {
            path: path.to_string(),
            blob,
            size: file.size,
            mtime_secs: since_epoch.as_secs(),
            mtime_nanos: since_epoch.subsec_nanos(),
        })
    }

    pub fn modified(&self) -> SystemTime {
        UNIX_EPOCH + Duration::new(self.mtime_secs, self.mtime_nanos)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Index {
    entries: BTreeMap<String, IndexEntry>,
    /// when the index file was last written
    written_at: Option<SystemTime>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `index.json`. A missing or unreadable index is treated as empty;
    /// it is only a cache.
    pub fn load(path: &Path) -> RepositoryResult<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(RepositoryError::io_at(path, e)),
        };
        let list: Vec<IndexEntry> = match serde_json::from_slice(&bytes) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable index");
                return Ok(Self::default());
            }
        };
        let written_at = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| RepositoryError::io_at(path, e))?;
        Ok(Self {
            entries: list.into_iter().map(|e| (e.path.clone(), e)).collect(),
            written_at: Some(written_at),
        })
    }

    pub fn insert(&mut self, entry: IndexEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn get(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// serialized form: a JSON array sorted by path
    pub fn to_json(&self) -> RepositoryResult<Vec<u8>> {
        let list: Vec<&IndexEntry> = self.entries.values().collect();
        serde_json::to_vec(&list).map_err(|e| RepositoryError::Index(e.to_string()))
    }
}

impl HashCache for Index {
    fn cached_blob(&self, path: &str, file: &WorkingFile) -> Option<BlobId> {
        let entry = self.entries.get(path)?;
        let modified = file.modified?;
        let written_at = self.written_at?;
        if entry.size != file.size || entry.modified() != modified || modified >= written_at {
            return None;
        }
        Some(entry.blob)
    }
}
