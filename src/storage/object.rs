//! Content-addressable object store.
//!
//! Objects live one file per object under `objects/<2 hex>/<62 hex>`. A file is
//! written to `objects/tmp/` first and renamed into place, so a reader never
//! sees a partial object. Objects are never rewritten or deleted by normal
//! operation; an existing object is the proof that its bytes are already
//! stored, which is what makes `put` idempotent.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::storage::canonical::{parse_frame, Canonical, ObjectKind};
use crate::storage::error::{IoResultExt, StorageError, StorageResult};
use crate::storage::types::{BlobId, ObjectId};

const TMP_DIR: &str = "tmp";
const CHUNK: usize = 64 * 1024;

/// How hard `put` works to make a new object durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// temp file + rename
    #[default]
    Fast,
    /// temp file + fsync + rename + fsync of the parent directory
    Safe,
}

/// Compute the content ID of a payload without storing it.
pub fn hash_object(kind: ObjectKind, payload: &[u8]) -> ObjectId {
    let mut hasher = Sha256::new();
    hasher.update(kind.header(payload.len() as u64));
    hasher.update(payload);
    finish(hasher)
}

fn finish(hasher: Sha256) -> ObjectId {
    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    ObjectId::from_bytes(bytes)
}

/// The on-disk object store.
///
/// Cheap to clone; holds only the directory path and write mode.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
    mode: WriteMode,
}

impl ObjectStore {
    /// Open a store rooted at `root` (the `objects/` directory).
    pub fn new(root: impl Into<PathBuf>, mode: WriteMode) -> Self {
        Self {
            root: root.into(),
            mode,
        }
    }

    /// Create the directory layout and return the store.
    pub fn init(root: impl Into<PathBuf>, mode: WriteMode) -> StorageResult<Self> {
        let store = Self::new(root, mode);
        fs::create_dir_all(store.tmp_dir()).at(&store.tmp_dir())?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    fn object_path(&self, id: ObjectId) -> PathBuf {
        let (dir, file) = id.split_hex();
        self.root.join(dir).join(file)
    }

    /// check whether an object is present
    pub fn contains(&self, id: ObjectId) -> bool {
        self.object_path(id).is_file()
    }

    // ==================== Writes ====================

    /// Store raw bytes as a blob.
    pub fn put(&self, bytes: &[u8]) -> StorageResult<BlobId> {
        self.put_raw(ObjectKind::Blob, bytes).map(BlobId::new)
    }

    /// Store a payload of the given kind and return its content ID.
    pub fn put_raw(&self, kind: ObjectKind, payload: &[u8]) -> StorageResult<ObjectId> {
        let id = hash_object(kind, payload);
        if self.contains(id) {
            return Ok(id);
        }

        let mut temp = self.temp_file()?;
        let temp_path = temp.path().to_path_buf();
        temp.write_all(&kind.header(payload.len() as u64))
            .and_then(|_| temp.write_all(payload))
            .at(&temp_path)?;

        self.install(temp, id)?;
        Ok(id)
    }

    /// Store any canonical object.
    pub fn put_object<T: Canonical>(&self, object: &T) -> StorageResult<ObjectId> {
        self.put_raw(T::KIND, &object.encode())
    }

    /// Stream a file into the store as a blob, hashing while copying.
    pub fn put_file(&self, path: &Path) -> StorageResult<BlobId> {
        let mut file = File::open(path).at(path)?;
        let len = file.metadata().at(path)?.len();

        let mut temp = self.temp_file()?;
        let header = ObjectKind::Blob.header(len);
        let mut hasher = Sha256::new();
        hasher.update(&header);
        temp.write_all(&header).at(temp.path())?;

        let copied = copy_hashing(&mut file, &mut temp, &mut hasher).at(path)?;
        if copied != len {
            return Err(StorageError::IoAt {
                path: path.to_path_buf(),
                source: io::Error::new(
                    io::ErrorKind::Other,
                    format!("file changed while being stored ({} of {} bytes)", copied, len),
                ),
            });
        }

        let id = finish(hasher);
        if self.contains(id) {
            // dropping the temp file removes it
            return Ok(BlobId::new(id));
        }
        self.install(temp, id)?;
        Ok(BlobId::new(id))
    }

    /// Compute the blob ID a file would get, without storing it.
    pub fn hash_file(path: &Path) -> StorageResult<BlobId> {
        let mut file = File::open(path).at(path)?;
        let len = file.metadata().at(path)?.len();

        let mut hasher = Sha256::new();
        hasher.update(ObjectKind::Blob.header(len));
        let read = copy_hashing(&mut file, &mut io::sink(), &mut hasher).at(path)?;
        if read != len {
            return Err(StorageError::IoAt {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::Other, "file changed while being hashed"),
            });
        }
        Ok(BlobId::new(finish(hasher)))
    }

    fn temp_file(&self) -> StorageResult<NamedTempFile> {
        let tmp = self.tmp_dir();
        fs::create_dir_all(&tmp).at(&tmp)?;
        NamedTempFile::new_in(&tmp).at(&tmp)
    }

    /// Move a fully written temp file to its final, content-addressed location.
    fn install(&self, temp: NamedTempFile, id: ObjectId) -> StorageResult<()> {
        let target = self.object_path(id);
        let parent = target
            .parent()
            .ok_or_else(|| StorageError::Internal(format!("object path without parent: {}", target.display())))?
            .to_path_buf();
        fs::create_dir_all(&parent).at(&parent)?;

        if self.mode == WriteMode::Safe {
            temp.as_file().sync_all().at(temp.path())?;
        }

        match temp.persist_noclobber(&target) {
            Ok(_) => {}
            // someone stored the same bytes first
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
            Err(e) => return Err(StorageError::IoAt { path: target, source: e.error }),
        }

        if self.mode == WriteMode::Safe {
            sync_dir(&parent)?;
        }
        tracing::trace!(id = %id.short(), "stored object");
        Ok(())
    }

    // ==================== Reads ====================

    /// Read an object, verifying its frame and digest.
    pub fn get(&self, id: ObjectId) -> StorageResult<(ObjectKind, Vec<u8>)> {
        let path = self.object_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::ObjectNotFound(id))
            }
            Err(source) => return Err(StorageError::IoAt { path, source }),
        };

        let (kind, payload) = parse_frame(&bytes).map_err(|e| StorageError::CorruptedObject {
            id,
            reason: e.to_string(),
        })?;

        if hash_object(kind, payload) != id {
            return Err(StorageError::CorruptedObject {
                id,
                reason: "content does not match its id".to_string(),
            });
        }
        Ok((kind, payload.to_vec()))
    }

    /// Read a blob's bytes.
    pub fn get_blob(&self, id: BlobId) -> StorageResult<Vec<u8>> {
        let (kind, payload) = self.get(id.raw())?;
        if kind != ObjectKind::Blob {
            return Err(StorageError::UnexpectedObjectKind {
                id: id.raw(),
                expected: ObjectKind::Blob,
                found: kind,
            });
        }
        Ok(payload)
    }

    /// Read and decode a canonical object.
    pub fn get_object<T: Canonical>(&self, id: ObjectId) -> StorageResult<T> {
        let (kind, payload) = self.get(id)?;
        if kind != T::KIND {
            return Err(StorageError::UnexpectedObjectKind {
                id,
                expected: T::KIND,
                found: kind,
            });
        }
        T::decode(&payload).map_err(|e| StorageError::CorruptedObject {
            id,
            reason: e.to_string(),
        })
    }

    // ==================== Maintenance ====================

    /// Number of objects in the store.
    pub fn object_count(&self) -> StorageResult<usize> {
        let mut count = 0;
        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                StorageError::IoAt {
                    path,
                    source: e.into_io_error().unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk error")),
                }
            })?;
            let in_tmp = entry
                .path()
                .parent()
                .and_then(Path::file_name)
                .map(|name| name == TMP_DIR)
                .unwrap_or(false);
            if entry.file_type().is_file() && !in_tmp {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Remove leftover temp files from interrupted writes.
    ///
    /// Best-effort: failures are logged, not returned.
    pub fn clear_temp(&self) -> usize {
        let tmp = self.tmp_dir();
        let entries = match fs::read_dir(&tmp) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove temp object"),
            }
        }
        removed
    }
}

fn copy_hashing(reader: &mut impl Read, writer: &mut impl Write, hasher: &mut Sha256) -> io::Result<u64> {
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> StorageResult<()> {
    File::open(dir).and_then(|d| d.sync_all()).at(dir)
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> StorageResult<()> {
    Ok(())
}
