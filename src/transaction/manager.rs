//! Transaction manager - coordinates all transaction operations.
//!
//! The TransactionManager is the main entry point for transactions.
//! It handles:
//! - Transaction creation and lifecycle
//! - The single active transaction slot
//! - The crash marker in the work area
//! - The work-area lock that tells a live marker from a leftover one
//! - Recovery after an interrupted run

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fs4::fs_std::FileExt;
use parking_lot::Mutex;
use ulid::Ulid;

use crate::storage::ObjectStore;
use crate::transaction::context::{
    BackupManifest, Transaction, TransactionMetadata, BACKUP_DIR, MANIFEST_FILE, STAGING_DIR,
};
use crate::transaction::error::{TransactionError, TransactionResult};

pub const MARKER_FILE: &str = "transaction.marker";
pub const RECOVERED_DIR: &str = "recovered";
/// held exclusively for as long as a transaction runs
pub const LOCK_FILE: &str = "transaction.lock";
const TX_DIR_PREFIX: &str = "tx-";

/// Transaction manager - coordinates all transaction operations.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    /// `<project>/.pgvc-work`
    work_dir: PathBuf,
    /// for clearing leftover temp objects during recovery
    store: ObjectStore,
    /// the running transaction, if any
    active: Mutex<Option<ActiveSlot>>,
}

struct ActiveSlot {
    tx_id: String,
    /// released when the slot is dropped
    _lock: File,
}

impl ManagerInner {
    fn marker_path(&self) -> PathBuf {
        self.work_dir.join(MARKER_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.work_dir.join(LOCK_FILE)
    }

    /// Take the work-area lock, or `None` while another handle or process
    /// holds it.
    fn try_lock(&self) -> TransactionResult<Option<File>> {
        fs::create_dir_all(&self.work_dir).map_err(|e| TransactionError::io_at(&self.work_dir, e))?;
        let path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| TransactionError::io_at(&path, e))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransactionError::io_at(&path, e)),
        }
    }

    /// Release the active slot; remove the marker unless recovery still needs it.
    pub(crate) fn finish(&self, tx_id: &str, clear_marker: bool) -> TransactionResult<()> {
        {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|slot| slot.tx_id == tx_id) {
                *active = None;
            }
        }
        if clear_marker {
            let marker = self.marker_path();
            match fs::remove_file(&marker) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(TransactionError::io_at(&marker, e)),
            }
        }
        Ok(())
    }
}

/// Backups of an interrupted transaction moved aside during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantinedBackup {
    pub tx_id: String,
    /// where the transaction directory now lives
    pub location: PathBuf,
    /// original paths the backups were taken from
    pub originals: Vec<PathBuf>,
}

/// What startup recovery found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub marker_found: bool,
    /// the marker belongs to a transaction that is still running in another
    /// handle; it was left alone
    pub marker_in_use: bool,
    /// marker content, when it could be parsed
    pub interrupted: Option<TransactionMetadata>,
    pub temp_objects_removed: usize,
    pub staging_dirs_removed: usize,
    pub quarantined: Vec<QuarantinedBackup>,
}

impl RecoveryReport {
    /// true when there was nothing to recover
    pub fn is_clean(&self) -> bool {
        !self.marker_found && self.quarantined.is_empty()
    }
}

impl TransactionManager {
    /// Create a manager over a work area; nothing is written until `begin`.
    pub fn new(work_dir: impl Into<PathBuf>, store: ObjectStore) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                work_dir: work_dir.into(),
                store,
                active: Mutex::new(None),
            }),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.inner.work_dir
    }

    pub fn marker_path(&self) -> PathBuf {
        self.inner.marker_path()
    }

    /// Check if a transaction is active.
    pub fn is_active(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    /// ID of the running transaction
    pub fn active_transaction(&self) -> Option<String> {
        self.inner.active.lock().as_ref().map(|slot| slot.tx_id.clone())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.inner.lock_path()
    }

    /// Begin a new transaction.
    ///
    /// Takes the work-area lock and writes the crash marker before returning.
    /// Fails with `AlreadyActive` while another transaction runs on this
    /// manager, with `Locked` while one runs in another handle, and with
    /// `RecoveryRequired` while a marker from an earlier failure is present.
    pub fn begin(&self) -> TransactionResult<Transaction> {
        let mut active = self.inner.active.lock();
        if let Some(slot) = active.as_ref() {
            return Err(TransactionError::AlreadyActive {
                tx_id: slot.tx_id.clone(),
            });
        }

        let lock = self
            .inner
            .try_lock()?
            .ok_or_else(|| TransactionError::Locked { lock: self.lock_path() })?;

        let marker = self.marker_path();
        if marker.exists() {
            return Err(TransactionError::RecoveryRequired { marker });
        }

        // Generate unique transaction ID
        let tx_id = Ulid::new().to_string().to_lowercase();
        let metadata = TransactionMetadata {
            tx_id: tx_id.clone(),
            started_at: Utc::now(),
            pid: std::process::id(),
        };

        let dir = self.inner.work_dir.join(format!("{}{}", TX_DIR_PREFIX, tx_id));
        fs::create_dir_all(&dir).map_err(|e| TransactionError::io_at(&dir, e))?;
        self.write_marker(&metadata)?;

        *active = Some(ActiveSlot {
            tx_id: tx_id.clone(),
            _lock: lock,
        });
        tracing::debug!(tx_id = %tx_id, "transaction started");
        Ok(Transaction::new(Arc::clone(&self.inner), metadata, dir))
    }

    fn write_marker(&self, metadata: &TransactionMetadata) -> TransactionResult<()> {
        let work_dir = &self.inner.work_dir;
        let mut temp =
            tempfile::NamedTempFile::new_in(work_dir).map_err(|e| TransactionError::io_at(work_dir, e))?;
        serde_json::to_writer_pretty(&mut temp, metadata)?;
        temp.flush().map_err(|e| TransactionError::io_at(temp.path(), e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| TransactionError::io_at(temp.path(), e))?;

        let marker = self.marker_path();
        temp.persist(&marker)
            .map_err(|e| TransactionError::io_at(&marker, e.error))?;
        Ok(())
    }

    /// Execute a function within a transaction, automatically committing or rolling back.
    ///
    /// If the function returns Ok, the transaction is committed.
    /// If the function returns Err, the transaction is rolled back and the
    /// error is returned, unless the rollback itself was incomplete.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction) -> Result<T, E>,
        E: From<TransactionError> + std::fmt::Display,
    {
        let mut tx = self.begin()?;

        match f(&mut tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => match tx.rollback_with_cause(e.to_string()) {
                Ok(()) => Err(e),
                Err(rollback_err) => Err(rollback_err.into()),
            },
        }
    }

    /// Clean up after an interrupted run.
    ///
    /// Runs only when the marker exists and no live transaction holds the
    /// work-area lock: removes the marker, clears object-store temp files and
    /// staging areas, and moves leftover backups to `recovered/<tx-id>/`.
    /// Backups are never deleted here.
    pub fn recover_on_startup(&self) -> TransactionResult<RecoveryReport> {
        if let Some(tx_id) = self.active_transaction() {
            return Err(TransactionError::InvalidOperation(format!(
                "cannot recover while transaction {} is active",
                tx_id
            )));
        }

        let marker = self.marker_path();
        if !marker.exists() {
            return Ok(RecoveryReport::default());
        }

        // a crashed process no longer holds the lock; a live handle does
        let Some(_lock) = self.inner.try_lock()? else {
            tracing::info!(marker = %marker.display(), "transaction marker belongs to a running transaction, leaving it");
            return Ok(RecoveryReport {
                marker_in_use: true,
                ..Default::default()
            });
        };

        let interrupted = fs::read(&marker)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<TransactionMetadata>(&bytes).ok());
        tracing::warn!(
            marker = %marker.display(),
            tx_id = interrupted.as_ref().map(|m| m.tx_id.as_str()).unwrap_or("unknown"),
            "found transaction marker, recovering"
        );

        match fs::remove_file(&marker) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(TransactionError::io_at(&marker, e)),
        }

        let mut report = RecoveryReport {
            marker_found: true,
            interrupted,
            temp_objects_removed: self.inner.store.clear_temp(),
            ..Default::default()
        };

        let entries = fs::read_dir(&self.inner.work_dir)
            .map_err(|e| TransactionError::io_at(&self.inner.work_dir, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(tx_id) = name.strip_prefix(TX_DIR_PREFIX) else {
                continue;
            };
            if !path.is_dir() {
                continue;
            }
            self.recover_tx_dir(tx_id, &path, &mut report)?;
        }

        tracing::info!(
            temp_objects = report.temp_objects_removed,
            staging_dirs = report.staging_dirs_removed,
            quarantined = report.quarantined.len(),
            "recovery finished"
        );
        Ok(report)
    }

    fn recover_tx_dir(&self, tx_id: &str, path: &Path, report: &mut RecoveryReport) -> TransactionResult<()> {
        let staging = path.join(STAGING_DIR);
        if staging.exists() {
            match fs::remove_dir_all(&staging) {
                Ok(()) => report.staging_dirs_removed += 1,
                Err(e) => tracing::warn!(path = %staging.display(), error = %e, "could not remove staging area"),
            }
        }

        let has_backups = fs::read_dir(path.join(BACKUP_DIR))
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if !has_backups {
            if let Err(e) = fs::remove_dir_all(path) {
                tracing::warn!(path = %path.display(), error = %e, "could not remove transaction directory");
            }
            return Ok(());
        }

        let originals = match fs::read(path.join(MANIFEST_FILE)) {
            Ok(bytes) => match serde_json::from_slice::<BackupManifest>(&bytes) {
                Ok(manifest) => manifest.backups.into_iter().map(|b| b.original).collect(),
                Err(e) => {
                    tracing::warn!(tx_id, error = %e, "unreadable backup manifest");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        let recovered = self.inner.work_dir.join(RECOVERED_DIR);
        fs::create_dir_all(&recovered).map_err(|e| TransactionError::io_at(&recovered, e))?;
        let mut location = recovered.join(tx_id);
        if location.exists() {
            location = recovered.join(format!("{}-{}", tx_id, Ulid::new().to_string().to_lowercase()));
        }
        fs::rename(path, &location).map_err(|e| TransactionError::io_at(path, e))?;

        tracing::warn!(
            tx_id,
            location = %location.display(),
            files = originals.len(),
            "quarantined backups of interrupted transaction"
        );
        report.quarantined.push(QuarantinedBackup {
            tx_id: tx_id.to_string(),
            location,
            originals,
        });
        Ok(())
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("work_dir", &self.inner.work_dir)
            .field("active", &self.active_transaction())
            .finish()
    }
}
