//! A single file-system transaction.
//!
//! Every destructive step records how to undo itself before it runs:
//! - existing files are copied to the transaction's backup area
//! - files and directories the transaction creates are remembered
//! - moves remember their source
//!
//! Commit discards the undo log. Rollback replays it in reverse and collects
//! every failure instead of stopping at the first one. Dropping an active
//! transaction rolls it back.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transaction::error::{RollbackFailure, TransactionError, TransactionResult};
use crate::transaction::manager::ManagerInner;
use crate::transaction::ops::FileOperation;

pub(crate) const MANIFEST_FILE: &str = "manifest.json";
pub(crate) const BACKUP_DIR: &str = "backups";
pub(crate) const STAGING_DIR: &str = "staging";

/// Transaction metadata, also the content of the crash marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    /// Unique transaction ID.
    pub tx_id: String,
    /// When the transaction started.
    pub started_at: DateTime<Utc>,
    /// process that owns the transaction
    pub pid: u32,
}

/// One original → backup mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub original: PathBuf,
    pub backup: PathBuf,
}

/// `manifest.json` inside a transaction directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub tx_id: String,
    pub backups: Vec<BackupRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

impl TxState {
    fn as_str(&self) -> &'static str {
        match self {
            TxState::Active => "active",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled back",
        }
    }
}

#[derive(Debug)]
enum UndoStep {
    /// copy the backup over the original
    Restore { original: PathBuf, backup: PathBuf },
    /// the file did not exist before the transaction
    RemoveFile(PathBuf),
    /// the directory (and everything below) did not exist before
    RemoveDir(PathBuf),
    /// a move happened; move it back
    MoveBack { current: PathBuf, original: PathBuf },
    /// an empty directory was removed
    RecreateDir(PathBuf),
}

impl UndoStep {
    fn path(&self) -> &Path {
        match self {
            UndoStep::Restore { original, .. } => original,
            UndoStep::RemoveFile(path) | UndoStep::RemoveDir(path) | UndoStep::RecreateDir(path) => path,
            UndoStep::MoveBack { original, .. } => original,
        }
    }

    fn undo(&self) -> io::Result<()> {
        match self {
            UndoStep::Restore { original, backup } => {
                if let Some(parent) = original.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(backup, original).map(|_| ())
            }
            UndoStep::RemoveFile(path) => ignore_missing(fs::remove_file(path)),
            UndoStep::RemoveDir(path) => ignore_missing(fs::remove_dir_all(path)),
            UndoStep::MoveBack { current, original } => {
                if let Some(parent) = original.parent() {
                    fs::create_dir_all(parent)?;
                }
                move_file(current, original)
            }
            UndoStep::RecreateDir(path) => fs::create_dir_all(path),
        }
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// rename, falling back to copy + delete across file systems
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if !from.is_file() {
                return Err(rename_err);
            }
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// An active file-system transaction.
pub struct Transaction {
    metadata: TransactionMetadata,
    dir: PathBuf,
    manager: Arc<ManagerInner>,
    state: TxState,
    undo: Vec<UndoStep>,
    applied: Vec<FileOperation>,
    manifest: BackupManifest,
    backed_up: HashSet<PathBuf>,
    staged: usize,
}

impl Transaction {
    pub(crate) fn new(manager: Arc<ManagerInner>, metadata: TransactionMetadata, dir: PathBuf) -> Self {
        let manifest = BackupManifest {
            tx_id: metadata.tx_id.clone(),
            backups: Vec::new(),
        };
        Self {
            metadata,
            dir,
            manager,
            state: TxState::Active,
            undo: Vec::new(),
            applied: Vec::new(),
            manifest,
            backed_up: HashSet::new(),
            staged: 0,
        }
    }

    /// Get the transaction ID.
    pub fn id(&self) -> &str {
        &self.metadata.tx_id
    }

    pub fn metadata(&self) -> &TransactionMetadata {
        &self.metadata
    }

    /// operations applied so far, in order
    pub fn operations(&self) -> &[FileOperation] {
        &self.applied
    }

    /// originals backed up so far
    pub fn backups(&self) -> &[BackupRecord] {
        &self.manifest.backups
    }

    fn ensure_active(&self) -> TransactionResult<()> {
        if self.state == TxState::Active {
            Ok(())
        } else {
            Err(TransactionError::NotActive {
                tx_id: self.metadata.tx_id.clone(),
                state: self.state.as_str().to_string(),
            })
        }
    }

    // ==================== Recording ====================

    /// Copy `path` to the backup area so rollback can restore it.
    ///
    /// Missing files and paths already backed up are skipped.
    pub fn backup_file(&mut self, path: &Path) -> TransactionResult<()> {
        self.ensure_active()?;
        if self.backed_up.contains(path) || !path.is_file() {
            return Ok(());
        }

        let backup_dir = self.dir.join(BACKUP_DIR);
        fs::create_dir_all(&backup_dir).map_err(|e| TransactionError::io_at(&backup_dir, e))?;
        let backup = backup_dir.join(self.manifest.backups.len().to_string());
        fs::copy(path, &backup).map_err(|e| TransactionError::io_at(path, e))?;

        self.backed_up.insert(path.to_path_buf());
        self.manifest.backups.push(BackupRecord {
            original: path.to_path_buf(),
            backup: backup.clone(),
        });
        self.write_manifest()?;
        self.undo.push(UndoStep::Restore {
            original: path.to_path_buf(),
            backup,
        });
        tracing::trace!(tx_id = %self.metadata.tx_id, path = %path.display(), "backed up");
        Ok(())
    }

    fn write_manifest(&self) -> TransactionResult<()> {
        let path = self.dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&self.manifest)?;
        fs::write(&path, json).map_err(|e| TransactionError::io_at(&path, e))
    }

    /// Remember how to get rid of `path` if it is about to be created.
    fn prepare_destination(&mut self, path: &Path) -> TransactionResult<()> {
        if path.exists() {
            return self.backup_file(path);
        }

        // first missing ancestor: everything below it is ours
        let parent = path
            .parent()
            .ok_or_else(|| TransactionError::InvalidOperation(format!("no parent for {}", path.display())))?;
        let mut missing = None;
        let mut cursor = Some(parent);
        while let Some(dir) = cursor {
            if dir.as_os_str().is_empty() || dir.exists() {
                break;
            }
            missing = Some(dir.to_path_buf());
            cursor = dir.parent();
        }
        if let Some(dir) = missing {
            fs::create_dir_all(parent).map_err(|e| TransactionError::io_at(parent, e))?;
            self.undo.push(UndoStep::RemoveDir(dir));
        }
        Ok(())
    }

    /// Write bytes into the staging area; move the returned path into place
    /// with [`FileOperation::Move`].
    pub fn write_staged(&mut self, bytes: &[u8]) -> TransactionResult<PathBuf> {
        self.ensure_active()?;
        let staging = self.dir.join(STAGING_DIR);
        fs::create_dir_all(&staging).map_err(|e| TransactionError::io_at(&staging, e))?;
        let path = staging.join(self.staged.to_string());
        self.staged += 1;
        fs::write(&path, bytes).map_err(|e| TransactionError::io_at(&path, e))?;
        Ok(path)
    }

    // ==================== Operations ====================

    /// Apply an operation now, after recording how to undo it.
    pub fn execute(&mut self, op: FileOperation) -> TransactionResult<()> {
        self.ensure_active()?;
        match &op {
            FileOperation::Move { from, to } => {
                self.prepare_destination(to)?;
                if to.is_file() {
                    fs::remove_file(to).map_err(|e| TransactionError::io_at(to, e))?;
                }
                move_file(from, to).map_err(|e| TransactionError::io_at(from, e))?;
                self.undo.push(UndoStep::MoveBack {
                    current: to.clone(),
                    original: from.clone(),
                });
            }
            FileOperation::Delete { path } => {
                self.backup_file(path)?;
                fs::remove_file(path).map_err(|e| TransactionError::io_at(path, e))?;
            }
            FileOperation::Copy { from, to } => {
                let existed = to.exists();
                self.prepare_destination(to)?;
                fs::copy(from, to).map_err(|e| TransactionError::io_at(from, e))?;
                if !existed {
                    self.undo.push(UndoStep::RemoveFile(to.clone()));
                }
            }
        }
        tracing::trace!(tx_id = %self.metadata.tx_id, op = %op, "applied");
        self.applied.push(op);
        Ok(())
    }

    /// Remove `path` if it is an empty directory, so a file can take its place.
    ///
    /// Returns whether anything was removed. A non-empty directory is an error.
    pub fn remove_empty_dir(&mut self, path: &Path) -> TransactionResult<bool> {
        self.ensure_active()?;
        if !path.is_dir() {
            return Ok(false);
        }
        match fs::remove_dir(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(TransactionError::io_at(path, e)),
        }
        self.undo.push(UndoStep::RecreateDir(path.to_path_buf()));
        tracing::trace!(tx_id = %self.metadata.tx_id, path = %path.display(), "removed empty directory");
        Ok(true)
    }

    // ==================== Completion ====================

    /// Make all operations permanent and discard the backups.
    pub fn commit(mut self) -> TransactionResult<()> {
        self.ensure_active()?;
        self.state = TxState::Committed;
        self.undo.clear();

        self.remove_tx_dir();
        self.manager.finish(&self.metadata.tx_id, true)?;
        tracing::debug!(
            tx_id = %self.metadata.tx_id,
            operations = self.applied.len(),
            "transaction committed"
        );
        Ok(())
    }

    /// Undo every applied operation, newest first.
    pub fn rollback(mut self) -> TransactionResult<()> {
        self.rollback_in_place(None)
    }

    pub(crate) fn rollback_with_cause(mut self, cause: String) -> TransactionResult<()> {
        self.rollback_in_place(Some(cause))
    }

    fn rollback_in_place(&mut self, cause: Option<String>) -> TransactionResult<()> {
        self.ensure_active()?;
        self.state = TxState::RolledBack;

        let mut failures = Vec::new();
        while let Some(step) = self.undo.pop() {
            if let Err(e) = step.undo() {
                tracing::warn!(
                    tx_id = %self.metadata.tx_id,
                    path = %step.path().display(),
                    error = %e,
                    "rollback step failed"
                );
                failures.push(RollbackFailure {
                    path: step.path().to_path_buf(),
                    reason: e.to_string(),
                });
            }
        }

        if failures.is_empty() {
            self.remove_tx_dir();
            self.manager.finish(&self.metadata.tx_id, true)?;
            tracing::debug!(tx_id = %self.metadata.tx_id, "transaction rolled back");
            Ok(())
        } else {
            // backups and marker stay behind for recovery
            self.manager.finish(&self.metadata.tx_id, false)?;
            Err(TransactionError::RollbackIncomplete {
                tx_id: self.metadata.tx_id.clone(),
                failures,
                cause,
            })
        }
    }

    /// Stop mid-transaction the way a killed process would: the marker and
    /// backups stay on disk, the work-area lock is released.
    #[cfg(test)]
    pub(crate) fn abandon(mut self) -> TransactionResult<()> {
        self.state = TxState::RolledBack;
        self.undo.clear();
        self.manager.finish(&self.metadata.tx_id, false)
    }

    fn remove_tx_dir(&self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.dir.display(), error = %e, "could not remove transaction directory");
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            tracing::debug!(tx_id = %self.metadata.tx_id, "rolling back dropped transaction");
            if let Err(e) = self.rollback_in_place(None) {
                tracing::error!(tx_id = %self.metadata.tx_id, error = %e, "implicit rollback failed");
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("tx_id", &self.metadata.tx_id)
            .field("state", &self.state)
            .field("operations", &self.applied.len())
            .finish()
    }
}
