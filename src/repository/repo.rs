//! The repository context.
//!
//! A [`Repository`] ties the object store, refs, transaction manager and
//! circuit breaker of one project together. It is cheap to clone; clones
//! share the same state and the same write lock, so at most one mutating
//! operation runs at a time. Reads capture the HEAD commit when they start
//! and do not take the lock.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::breaker::{BreakerStore, CircuitBreaker, FileBreakerStore, MemoryBreakerStore};
use crate::diff::{diff_trees, DiffEngine, HashCache, IgnoreRules, WorkingFile};
use crate::repository::config::{RepoConfig, RepositoryOptions};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::index::{Index, IndexEntry, INDEX_FILE};
use crate::repository::progress::{CancellationToken, Progress, SnapshotOptions, SnapshotPhase};
use crate::repository::validation::{ValidationReport, Validator};
use crate::storage::{
    flatten_tree, get_commit, history, lookup_path, BlobId, BranchName, Change, CommitBuilder, CommitId,
    CommitInfo, CommitMessage, EntryKind, ObjectStore, RefManager, StorageError, TagName, TreeBuilder, TreeId,
    HEAD,
};
use crate::tasks::TaskRunner;
use crate::transaction::{FileOperation, RecoveryReport, TransactionManager};

pub const CONTROL_DIR: &str = ".pgvc";
pub const WORK_DIR: &str = ".pgvc-work";
pub const OBJECTS_DIR: &str = "objects";
pub const CONFIG_FILE: &str = "config.json";
pub const BREAKER_FILE: &str = "breaker.json";

/// What a finished snapshot produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub commit: CommitId,
    /// the ref that now points at `commit`
    pub reference: String,
    /// files captured
    pub files: usize,
    /// files that had to be read and hashed
    pub hashed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashSummary {
    pub index: u64,
    pub commit: CommitId,
    pub files: usize,
    pub hashed: usize,
}

/// One entry of [`Repository::list_stashes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashInfo {
    pub index: u64,
    pub commit: CommitId,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub commit: CommitId,
    pub written: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

/// Result of an automatic snapshot or stash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoOutcome {
    Snapshot(SnapshotSummary),
    Stash(StashSummary),
    /// the working tree matches HEAD
    NoChanges,
    /// the circuit breaker is open
    Skipped { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureTarget {
    Head,
    Stash,
}

impl CaptureTarget {
    fn as_str(&self) -> &'static str {
        match self {
            CaptureTarget::Head => "snapshot",
            CaptureTarget::Stash => "stash",
        }
    }
}

struct Captured {
    commit: CommitId,
    reference: String,
    stash_index: Option<u64>,
    files: usize,
    hashed: usize,
}

struct RepoInner {
    project_root: PathBuf,
    control_dir: PathBuf,
    config: RepoConfig,
    store: ObjectStore,
    refs: RefManager,
    transactions: TransactionManager,
    breaker: CircuitBreaker,
    recovery: RecoveryReport,
    /// held by every mutating operation
    write_lock: Mutex<()>,
}

/// Handle to one project's snapshot store.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

impl Repository {
    // ==================== Lifecycle ====================

    /// Create the control directory layout below `project_root`.
    pub fn init(project_root: impl Into<PathBuf>) -> RepositoryResult<Self> {
        Self::init_with(RepositoryOptions::new(project_root))
    }

    pub fn init_with(options: RepositoryOptions) -> RepositoryResult<Self> {
        let control_dir = options.project_root.join(CONTROL_DIR);
        let config_path = control_dir.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(StorageError::AlreadyInitialized(control_dir).into());
        }
        fs::create_dir_all(&control_dir).map_err(|e| RepositoryError::io_at(&control_dir, e))?;

        let config = RepoConfig::default();
        let mode = options.write_mode.unwrap_or_else(|| config.write_mode());
        ObjectStore::init(control_dir.join(OBJECTS_DIR), mode)?;
        RefManager::new(&control_dir, mode).init(&config.default_branch()?)?;

        let index_path = control_dir.join(INDEX_FILE);
        fs::write(&index_path, "[]").map_err(|e| RepositoryError::io_at(&index_path, e))?;
        // written last: its presence marks a complete layout
        config.save(&config_path)?;

        tracing::info!(path = %control_dir.display(), "initialized repository");
        Self::open_with(options)
    }

    /// Open an existing repository and recover from an interrupted run.
    pub fn open(project_root: impl Into<PathBuf>) -> RepositoryResult<Self> {
        Self::open_with(RepositoryOptions::new(project_root))
    }

    pub fn open_or_init(project_root: impl Into<PathBuf>) -> RepositoryResult<Self> {
        Self::open_with(RepositoryOptions::new(project_root).create_if_missing(true))
    }

    pub fn open_with(options: RepositoryOptions) -> RepositoryResult<Self> {
        let project_root = options.project_root.clone();
        let control_dir = project_root.join(CONTROL_DIR);
        let config_path = control_dir.join(CONFIG_FILE);
        if !config_path.is_file() {
            if options.create_if_missing {
                return Self::init_with(options);
            }
            return Err(StorageError::NotInitialized(control_dir).into());
        }

        let config = RepoConfig::load(&config_path)?;
        let mode = options.write_mode.unwrap_or_else(|| config.write_mode());
        let store = ObjectStore::new(control_dir.join(OBJECTS_DIR), mode);
        if !store.path().is_dir() {
            return Err(StorageError::NotInitialized(control_dir).into());
        }
        let refs = RefManager::new(&control_dir, mode);

        let transactions = TransactionManager::new(project_root.join(WORK_DIR), store.clone());
        let recovery = transactions.recover_on_startup()?;
        if !recovery.is_clean() {
            tracing::warn!(
                interrupted = recovery.interrupted.as_ref().map(|m| m.tx_id.as_str()).unwrap_or("unknown"),
                quarantined = recovery.quarantined.len(),
                "recovered from an interrupted transaction"
            );
        }

        let breaker_store: Box<dyn BreakerStore> = if options.in_memory_breaker {
            Box::new(MemoryBreakerStore::new())
        } else {
            Box::new(FileBreakerStore::new(control_dir.join(BREAKER_FILE)))
        };
        let breaker = CircuitBreaker::new(config.breaker(), breaker_store)?;

        tracing::debug!(path = %project_root.display(), mode = ?mode, "opened repository");
        Ok(Self {
            inner: Arc::new(RepoInner {
                project_root,
                control_dir,
                config,
                store,
                refs,
                transactions,
                breaker,
                recovery,
                write_lock: Mutex::new(()),
            }),
        })
    }

    // ==================== Accessors ====================

    pub fn project_root(&self) -> &Path {
        &self.inner.project_root
    }

    pub fn control_dir(&self) -> &Path {
        &self.inner.control_dir
    }

    pub fn config(&self) -> &RepoConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ObjectStore {
        &self.inner.store
    }

    pub fn refs(&self) -> &RefManager {
        &self.inner.refs
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.inner.transactions
    }

    /// what crash recovery did when this repository was opened
    pub fn last_recovery(&self) -> &RecoveryReport {
        &self.inner.recovery
    }

    pub fn head(&self) -> RepositoryResult<Option<CommitId>> {
        Ok(self.inner.refs.head_commit()?)
    }

    fn index_path(&self) -> PathBuf {
        self.inner.control_dir.join(INDEX_FILE)
    }

    fn head_tree(&self) -> RepositoryResult<(Option<CommitId>, Option<TreeId>)> {
        match self.inner.refs.head_commit()? {
            Some(id) => Ok((Some(id), Some(get_commit(&self.inner.store, id)?.commit.tree))),
            None => Ok((None, None)),
        }
    }

    fn engine<'a>(&'a self, cache: &'a dyn HashCache) -> RepositoryResult<DiffEngine<'a>> {
        let rules = IgnoreRules::load(&self.inner.project_root)?;
        Ok(DiffEngine::new(&self.inner.store, self.inner.project_root.clone())
            .tracked_roots(self.inner.config.tracked_roots())
            .ignore_rules(rules)
            .cache(cache))
    }

    // ==================== Snapshots and stashes ====================

    /// Capture the working tree as a new commit on the branch HEAD points at.
    pub fn create_snapshot(
        &self,
        message: &str,
        author: &str,
        options: &SnapshotOptions,
    ) -> RepositoryResult<SnapshotSummary> {
        let _guard = self.inner.write_lock.lock();
        let captured = self.capture(message, author, options, CaptureTarget::Head)?;
        Ok(SnapshotSummary {
            commit: captured.commit,
            reference: captured.reference,
            files: captured.files,
            hashed: captured.hashed,
        })
    }

    /// Capture the working tree under the next `refs/stash/auto/<n>`.
    /// HEAD and the working tree are left alone.
    pub fn create_stash(&self, message: &str, author: &str) -> RepositoryResult<StashSummary> {
        self.create_stash_with(message, author, &SnapshotOptions::default())
    }

    pub fn create_stash_with(
        &self,
        message: &str,
        author: &str,
        options: &SnapshotOptions,
    ) -> RepositoryResult<StashSummary> {
        let _guard = self.inner.write_lock.lock();
        let captured = self.capture(message, author, options, CaptureTarget::Stash)?;
        let index = captured
            .stash_index
            .ok_or_else(|| StorageError::Internal("stash capture without an index".to_string()))?;
        Ok(StashSummary {
            index,
            commit: captured.commit,
            files: captured.files,
            hashed: captured.hashed,
        })
    }

    /// Runs with the write lock held.
    fn capture(
        &self,
        message: &str,
        author: &str,
        options: &SnapshotOptions,
        target: CaptureTarget,
    ) -> RepositoryResult<Captured> {
        let span = tracing::info_span!("capture", kind = target.as_str());
        let _enter = span.enter();

        let result = self.capture_phases(message, author, options, target);
        match &result {
            Ok(captured) => {
                options.report(Progress::phase(SnapshotPhase::Done, captured.files, captured.files));
                tracing::info!(
                    commit = %captured.commit.short(),
                    reference = %captured.reference,
                    files = captured.files,
                    hashed = captured.hashed,
                    "{} created",
                    target.as_str()
                );
            }
            Err(e) => {
                options.report(Progress::phase(SnapshotPhase::Aborted, 0, 0));
                if e.is_cancelled() {
                    tracing::info!(error = %e, "{} aborted", target.as_str());
                } else {
                    tracing::error!(error = %e, "{} failed", target.as_str());
                }
            }
        }
        result
    }

    fn capture_phases(
        &self,
        message: &str,
        author: &str,
        options: &SnapshotOptions,
        target: CaptureTarget,
    ) -> RepositoryResult<Captured> {
        let inner = &self.inner;
        let (parent, base_tree) = self.head_tree()?;
        let index = Index::load(&self.index_path())?;
        let engine = self.engine(&index)?;

        if let Some(validator) = &options.validator {
            enter_phase(options, SnapshotPhase::Validating)?;
            let changes = engine.compare_working_directory(base_tree)?;
            let report = ValidationReport::new(validator.validate(&inner.project_root, &changes), changes.len());
            tracing::info!(summary = %report.summary(), "pre-flight validation");
            if report.requires_confirmation() && !options.confirm_blocking_issues {
                return Err(RepositoryError::ValidationBlocked {
                    blocking: report.blocking().count(),
                    paths: report.blocking_paths(),
                });
            }
        }

        enter_phase(options, SnapshotPhase::Walking)?;
        let files = engine.working_files()?;
        let total = files.len();
        let mut builder = TreeBuilder::new();
        let mut next_index = Index::new();
        let mut hashed = 0;
        for (processed, (key, file)) in files.iter().enumerate() {
            if options.cancel.is_cancelled() {
                return Err(cancelled(SnapshotPhase::Walking));
            }
            let blob = match index.cached_blob(key, file) {
                Some(blob) if inner.store.contains(blob.raw()) => blob,
                _ => {
                    hashed += 1;
                    inner.store.put_file(&file.path)?
                }
            };
            builder.insert(key, blob)?;
            if let Some(entry) = IndexEntry::new(key, blob, file) {
                next_index.insert(entry);
            }
            options.report(Progress {
                phase: SnapshotPhase::Walking,
                processed: processed + 1,
                total,
                current: Some(key.clone()),
            });
        }

        enter_phase(options, SnapshotPhase::BuildingTrees)?;
        let tree = builder.write(&inner.store)?;

        enter_phase(options, SnapshotPhase::WritingCommit)?;
        let commit = CommitBuilder::new(&inner.store)
            .tree(tree)
            .parent(parent)
            .message(message)
            .author(author)
            .commit()?;

        enter_phase(options, SnapshotPhase::UpdatingRef)?;
        let index_json = next_index.to_json()?;
        let index_path = self.index_path();
        let (reference, stash_index) = inner.transactions.with_transaction(|tx| -> RepositoryResult<_> {
            let staged = tx.write_staged(&index_json)?;
            tx.execute(FileOperation::move_file(staged, &index_path))?;
            // the ref moves last; everything before it can still be undone
            match target {
                CaptureTarget::Head => {
                    let (name, _) = inner.refs.resolve_target(HEAD)?;
                    tx.backup_file(&inner.refs.ref_path(&name))?;
                    Ok((inner.refs.update_head(commit, parent)?, None))
                }
                CaptureTarget::Stash => {
                    let (index, name) = inner.refs.create_stash(commit)?;
                    Ok((name, Some(index)))
                }
            }
        })?;

        Ok(Captured {
            commit,
            reference,
            stash_index,
            files: total,
            hashed,
        })
    }

    // ==================== Restore ====================

    /// Make the working tree match `commit`.
    ///
    /// Only tracked, non-ignored files are touched: files missing from the
    /// commit are deleted, missing or differing ones are written. Everything
    /// runs in one transaction, so a failure or cancellation leaves the tree
    /// exactly as it was. HEAD does not move.
    pub fn restore(&self, commit: CommitId, cancel: &CancellationToken) -> RepositoryResult<RestoreSummary> {
        let _guard = self.inner.write_lock.lock();
        self.restore_locked(commit, cancel)
    }

    /// Restore the working tree to stash `index`.
    pub fn apply_stash(&self, index: u64, cancel: &CancellationToken) -> RepositoryResult<RestoreSummary> {
        let _guard = self.inner.write_lock.lock();
        let commit = self
            .inner
            .refs
            .resolve(&RefManager::stash_ref_name(index))?
            .ok_or(RepositoryError::StashNotFound(index))?;
        tracing::info!(index, commit = %commit.short(), "applying stash");
        self.restore_locked(commit, cancel)
    }

    fn restore_locked(&self, commit: CommitId, cancel: &CancellationToken) -> RepositoryResult<RestoreSummary> {
        let inner = &self.inner;
        let span = tracing::info_span!("restore", commit = %commit.short());
        let _enter = span.enter();

        let wanted = flatten_tree(&inner.store, get_commit(&inner.store, commit)?.commit.tree)?;
        let index = Index::load(&self.index_path())?;
        let engine = self.engine(&index)?;
        let working = engine.working_files()?;

        let mut summary = RestoreSummary {
            commit,
            written: 0,
            deleted: 0,
            unchanged: 0,
        };
        let result = inner.transactions.with_transaction(|tx| -> RepositoryResult<()> {
            // deletions first, so a file can make way for a directory
            for (key, file) in working.iter().filter(|(key, _)| !wanted.contains_key(*key)) {
                if cancel.is_cancelled() {
                    return Err(cancelled("restore"));
                }
                tx.execute(FileOperation::delete(&file.path))?;
                tracing::trace!(path = %key, "deleted");
                summary.deleted += 1;
            }

            for (key, blob) in &wanted {
                if cancel.is_cancelled() {
                    return Err(cancelled("restore"));
                }
                if matches_working(&engine, &working, key, *blob)? {
                    summary.unchanged += 1;
                    continue;
                }
                let path = inner.project_root.join(key);
                // a directory emptied by the deletions above may stand where the file goes
                tx.remove_empty_dir(&path)?;
                let bytes = inner.store.get_blob(*blob)?;
                let staged = tx.write_staged(&bytes)?;
                tx.execute(FileOperation::move_file(staged, path))?;
                summary.written += 1;
            }
            Ok(())
        });

        match &result {
            Ok(()) => tracing::info!(
                written = summary.written,
                deleted = summary.deleted,
                unchanged = summary.unchanged,
                "working tree restored"
            ),
            Err(e) => tracing::warn!(error = %e, "restore rolled back"),
        }
        result.map(|()| summary)
    }

    // ==================== Listings ====================

    /// stashes by ascending index
    pub fn list_stashes(&self) -> RepositoryResult<Vec<StashInfo>> {
        self.inner
            .refs
            .list_stashes()?
            .into_iter()
            .map(|(index, id)| {
                let info = get_commit(&self.inner.store, id)?;
                Ok(StashInfo {
                    index,
                    commit: id,
                    message: info.commit.message,
                    author: info.commit.author,
                    timestamp: info.commit.timestamp,
                })
            })
            .collect()
    }

    pub fn list_branches(&self) -> RepositoryResult<Vec<(BranchName, CommitId)>> {
        Ok(self.inner.refs.list_branches()?)
    }

    pub fn list_tags(&self) -> RepositoryResult<Vec<(TagName, CommitId)>> {
        Ok(self.inner.refs.list_tags()?)
    }

    /// Create a branch at `at`, or at HEAD.
    pub fn create_branch(&self, name: &BranchName, at: Option<CommitId>) -> RepositoryResult<CommitId> {
        let _guard = self.inner.write_lock.lock();
        let target = self.target_or_head(at)?;
        self.inner.refs.create_branch(name, target)?;
        tracing::info!(branch = %name, commit = %target.short(), "branch created");
        Ok(target)
    }

    /// Create a tag at `at`, or at HEAD.
    pub fn create_tag(&self, name: &TagName, at: Option<CommitId>) -> RepositoryResult<CommitId> {
        let _guard = self.inner.write_lock.lock();
        let target = self.target_or_head(at)?;
        self.inner.refs.create_tag(name, target)?;
        tracing::info!(tag = %name, commit = %target.short(), "tag created");
        Ok(target)
    }

    fn target_or_head(&self, at: Option<CommitId>) -> RepositoryResult<CommitId> {
        match at {
            Some(id) => {
                get_commit(&self.inner.store, id)?;
                Ok(id)
            }
            None => self.inner.refs.head_commit()?.ok_or_else(|| StorageError::EmptyRepository.into()),
        }
    }

    /// First-parent history from HEAD, newest first.
    pub fn history(&self, limit: Option<usize>) -> RepositoryResult<Vec<CommitInfo>> {
        let Some(head) = self.inner.refs.head_commit()? else {
            return Ok(Vec::new());
        };
        let commits = history(&self.inner.store, head)
            .take(limit.unwrap_or(usize::MAX))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(commits)
    }

    pub fn get_commit(&self, id: CommitId) -> RepositoryResult<CommitInfo> {
        Ok(get_commit(&self.inner.store, id)?)
    }

    /// Content of `path` as captured in `commit`.
    pub fn read_file_at(&self, commit: CommitId, path: &str) -> RepositoryResult<Vec<u8>> {
        let tree = get_commit(&self.inner.store, commit)?.commit.tree;
        match lookup_path(&self.inner.store, tree, path)? {
            Some(entry) if entry.kind == EntryKind::Blob => Ok(self.inner.store.get_blob(BlobId::new(entry.id))?),
            _ => Err(RepositoryError::PathNotFound {
                commit,
                path: path.to_string(),
            }),
        }
    }

    // ==================== Diff and validation ====================

    /// Working tree compared with HEAD.
    pub fn status(&self) -> RepositoryResult<Vec<Change>> {
        let (_, base) = self.head_tree()?;
        let index = Index::load(&self.index_path())?;
        Ok(self.engine(&index)?.compare_working_directory(base)?)
    }

    /// Changes from commit `a` to commit `b`.
    pub fn diff_commits(&self, a: CommitId, b: CommitId) -> RepositoryResult<Vec<Change>> {
        let store = &self.inner.store;
        let old = get_commit(store, a)?.commit.tree;
        let new = get_commit(store, b)?.commit.tree;
        Ok(diff_trees(store, Some(old), Some(new))?)
    }

    /// Run `validator` over the pending changes without capturing anything.
    pub fn validate_pending_changes(&self, validator: &dyn Validator) -> RepositoryResult<ValidationReport> {
        let changes = self.status()?;
        let issues = validator.validate(&self.inner.project_root, &changes);
        Ok(ValidationReport::new(issues, changes.len()))
    }

    // ==================== Automatic operations ====================

    /// Snapshot on behalf of a scheduler. Skipped while the circuit breaker
    /// is open, and when nothing changed since HEAD.
    pub fn auto_snapshot(&self, message: &str, author: &str, cancel: &CancellationToken) -> RepositoryResult<AutoOutcome> {
        self.guarded("auto snapshot", || {
            if self.status()?.is_empty() {
                return Ok(AutoOutcome::NoChanges);
            }
            let options = SnapshotOptions::new().cancel(cancel.clone());
            self.create_snapshot(&CommitMessage::automatic(message), author, &options)
                .map(AutoOutcome::Snapshot)
        })
    }

    /// Stash on behalf of a scheduler, with the same gating as
    /// [`auto_snapshot`](Self::auto_snapshot).
    pub fn auto_stash(&self, message: &str, author: &str, cancel: &CancellationToken) -> RepositoryResult<AutoOutcome> {
        self.guarded("auto stash", || {
            if self.status()?.is_empty() {
                return Ok(AutoOutcome::NoChanges);
            }
            let options = SnapshotOptions::new().cancel(cancel.clone());
            self.create_stash_with(&CommitMessage::automatic(message), author, &options)
                .map(AutoOutcome::Stash)
        })
    }

    fn guarded<F>(&self, operation: &str, f: F) -> RepositoryResult<AutoOutcome>
    where
        F: FnOnce() -> RepositoryResult<AutoOutcome>,
    {
        let breaker = &self.inner.breaker;
        if breaker.is_open()? {
            let reason = breaker.status()?;
            tracing::warn!(operation, status = %reason, "circuit breaker open, skipping");
            return Ok(AutoOutcome::Skipped { reason });
        }

        match f() {
            Ok(outcome) => {
                breaker.record_success()?;
                Ok(outcome)
            }
            // cancellation is a decision, not a failure
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                match breaker.record_failure(operation) {
                    Ok(state) => tracing::warn!(
                        operation,
                        failures = state.consecutive_failures,
                        error = %e,
                        "automatic operation failed"
                    ),
                    Err(record_err) => tracing::error!(error = %record_err, "could not record breaker failure"),
                }
                Err(e)
            }
        }
    }

    /// A background runner sized by `queue_capacity`.
    pub fn task_runner(&self) -> RepositoryResult<TaskRunner> {
        TaskRunner::new(self.inner.config.queue_capacity())
            .map_err(|e| RepositoryError::io_at(&self.inner.project_root, e))
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn breaker_status(&self) -> RepositoryResult<String> {
        Ok(self.inner.breaker.status()?)
    }

    pub fn reset_breaker(&self) -> RepositoryResult<()> {
        self.inner.breaker.reset()?;
        tracing::info!("circuit breaker reset");
        Ok(())
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("project_root", &self.inner.project_root)
            .field("config", &self.inner.config)
            .finish()
    }
}

fn cancelled(during: impl ToString) -> RepositoryError {
    RepositoryError::Cancelled {
        during: during.to_string(),
    }
}

/// Cancellation checkpoint between snapshot phases.
fn enter_phase(options: &SnapshotOptions, phase: SnapshotPhase) -> RepositoryResult<()> {
    if options.cancel.is_cancelled() {
        return Err(cancelled(phase));
    }
    tracing::debug!(phase = %phase, "entering phase");
    options.report(Progress::phase(phase, 0, 0));
    Ok(())
}

fn matches_working(
    engine: &DiffEngine<'_>,
    working: &BTreeMap<String, WorkingFile>,
    key: &str,
    blob: BlobId,
) -> RepositoryResult<bool> {
    match working.get(key) {
        Some(file) => Ok(engine.blob_of(key, file)? == blob),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::validation::{Severity, ValidationIssue};
    use crate::storage::ChangeKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init_with(RepositoryOptions::new(dir.path()).in_memory_breaker(true)).unwrap();
        (dir, repo)
    }

    fn write(dir: &TempDir, path: &str, content: &str) {
        let path = dir.path().join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn snapshot(repo: &Repository, message: &str) -> CommitId {
        repo.create_snapshot(message, "tester", &SnapshotOptions::default())
            .unwrap()
            .commit
    }

    struct Flagging(Severity);

    impl Validator for Flagging {
        fn validate(&self, _root: &Path, changes: &[Change]) -> Vec<ValidationIssue> {
            changes
                .iter()
                .map(|c| ValidationIssue::new(self.0, "test", "flagged").path(c.path.clone()))
                .collect()
        }
    }

    #[test]
    fn test_init_layout() {
        let (dir, repo) = setup();
        let control = dir.path().join(CONTROL_DIR);
        assert!(control.join(OBJECTS_DIR).is_dir());
        assert_eq!(fs::read_to_string(control.join("HEAD")).unwrap(), "ref: refs/heads/main\n");
        assert_eq!(fs::read_to_string(control.join(INDEX_FILE)).unwrap(), "[]");
        let config: serde_json::Value =
            serde_json::from_slice(&fs::read(control.join(CONFIG_FILE)).unwrap()).unwrap();
        assert_eq!(config, serde_json::json!({"version": "1.0"}));
        assert_eq!(repo.head().unwrap(), None);

        assert!(matches!(
            Repository::init(dir.path()),
            Err(RepositoryError::Storage(StorageError::AlreadyInitialized(_)))
        ));
    }

    #[test]
    fn test_open_missing() {
        let dir = TempDir::new().unwrap();
        let err = Repository::open(dir.path()).unwrap_err();
        assert!(err.is_not_found());
        assert!(Repository::open_or_init(dir.path()).is_ok());
        assert!(Repository::open(dir.path()).is_ok());
    }

    #[test]
    fn test_snapshot_moves_head_and_writes_index() {
        let (dir, repo) = setup();
        write(&dir, "a.txt", "alpha");
        write(&dir, "sub/b.txt", "beta");

        let first = repo.create_snapshot("first", "tester", &SnapshotOptions::default()).unwrap();
        assert_eq!(first.reference, "refs/heads/main");
        assert_eq!(first.files, 2);
        assert_eq!(first.hashed, 2);
        assert_eq!(repo.head().unwrap(), Some(first.commit));
        assert!(repo.status().unwrap().is_empty());

        let index = Index::load(&dir.path().join(CONTROL_DIR).join(INDEX_FILE)).unwrap();
        assert_eq!(index.len(), 2);

        write(&dir, "a.txt", "alpha 2");
        let second = snapshot(&repo, "second");
        let info = repo.get_commit(second).unwrap();
        assert_eq!(info.commit.parent, Some(first.commit));
        assert_eq!(
            repo.diff_commits(first.commit, second).unwrap(),
            vec![Change::new("a.txt", ChangeKind::Modified)]
        );
        assert!(!repo.transactions().marker_path().exists());
    }

    #[test]
    fn test_progress_events() {
        let (dir, repo) = setup();
        write(&dir, "a.txt", "a");
        write(&dir, "b.txt", "b");

        let walked = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (w, d) = (Arc::clone(&walked), Arc::clone(&done));
        let options = SnapshotOptions::new().progress(move |p| match p.phase {
            SnapshotPhase::Walking if p.current.is_some() => {
                w.fetch_add(1, Ordering::SeqCst);
            }
            SnapshotPhase::Done => {
                d.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        });
        repo.create_snapshot("with progress", "tester", &options).unwrap();
        assert_eq!(walked.load(Ordering::SeqCst), 2);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_snapshot_keeps_head() {
        let (dir, repo) = setup();
        write(&dir, "a.txt", "a");
        let first = snapshot(&repo, "first");
        write(&dir, "a.txt", "changed");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = repo
            .create_snapshot("never", "tester", &SnapshotOptions::new().cancel(cancel))
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(repo.head().unwrap(), Some(first));
    }

    #[test]
    fn test_validation_blocks_unless_confirmed() {
        let (dir, repo) = setup();
        write(&dir, "a.txt", "a");

        let blocking = SnapshotOptions::new().validate(Arc::new(Flagging(Severity::Error)));
        let err = repo.create_snapshot("blocked", "tester", &blocking).unwrap_err();
        match err {
            RepositoryError::ValidationBlocked { blocking, paths } => {
                assert_eq!(blocking, 1);
                assert_eq!(paths, vec![PathBuf::from("a.txt")]);
            }
            other => panic!("expected ValidationBlocked, got {:?}", other),
        }
        assert_eq!(repo.head().unwrap(), None);

        let warning = SnapshotOptions::new().validate(Arc::new(Flagging(Severity::Warning)));
        repo.create_snapshot("warned", "tester", &warning).unwrap();

        write(&dir, "a.txt", "b");
        repo.create_snapshot("confirmed", "tester", &blocking.confirm_blocking_issues(true))
            .unwrap();

        write(&dir, "a.txt", "c");
        let report = repo.validate_pending_changes(&Flagging(Severity::Critical)).unwrap();
        assert_eq!(report.changes, 1);
        assert!(report.requires_confirmation());
    }

    #[test]
    fn test_stash_leaves_head_alone() {
        let (dir, repo) = setup();
        write(&dir, "a.txt", "a");
        let head = snapshot(&repo, "base");

        write(&dir, "a.txt", "work in progress");
        let first = repo.create_stash("wip 1", "tester").unwrap();
        let second = repo.create_stash("wip 2", "tester").unwrap();
        assert_eq!((first.index, second.index), (0, 1));
        assert_eq!(repo.head().unwrap(), Some(head));

        let stashes = repo.list_stashes().unwrap();
        assert_eq!(stashes.len(), 2);
        assert_eq!(stashes[1].message, "wip 2");
        assert_eq!(stashes[1].commit, second.commit);
        // stash commits are not part of the history
        assert_eq!(repo.history(None).unwrap().len(), 1);
    }

    #[test]
    fn test_restore_and_apply_stash() {
        let (dir, repo) = setup();
        write(&dir, "keep.txt", "keep");
        write(&dir, "edit.txt", "v1");
        let base = snapshot(&repo, "base");

        write(&dir, "edit.txt", "v2");
        write(&dir, "new/extra.txt", "extra");
        let stash = repo.create_stash("wip", "tester").unwrap();

        let summary = repo.restore(base, &CancellationToken::new()).unwrap();
        assert_eq!(summary.written, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(fs::read_to_string(dir.path().join("edit.txt")).unwrap(), "v1");
        assert!(!dir.path().join("new/extra.txt").exists());
        assert!(repo.status().unwrap().is_empty());

        repo.apply_stash(stash.index, &CancellationToken::new()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("edit.txt")).unwrap(), "v2");
        assert_eq!(fs::read_to_string(dir.path().join("new/extra.txt")).unwrap(), "extra");
        assert_eq!(repo.head().unwrap(), Some(base));

        assert!(matches!(
            repo.apply_stash(99, &CancellationToken::new()),
            Err(RepositoryError::StashNotFound(99))
        ));
    }

    #[test]
    fn test_cancelled_restore_changes_nothing() {
        let (dir, repo) = setup();
        write(&dir, "a.txt", "old");
        let base = snapshot(&repo, "base");
        write(&dir, "a.txt", "new");
        write(&dir, "b.txt", "untracked");

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(repo.restore(base, &cancel).unwrap_err().is_cancelled());
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dir.path().join("b.txt")).unwrap(), "untracked");
    }

    #[test]
    fn test_file_replaced_by_directory() {
        let (dir, repo) = setup();
        write(&dir, "node/child.txt", "child");
        let with_dir = snapshot(&repo, "dir");

        fs::remove_dir_all(dir.path().join("node")).unwrap();
        write(&dir, "node", "now a file");
        let with_file = snapshot(&repo, "file");

        repo.restore(with_dir, &CancellationToken::new()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("node/child.txt")).unwrap(), "child");

        repo.restore(with_file, &CancellationToken::new()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("node")).unwrap(), "now a file");
    }

    #[test]
    fn test_branches_tags_and_files() {
        let (dir, repo) = setup();
        assert!(repo
            .create_branch(&BranchName::new("feature").unwrap(), None)
            .unwrap_err()
            .is_not_found());

        write(&dir, "docs/readme.md", "hello");
        let head = snapshot(&repo, "docs");
        repo.create_branch(&BranchName::new("feature").unwrap(), None).unwrap();
        repo.create_tag(&TagName::new("v1").unwrap(), Some(head)).unwrap();

        let branches: Vec<String> = repo
            .list_branches()
            .unwrap()
            .into_iter()
            .map(|(b, _)| b.as_str().to_string())
            .collect();
        assert_eq!(branches, vec!["feature", "main"]);
        assert_eq!(repo.list_tags().unwrap()[0].1, head);

        assert_eq!(repo.read_file_at(head, "docs/readme.md").unwrap(), b"hello");
        assert!(matches!(
            repo.read_file_at(head, "docs"),
            Err(RepositoryError::PathNotFound { .. })
        ));
    }

    #[test]
    fn test_history_limit() {
        let (dir, repo) = setup();
        assert!(repo.history(None).unwrap().is_empty());
        for i in 0..4 {
            write(&dir, "a.txt", &i.to_string());
            snapshot(&repo, &format!("snapshot {}", i));
        }
        let recent = repo.history(Some(2)).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].summary(), "snapshot 3");
        assert_eq!(repo.history(None).unwrap().len(), 4);
    }

    #[test]
    fn test_auto_snapshot_gating() {
        let (dir, repo) = setup();
        let cancel = CancellationToken::new();
        assert_eq!(repo.auto_snapshot("hourly", "scheduler", &cancel).unwrap(), AutoOutcome::NoChanges);

        write(&dir, "a.txt", "a");
        match repo.auto_snapshot("hourly", "scheduler", &cancel).unwrap() {
            AutoOutcome::Snapshot(summary) => {
                let info = repo.get_commit(summary.commit).unwrap();
                assert_eq!(info.commit.message, "[auto] hourly");
            }
            other => panic!("expected a snapshot, got {:?}", other),
        }

        for _ in 0..3 {
            repo.breaker().record_failure("auto snapshot").unwrap();
        }
        write(&dir, "a.txt", "b");
        let head = repo.head().unwrap();
        assert!(matches!(
            repo.auto_stash("hourly", "scheduler", &cancel).unwrap(),
            AutoOutcome::Skipped { .. }
        ));
        assert_eq!(repo.head().unwrap(), head);
        assert!(repo.list_stashes().unwrap().is_empty());

        // user-initiated calls ignore the breaker
        repo.create_stash("manual", "tester").unwrap();

        repo.reset_breaker().unwrap();
        assert!(matches!(
            repo.auto_stash("hourly", "scheduler", &cancel).unwrap(),
            AutoOutcome::Stash(_)
        ));
        assert_eq!(repo.breaker_status().unwrap(), "closed (0/3 failures)");
    }
}
