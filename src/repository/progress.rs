//! Progress reporting and cooperative cancellation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::repository::validation::Validator;

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a snapshot or stash is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotPhase {
    Idle,
    Validating,
    Walking,
    BuildingTrees,
    WritingCommit,
    UpdatingRef,
    Done,
    Aborted,
}

impl fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SnapshotPhase::Idle => "idle",
            SnapshotPhase::Validating => "validating",
            SnapshotPhase::Walking => "walking",
            SnapshotPhase::BuildingTrees => "building trees",
            SnapshotPhase::WritingCommit => "writing commit",
            SnapshotPhase::UpdatingRef => "updating ref",
            SnapshotPhase::Done => "done",
            SnapshotPhase::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub phase: SnapshotPhase,
    pub processed: usize,
    pub total: usize,
    /// project-relative path being processed
    pub current: Option<String>,
}

impl Progress {
    pub fn phase(phase: SnapshotPhase, processed: usize, total: usize) -> Self {
        Self {
            phase,
            processed,
            total,
            current: None,
        }
    }

    /// percentage in `0..=100`; `100` when there is nothing to do
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.processed.min(self.total) * 100) / self.total) as u8
    }
}

pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Options for [`create_snapshot`](crate::repository::Repository::create_snapshot)
/// and stashes.
#[derive(Clone, Default)]
pub struct SnapshotOptions {
    /// run this validator over the pending changes first
    pub validator: Option<Arc<dyn Validator>>,
    /// proceed even when validation reports error or critical issues
    pub confirm_blocking_issues: bool,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressCallback>,
}

impl SnapshotOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn confirm_blocking_issues(mut self, value: bool) -> Self {
        self.confirm_blocking_issues = value;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn progress(mut self, callback: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub(crate) fn report(&self, progress: Progress) {
        if let Some(callback) = &self.progress {
            callback(&progress);
        }
    }
}

impl fmt::Debug for SnapshotOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotOptions")
            .field("validate", &self.validator.is_some())
            .field("confirm_blocking_issues", &self.confirm_blocking_issues)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_percent() {
        assert_eq!(Progress::phase(SnapshotPhase::Walking, 0, 0).percent(), 100);
        assert_eq!(Progress::phase(SnapshotPhase::Walking, 1, 4).percent(), 25);
        assert_eq!(Progress::phase(SnapshotPhase::Walking, 9, 4).percent(), 100);
    }
}
