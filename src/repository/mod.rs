//! The repository: snapshots, stashes and restores for one project.
//!
//! # Layout
//!
//! ```text
//! <project>/.pgvc/            control directory
//!     objects/                content-addressed objects
//!     refs/heads/<name>       branches
//!     refs/stash/auto/<n>     stashes
//!     refs/tags/<name>
//!     HEAD                    ref: refs/heads/main
//!     index.json              stat cache
//!     config.json             {"version": "1.0"}
//!     breaker.json            circuit breaker state
//! <project>/.pgignore         ignore patterns
//! <project>/.pgvc-work/       transaction work area and crash marker
//! ```
//!
//! # Snapshot pipeline
//!
//! ```text
//! Idle ─► Validating ─► Walking ─► BuildingTrees ─► WritingCommit ─► UpdatingRef ─► Done
//!              └────────────┴────────────┴───────────────┴───────────────┴────► Aborted
//! ```
//!
//! Objects are written as the walk goes; they are harmless if the snapshot
//! aborts. The ref and the index are only touched in the last phase, inside
//! one transaction.
//!
//! # Usage
//!
//! ```ignore
//! use pgvc::repository::{Repository, SnapshotOptions};
//!
//! let repo = Repository::open_or_init("/path/to/project")?;
//! let summary = repo.create_snapshot("before import", "alice", &SnapshotOptions::default())?;
//! for change in repo.status()? {
//!     println!("{} {}", change.kind.marker(), change.path.display());
//! }
//! ```

mod config;
mod error;
mod index;
mod progress;
mod repo;
mod validation;

pub use config::{RepoConfig, RepositoryOptions, CONFIG_VERSION};
pub use error::{RepositoryError, RepositoryResult};
pub use index::{Index, IndexEntry, INDEX_FILE};
pub use progress::{CancellationToken, Progress, ProgressCallback, SnapshotOptions, SnapshotPhase};
pub use repo::{
    AutoOutcome, Repository, RestoreSummary, SnapshotSummary, StashInfo, StashSummary, BREAKER_FILE, CONFIG_FILE,
    CONTROL_DIR, OBJECTS_DIR, WORK_DIR,
};
pub use validation::{FileSizeValidator, Severity, ValidationIssue, ValidationReport, Validator};
