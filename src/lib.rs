//! pgvc - an embedded snapshot store for large project trees
//!
//! This crate snapshots a project directory into a content-addressed object
//! store, keeps ad-hoc stash checkpoints, and rewrites working files through
//! transactions that survive crashes. Everything lives in `.pgvc/` next to
//! the project.
//!
//! # Example
//!
//! ```no_run
//! use pgvc::repository::{Repository, SnapshotOptions};
//!
//! let repo = Repository::open_or_init("./my_project").unwrap();
//! let snapshot = repo.create_snapshot("initial import", "alice", &SnapshotOptions::default()).unwrap();
//! println!("HEAD is now {}", snapshot.commit);
//! for change in repo.status().unwrap() {
//!     println!("{}", change);
//! }
//! ```

pub mod breaker;
pub mod diff;
pub mod repository;
pub mod storage;
pub mod tasks;
pub mod telemetry;
pub mod transaction;
