//! Transaction management for pgvc.
//!
//! This module makes multi-file changes all-or-nothing. A transaction backs up
//! every file before changing it, applies moves, deletes and copies right
//! away, and on failure puts everything back in reverse order. A crash marker
//! in the work area tells the next startup that a run was interrupted.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionManager                        │
//! │   (single active slot, crash marker, startup recovery)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                ┌─────────────┴─────────────┐
//!                │                           │
//!                ▼                           ▼
//!          ┌─────────────┐             ┌─────────────┐
//!          │ Transaction │             │FileOperation│
//!          │  (undo log) │             │ (move, ...) │
//!          └─────────────┘             └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use pgvc::transaction::{FileOperation, TransactionManager};
//!
//! let manager = TransactionManager::new(work_dir, store);
//! manager.recover_on_startup()?;
//!
//! manager.with_transaction(|tx| {
//!     let staged = tx.write_staged(b"new content")?;
//!     tx.execute(FileOperation::move_file(staged, "assets/a.txt"))?;
//!     tx.execute(FileOperation::delete("assets/old.txt"))?;
//!     Ok(())
//! })?;
//! ```

mod context;
mod error;
mod manager;
mod ops;

pub use context::{BackupManifest, BackupRecord, Transaction, TransactionMetadata};
pub use error::{RollbackFailure, TransactionError, TransactionResult};
pub use manager::{QuarantinedBackup, RecoveryReport, TransactionManager, LOCK_FILE, MARKER_FILE, RECOVERED_DIR};
pub use ops::{FileOperation, OpKind};
