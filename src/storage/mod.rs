//! storage layer for pgvc
//!
//! this module owns everything under the control directory that is addressed
//! by content or by name. The upper layers (transaction manager, repository)
//! use this API and never build object or ref paths themselves.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Repository                            │
//! │        (snapshots, stashes, restore, history)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │    tree     │       │   commit    │       │    refs     │
//!  │ (directory) │       │  (history)  │       │ (HEAD, ...) │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!         │                     │
//!         └──────────┬──────────┘
//!                    ▼
//!             ┌─────────────┐
//!             │   object    │
//!             │  (content)  │
//!             └─────────────┘
//!  ```
//!
//! # Usage
//!
//! ```ignore
//! use pgvc::storage::{ObjectStore, TreeBuilder, CommitBuilder, WriteMode};
//!
//! let store = ObjectStore::init(".pgvc/objects", WriteMode::Fast)?;
//! let blob = store.put(b"hello")?;
//!
//! let mut builder = TreeBuilder::new();
//! builder.insert("docs/hello.txt", blob)?;
//! let tree = builder.write(&store)?;
//!
//! let commit = CommitBuilder::new(&store)
//!     .tree(tree)
//!     .author("dev@studio")
//!     .message("first")
//!     .commit()?;
//! ```

mod canonical;
mod commit;
mod error;
mod object;
mod refs;
mod tree;
mod types;

// Re-export public API
pub use canonical::{Canonical, DecodeError, ObjectKind};
pub use commit::{get_commit, history, Commit, CommitBuilder, CommitInfo, CommitMessage, HistoryIterator};
pub use error::{StorageError, StorageResult};
pub use object::{hash_object, ObjectStore, WriteMode};
pub use refs::{RefManager, RefValue, HEAD, MAX_SYMREF_DEPTH, STASH_PREFIX};
pub use tree::{flatten_tree, lookup_path, read_tree, EntryKind, Tree, TreeBuilder, TreeEntry};
pub use types::{
    BlobId, BranchName, Change, ChangeKind, CommitId, InvalidNameError, ObjectId, TagName, TreeId,
};

// Re-export for internal use by other modules
pub(crate) use error::IoResultExt;
pub(crate) use object::sync_dir;
