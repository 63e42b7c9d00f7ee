//! Change detection between the working directory and stored trees.
//!
//! ```text
//!   .pgignore ──► IgnoreRules ──► walk ──► DiffEngine ──► [Change]
//!                                             ▲
//!                              ObjectStore ───┘ (base tree, hashing)
//! ```

mod engine;
mod ignore;
mod walk;

pub use engine::{compare_working_directory, diff_trees, DiffEngine, HashCache};
pub use ignore::{IgnoreRules, ALWAYS_IGNORED, IGNORE_FILE};
pub use walk::{relative_key, validate_tracked_root, walk_working_tree, WorkingFile};
