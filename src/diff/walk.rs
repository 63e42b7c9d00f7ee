//! Working-tree enumeration.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use crate::diff::ignore::IgnoreRules;
use crate::storage::{StorageError, StorageResult};

/// A regular file found in the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingFile {
    /// absolute path on disk
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Project-relative path with `/` separators, or `None` for names that are
/// not valid UTF-8.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Check a configured tracked root: relative, no `..`, not empty.
pub fn validate_tracked_root(root: &str) -> bool {
    let path = Path::new(root);
    !root.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Whether the walk should descend into (or report) `path`.
fn keep_entry(root: &Path, path: &Path, is_dir: bool, rules: &IgnoreRules) -> bool {
    match relative_key(root, path) {
        Some(key) if key.is_empty() => true,
        Some(key) => !rules.is_ignored(&key, is_dir),
        None => {
            tracing::warn!(path = %path.display(), is_dir, "skipping entry with non-utf-8 name");
            false
        }
    }
}

/// Collect all regular files below `root` that are not ignored.
///
/// An empty `tracked_roots` means the whole project. Symlinks and special
/// files are skipped. Keys are sorted byte-wise.
pub fn walk_working_tree(
    root: &Path,
    tracked_roots: &[String],
    rules: &IgnoreRules,
) -> StorageResult<BTreeMap<String, WorkingFile>> {
    let starts: Vec<PathBuf> = if tracked_roots.is_empty() {
        vec![root.to_path_buf()]
    } else {
        tracked_roots
            .iter()
            .filter(|r| validate_tracked_root(r))
            .map(|r| root.join(r))
            .collect()
    };

    let mut files = BTreeMap::new();
    for start in starts {
        if !start.exists() {
            tracing::debug!(path = %start.display(), "tracked root does not exist");
            continue;
        }

        let walker = WalkDir::new(&start)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| keep_entry(root, e.path(), e.file_type().is_dir(), rules));

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| start.clone());
                StorageError::IoAt {
                    path,
                    source: e.into(),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            // names without a key were already dropped by keep_entry
            let Some(key) = relative_key(root, entry.path()) else {
                continue;
            };
            let metadata = entry.metadata().map_err(|e| StorageError::IoAt {
                path: entry.path().to_path_buf(),
                source: e.into(),
            })?;
            files.insert(
                key,
                WorkingFile {
                    path: entry.path().to_path_buf(),
                    size: metadata.len(),
                    modified: metadata.modified().ok(),
                },
            );
        }
    }
    Ok(files)
}
