//! Working-directory and tree-to-tree comparison.
//!
//! Both comparisons report one [`Change`] per path, sorted by the path's
//! bytes, so two runs over the same state print identically. Directories are
//! not represented; an empty directory never shows up as a change.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::path::{Path, PathBuf};

use crate::diff::ignore::IgnoreRules;
use crate::diff::walk::{walk_working_tree, WorkingFile};
use crate::storage::{
    flatten_tree, BlobId, Change, ChangeKind, ObjectStore, StorageResult, TreeId,
};

/// A source of already-known blob IDs for unchanged files.
pub trait HashCache {
    /// the cached blob for `path`, if the file's stat data still matches
    fn cached_blob(&self, path: &str, file: &WorkingFile) -> Option<BlobId>;
}

/// Compares the working directory against stored trees.
pub struct DiffEngine<'a> {
    store: &'a ObjectStore,
    root: PathBuf,
    tracked_roots: Vec<String>,
    rules: IgnoreRules,
    cache: Option<&'a dyn HashCache>,
}

impl<'a> DiffEngine<'a> {
    pub fn new(store: &'a ObjectStore, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            root: root.into(),
            tracked_roots: Vec::new(),
            rules: IgnoreRules::empty(),
            cache: None,
        }
    }

    pub fn tracked_roots(mut self, roots: Vec<String>) -> Self {
        self.tracked_roots = roots;
        self
    }

    pub fn ignore_rules(mut self, rules: IgnoreRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn cache(mut self, cache: &'a dyn HashCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// current working files, honouring tracked roots and ignore rules
    pub fn working_files(&self) -> StorageResult<BTreeMap<String, WorkingFile>> {
        walk_working_tree(&self.root, &self.tracked_roots, &self.rules)
    }

    /// blob ID of a working file, from the cache when possible
    pub fn blob_of(&self, key: &str, file: &WorkingFile) -> StorageResult<BlobId> {
        if let Some(blob) = self.cache.and_then(|c| c.cached_blob(key, file)) {
            return Ok(blob);
        }
        ObjectStore::hash_file(&file.path)
    }

    /// Compare the working directory with `base` (`None`: everything is new).
    pub fn compare_working_directory(&self, base: Option<TreeId>) -> StorageResult<Vec<Change>> {
        let working = self.working_files()?;
        let stored = match base {
            Some(tree) => flatten_tree(self.store, tree)?,
            None => BTreeMap::new(),
        };

        let mut changes = Vec::new();
        for (key, side) in MergeJoin::new(working.iter(), stored.iter()) {
            let kind = match side {
                Side::Left(_) => ChangeKind::Added,
                Side::Right(_) => ChangeKind::Deleted,
                Side::Both(file, stored_blob) => {
                    // only files present on both sides need hashing
                    if self.blob_of(key, file)? == *stored_blob {
                        continue;
                    }
                    ChangeKind::Modified
                }
            };
            changes.push((key.clone(), kind));
        }
        Ok(into_changes(changes))
    }
}

/// Compare `root` against `base_tree` with the given ignore rules.
pub fn compare_working_directory(
    store: &ObjectStore,
    root: &Path,
    base_tree: Option<TreeId>,
    rules: &IgnoreRules,
) -> StorageResult<Vec<Change>> {
    DiffEngine::new(store, root)
        .ignore_rules(rules.clone())
        .compare_working_directory(base_tree)
}

/// Compare two stored trees. `None` stands for the empty tree.
pub fn diff_trees(store: &ObjectStore, old: Option<TreeId>, new: Option<TreeId>) -> StorageResult<Vec<Change>> {
    if old == new {
        return Ok(Vec::new());
    }
    let flatten = |tree: Option<TreeId>| match tree {
        Some(id) => flatten_tree(store, id),
        None => Ok(BTreeMap::new()),
    };
    let old = flatten(old)?;
    let new = flatten(new)?;

    let mut changes = Vec::new();
    for (key, side) in MergeJoin::new(new.iter(), old.iter()) {
        let kind = match side {
            Side::Left(_) => ChangeKind::Added,
            Side::Right(_) => ChangeKind::Deleted,
            Side::Both(a, b) if a == b => continue,
            Side::Both(_, _) => ChangeKind::Modified,
        };
        changes.push((key.clone(), kind));
    }
    Ok(into_changes(changes))
}

fn into_changes(mut changes: Vec<(String, ChangeKind)>) -> Vec<Change> {
    // String order is byte order; PathBuf order is not
    changes.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    changes
        .into_iter()
        .map(|(path, kind)| Change::new(path, kind))
        .collect()
}

enum Side<L, R> {
    Left(L),
    Right(R),
    Both(L, R),
}

/// Walks two key-sorted iterators in lockstep.
struct MergeJoin<'k, L, R, A, B>
where
    A: Iterator<Item = (&'k String, L)>,
    B: Iterator<Item = (&'k String, R)>,
{
    left: Peekable<A>,
    right: Peekable<B>,
}

impl<'k, L, R, A, B> MergeJoin<'k, L, R, A, B>
where
    A: Iterator<Item = (&'k String, L)>,
    B: Iterator<Item = (&'k String, R)>,
{
    fn new(left: A, right: B) -> Self {
        Self {
            left: left.peekable(),
            right: right.peekable(),
        }
    }
}

impl<'k, L, R, A, B> Iterator for MergeJoin<'k, L, R, A, B>
where
    A: Iterator<Item = (&'k String, L)>,
    B: Iterator<Item = (&'k String, R)>,
{
    type Item = (&'k String, Side<L, R>);

    fn next(&mut self) -> Option<Self::Item> {
        let order = match (self.left.peek(), self.right.peek()) {
            (None, None) => return None,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((l, _)), Some((r, _))) => l.cmp(r),
        };
        match order {
            Ordering::Less => self.left.next().map(|(k, l)| (k, Side::Left(l))),
            Ordering::Greater => self.right.next().map(|(k, r)| (k, Side::Right(r))),
            Ordering::Equal => {
                let (k, l) = self.left.next()?;
                let (_, r) = self.right.next()?;
                Some((k, Side::Both(l, r)))
            }
        }
    }
}
