//! tree objects: the content-addressed form of a directory.
//!
//! A tree lists its direct children by name. Entries are kept in a `BTreeMap`,
//! so they are always encoded in byte-wise name order:
//!
//! ```text
//! blob 3f1c...e9\tlogo.png
//! tree a90b...12\tmeshes
//! ```
//!
//! A tree's ID depends only on its children's names and IDs, so identical
//! subdirectories in different snapshots are stored once.

use std::collections::BTreeMap;

use crate::storage::canonical::{Canonical, DecodeError, ObjectKind};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::object::ObjectStore;
use crate::storage::types::{BlobId, InvalidNameError, ObjectId, TreeId};

/// what a tree entry points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Blob,
    Tree,
}

impl EntryKind {
    fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Blob => "blob",
            EntryKind::Tree => "tree",
        }
    }
}

/// one child of a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeEntry {
    pub kind: EntryKind,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn blob(id: BlobId) -> Self {
        Self {
            kind: EntryKind::Blob,
            id: id.raw(),
        }
    }

    pub fn tree(id: TreeId) -> Self {
        Self {
            kind: EntryKind::Tree,
            id: id.raw(),
        }
    }
}

/// check a single path segment used as a tree entry name
pub fn validate_entry_name(name: &str) -> Result<(), InvalidNameError> {
    if name.is_empty() {
        return Err(InvalidNameError::Empty);
    }
    if name == "." || name == ".." {
        return Err(InvalidNameError::InvalidPath(name.to_string()));
    }
    if let Some(position) = name.find(['/', '\0', '\n']) {
        let char = name[position..].chars().next().unwrap_or('/');
        return Err(InvalidNameError::InvalidCharacter { char, position });
    }
    Ok(())
}

/// An immutable directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// add or replace a child
    pub fn insert(&mut self, name: impl Into<String>, entry: TreeEntry) -> Result<(), InvalidNameError> {
        let name = name.into();
        validate_entry_name(&name)?;
        self.entries.insert(name, entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    /// children in canonical (byte-wise name) order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &TreeEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Canonical for Tree {
    const KIND: ObjectKind = ObjectKind::Tree;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 80);
        for (name, entry) in &self.entries {
            out.extend_from_slice(entry.kind.as_str().as_bytes());
            out.push(b' ');
            out.extend_from_slice(entry.id.to_hex().as_bytes());
            out.push(b'\t');
            out.extend_from_slice(name.as_bytes());
            out.push(b'\n');
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::new("tree is not utf-8"))?;
        let mut tree = Tree::new();
        let mut previous: Option<&str> = None;

        for line in text.split_terminator('\n') {
            let (head, name) = line
                .split_once('\t')
                .ok_or_else(|| DecodeError::new(format!("tree line without tab: {:?}", line)))?;
            let (kind, hex) = head
                .split_once(' ')
                .ok_or_else(|| DecodeError::new(format!("tree line without kind: {:?}", line)))?;
            let kind = match kind {
                "blob" => EntryKind::Blob,
                "tree" => EntryKind::Tree,
                other => return Err(DecodeError::new(format!("unknown entry kind '{}'", other))),
            };
            let id = ObjectId::from_hex(hex).map_err(|e| DecodeError::new(e.to_string()))?;

            if previous.is_some_and(|prev| prev >= name) {
                return Err(DecodeError::new(format!("entries out of order at '{}'", name)));
            }
            previous = Some(name);

            tree.insert(name, TreeEntry { kind, id })
                .map_err(|e| DecodeError::new(e.to_string()))?;
        }
        Ok(tree)
    }
}

/// Split a `/`-separated repository path into validated segments.
pub(crate) fn split_repo_path(path: &str) -> Result<Vec<&str>, InvalidNameError> {
    let segments: Vec<&str> = path.split('/').collect();
    for segment in &segments {
        validate_entry_name(segment).map_err(|_| InvalidNameError::InvalidPath(path.to_string()))?;
    }
    Ok(segments)
}

#[derive(Debug, Default)]
struct PendingDir {
    files: BTreeMap<String, BlobId>,
    dirs: BTreeMap<String, PendingDir>,
}

impl PendingDir {
    fn file_count(&self) -> usize {
        self.files.len() + self.dirs.values().map(PendingDir::file_count).sum::<usize>()
    }
}

/// Accumulates `(path, blob)` pairs and writes the nested trees bottom-up.
///
/// Insertion order does not matter; the result depends only on the final set
/// of pairs. Directories that end up empty are not written.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    root: PendingDir,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// record a file at a `/`-separated path relative to the tree root
    pub fn insert(&mut self, path: &str, blob: BlobId) -> StorageResult<()> {
        let segments = split_repo_path(path)?;
        let (file_name, dirs) = segments
            .split_last()
            .ok_or_else(|| InvalidNameError::InvalidPath(path.to_string()))?;

        let mut dir = &mut self.root;
        for segment in dirs {
            if dir.files.contains_key(*segment) {
                return Err(InvalidNameError::InvalidPath(path.to_string()).into());
            }
            dir = dir.dirs.entry(segment.to_string()).or_default();
        }
        if dir.dirs.contains_key(*file_name) {
            return Err(InvalidNameError::InvalidPath(path.to_string()).into());
        }
        dir.files.insert(file_name.to_string(), blob);
        Ok(())
    }

    /// number of files recorded
    pub fn len(&self) -> usize {
        self.root.file_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every tree, deepest first, and return the root tree's ID.
    ///
    /// The root is always written, even when empty.
    pub fn write(&self, store: &ObjectStore) -> StorageResult<TreeId> {
        let root = write_dir(&self.root, store)?;
        match root {
            Some(id) => Ok(TreeId::new(id)),
            None => store.put_object(&Tree::new()).map(TreeId::new),
        }
    }
}

fn write_dir(dir: &PendingDir, store: &ObjectStore) -> StorageResult<Option<ObjectId>> {
    let mut tree = Tree::new();
    for (name, sub) in &dir.dirs {
        if let Some(id) = write_dir(sub, store)? {
            tree.insert(name.clone(), TreeEntry::tree(TreeId::new(id)))?;
        }
    }
    for (name, blob) in &dir.files {
        tree.insert(name.clone(), TreeEntry::blob(*blob))?;
    }

    if tree.is_empty() {
        return Ok(None);
    }
    store.put_object(&tree).map(Some)
}

/// Read a tree object.
pub fn read_tree(store: &ObjectStore, id: TreeId) -> StorageResult<Tree> {
    store.get_object::<Tree>(id.raw())
}

/// Expand a stored tree into every file path it contains, sorted by path bytes.
pub fn flatten_tree(store: &ObjectStore, id: TreeId) -> StorageResult<BTreeMap<String, BlobId>> {
    let mut out = BTreeMap::new();
    flatten_into(store, id, "", &mut out)?;
    Ok(out)
}

fn flatten_into(
    store: &ObjectStore,
    id: TreeId,
    prefix: &str,
    out: &mut BTreeMap<String, BlobId>,
) -> StorageResult<()> {
    let tree = read_tree(store, id)?;
    for (name, entry) in tree.entries() {
        let path = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        };
        match entry.kind {
            EntryKind::Blob => {
                out.insert(path, BlobId::new(entry.id));
            }
            EntryKind::Tree => flatten_into(store, TreeId::new(entry.id), &path, out)?,
        }
    }
    Ok(())
}

/// Find the entry at a `/`-separated path, if any.
pub fn lookup_path(store: &ObjectStore, root: TreeId, path: &str) -> StorageResult<Option<TreeEntry>> {
    let segments = split_repo_path(path)?;
    let mut current = read_tree(store, root)?;

    for (i, segment) in segments.iter().enumerate() {
        let entry = match current.get(segment) {
            Some(entry) => *entry,
            None => return Ok(None),
        };
        if i + 1 == segments.len() {
            return Ok(Some(entry));
        }
        if entry.kind != EntryKind::Tree {
            return Ok(None);
        }
        current = read_tree(store, TreeId::new(entry.id))?;
    }
    Err(StorageError::Internal(format!("empty path lookup: {:?}", path)))
}
