//! Reference management.
//!
//! Refs are small text files under the control directory that name a commit.
//! This module handles:
//! - HEAD, which is symbolic (`ref: refs/heads/main`)
//! - branches and tags under `refs/heads/` and `refs/tags/`
//! - automatic stashes under `refs/stash/auto/<n>`, never reused
//!
//! Every write goes to a sibling temp file first and is renamed into place, so
//! a reader sees either the old or the new content.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::storage::error::{IoResultExt, StorageError, StorageResult};
use crate::storage::object::{sync_dir, WriteMode};
use crate::storage::types::{validate_ref_fragment, BranchName, CommitId, TagName};

pub const HEAD: &str = "HEAD";
pub const STASH_PREFIX: &str = "refs/stash/auto/";

/// symbolic refs are followed at most this many hops
pub const MAX_SYMREF_DEPTH: usize = 5;

const SYMBOLIC_PREFIX: &str = "ref: ";

/// The content of one ref file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
    Direct(CommitId),
    Symbolic(String),
}

impl RefValue {
    fn parse(name: &str, content: &str) -> StorageResult<Self> {
        let content = content.trim_end_matches(['\n', '\r']);
        if let Some(target) = content.strip_prefix(SYMBOLIC_PREFIX) {
            let target = target.trim();
            if !is_valid_ref_name(target) {
                return Err(StorageError::MalformedRef {
                    name: name.to_string(),
                    reason: format!("invalid symbolic target '{}'", target),
                });
            }
            return Ok(RefValue::Symbolic(target.to_string()));
        }

        CommitId::from_hex(content.trim())
            .map(RefValue::Direct)
            .map_err(|e| StorageError::MalformedRef {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    pub(crate) fn to_file_content(&self) -> String {
        match self {
            RefValue::Direct(id) => format!("{}\n", id),
            RefValue::Symbolic(target) => format!("{}{}\n", SYMBOLIC_PREFIX, target),
        }
    }
}

fn is_valid_ref_name(name: &str) -> bool {
    name == HEAD || (name.starts_with("refs/") && validate_ref_fragment(name).is_ok())
}

/// Manages the ref files below one control directory.
#[derive(Debug, Clone)]
pub struct RefManager {
    root: PathBuf,
    mode: WriteMode,
}

impl RefManager {
    pub fn new(root: impl Into<PathBuf>, mode: WriteMode) -> Self {
        Self {
            root: root.into(),
            mode,
        }
    }

    /// Create the ref directories and point HEAD at the (unborn) default branch.
    pub fn init(&self, default_branch: &BranchName) -> StorageResult<()> {
        for dir in ["refs/heads", "refs/tags", "refs/stash/auto"] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path).at(&path)?;
        }
        self.write_ref(HEAD, &RefValue::Symbolic(default_branch.as_ref_path()))
    }

    /// check that a full ref name is acceptable
    pub fn validate_name(name: &str) -> StorageResult<()> {
        if is_valid_ref_name(name) {
            Ok(())
        } else {
            Err(StorageError::InvalidRefName(name.to_string()))
        }
    }

    /// on-disk location of a ref
    pub fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    // ==================== Reads ====================

    /// Read a ref without following symbolic targets. `None` if absent.
    pub fn read_ref(&self, name: &str) -> StorageResult<Option<RefValue>> {
        Self::validate_name(name)?;
        let path = self.ref_path(name);
        match fs::read_to_string(&path) {
            Ok(content) => RefValue::parse(name, &content).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::IoAt { path, source: e }),
        }
    }

    /// Follow symbolic refs until a direct ref (or an unborn one) is reached.
    ///
    /// Returns the name of the last ref in the chain and its commit, if any.
    pub fn resolve_target(&self, name: &str) -> StorageResult<(String, Option<CommitId>)> {
        let mut current = name.to_string();
        for _ in 0..=MAX_SYMREF_DEPTH {
            match self.read_ref(&current)? {
                None => return Ok((current, None)),
                Some(RefValue::Direct(id)) => return Ok((current, Some(id))),
                Some(RefValue::Symbolic(target)) => current = target,
            }
        }
        Err(StorageError::RefCycle {
            name: name.to_string(),
            depth: MAX_SYMREF_DEPTH,
        })
    }

    /// Resolve a ref to a commit. `None` for an absent or unborn ref.
    pub fn resolve(&self, name: &str) -> StorageResult<Option<CommitId>> {
        self.resolve_target(name).map(|(_, id)| id)
    }

    /// the commit HEAD points at, `None` before the first snapshot
    pub fn head_commit(&self) -> StorageResult<Option<CommitId>> {
        self.resolve(HEAD)
    }

    /// the ref HEAD ultimately writes through (HEAD itself when detached)
    pub fn head_target(&self) -> StorageResult<String> {
        self.resolve_target(HEAD).map(|(target, _)| target)
    }

    /// the branch HEAD is attached to, if HEAD is symbolic
    pub fn head_branch(&self) -> StorageResult<Option<BranchName>> {
        match self.read_ref(HEAD)? {
            Some(RefValue::Symbolic(target)) => match target.strip_prefix("refs/heads/") {
                Some(branch) => Ok(Some(BranchName::new(branch)?)),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// All refs whose name starts with `prefix`, sorted by name.
    pub fn list_refs(&self, prefix: &str) -> StorageResult<Vec<(String, RefValue)>> {
        let refs_dir = self.root.join("refs");
        if !refs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut refs = Vec::new();
        for entry in WalkDir::new(&refs_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| StorageError::Io(e.into()))?;
            // temp files from in-flight writes start with a dot
            if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let Some(name) = self.name_of(entry.path()) else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            if let Some(value) = self.read_ref(&name)? {
                refs.push((name, value));
            }
        }
        refs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(refs)
    }

    fn name_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_str().map(str::to_string))
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }

    // ==================== Writes ====================

    /// Atomically replace a ref's content.
    pub fn write_ref(&self, name: &str, value: &RefValue) -> StorageResult<()> {
        Self::validate_name(name)?;
        let (temp, target) = self.staged_ref(name, value)?;
        temp.persist(&target)
            .map_err(|e| StorageError::IoAt { path: target.clone(), source: e.error })?;
        self.finish_write(&target)?;
        tracing::debug!(reference = name, "ref updated");
        Ok(())
    }

    /// Delete a ref. Returns whether it existed.
    pub fn delete_ref(&self, name: &str) -> StorageResult<bool> {
        Self::validate_name(name)?;
        if name == HEAD {
            return Err(StorageError::InvalidRefName("HEAD cannot be deleted".to_string()));
        }
        let path = self.ref_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::IoAt { path, source: e }),
        }
    }

    /// Move the branch HEAD points at to `new`.
    ///
    /// Fails with `ConcurrentModification` when the branch no longer points at
    /// `expected`. Returns the name of the ref that was written.
    pub fn update_head(&self, new: CommitId, expected: Option<CommitId>) -> StorageResult<String> {
        let (target, current) = self.resolve_target(HEAD)?;
        if current != expected {
            return Err(StorageError::ConcurrentModification { reference: target });
        }
        self.write_ref(&target, &RefValue::Direct(new))?;
        Ok(target)
    }

    fn staged_ref(&self, name: &str, value: &RefValue) -> StorageResult<(NamedTempFile, PathBuf)> {
        let target = self.ref_path(name);
        let parent = target
            .parent()
            .ok_or_else(|| StorageError::Internal(format!("ref path without parent: {}", target.display())))?
            .to_path_buf();
        fs::create_dir_all(&parent).at(&parent)?;

        let mut temp = tempfile::Builder::new()
            .prefix(".ref-")
            .tempfile_in(&parent)
            .at(&parent)?;
        temp.write_all(value.to_file_content().as_bytes()).at(temp.path())?;
        if self.mode == WriteMode::Safe {
            temp.as_file().sync_all().at(temp.path())?;
        }
        Ok((temp, target))
    }

    fn finish_write(&self, target: &Path) -> StorageResult<()> {
        if self.mode == WriteMode::Safe {
            if let Some(parent) = target.parent() {
                sync_dir(parent)?;
            }
        }
        Ok(())
    }

    // ==================== Branches and tags ====================

    pub fn branch_exists(&self, branch: &BranchName) -> StorageResult<bool> {
        Ok(self.read_ref(&branch.as_ref_path())?.is_some())
    }

    /// Create a new branch pointing to the given commit.
    pub fn create_branch(&self, branch: &BranchName, target: CommitId) -> StorageResult<()> {
        self.create_no_clobber(&branch.as_ref_path(), target)
    }

    pub fn list_branches(&self) -> StorageResult<Vec<(BranchName, CommitId)>> {
        self.list_direct("refs/heads/")?
            .into_iter()
            .map(|(name, id)| Ok((BranchName::new(name)?, id)))
            .collect()
    }

    /// Create a tag. Tags are never moved.
    pub fn create_tag(&self, tag: &TagName, target: CommitId) -> StorageResult<()> {
        self.create_no_clobber(&tag.as_ref_path(), target)
    }

    pub fn list_tags(&self) -> StorageResult<Vec<(TagName, CommitId)>> {
        self.list_direct("refs/tags/")?
            .into_iter()
            .map(|(name, id)| Ok((TagName::new(name)?, id)))
            .collect()
    }

    fn list_direct(&self, prefix: &str) -> StorageResult<Vec<(String, CommitId)>> {
        Ok(self
            .list_refs(prefix)?
            .into_iter()
            .filter_map(|(name, value)| match value {
                RefValue::Direct(id) => Some((name[prefix.len()..].to_string(), id)),
                RefValue::Symbolic(_) => None,
            })
            .collect())
    }

    fn create_no_clobber(&self, name: &str, target: CommitId) -> StorageResult<()> {
        Self::validate_name(name)?;
        let (temp, path) = self.staged_ref(name, &RefValue::Direct(target))?;
        match temp.persist_noclobber(&path) {
            Ok(_) => self.finish_write(&path),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                Err(StorageError::RefAlreadyExists(name.to_string()))
            }
            Err(e) => Err(StorageError::IoAt { path, source: e.error }),
        }
    }

    // ==================== Stashes ====================

    /// Existing stash indices, ascending.
    pub fn stash_indices(&self) -> StorageResult<Vec<u64>> {
        let mut indices: Vec<u64> = self
            .list_refs(STASH_PREFIX)?
            .into_iter()
            .filter_map(|(name, _)| name[STASH_PREFIX.len()..].parse().ok())
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    /// one past the highest index in use, so deleted indices are never reused
    pub fn next_stash_index(&self) -> StorageResult<u64> {
        Ok(self.stash_indices()?.last().map_or(0, |max| max + 1))
    }

    pub fn stash_ref_name(index: u64) -> String {
        format!("{}{}", STASH_PREFIX, index)
    }

    /// Write a new stash ref at the next free index and return it.
    pub fn create_stash(&self, target: CommitId) -> StorageResult<(u64, String)> {
        let mut index = self.next_stash_index()?;
        loop {
            let name = Self::stash_ref_name(index);
            match self.create_no_clobber(&name, target) {
                Ok(()) => {
                    tracing::debug!(index, commit = %target.short(), "stash ref created");
                    return Ok((index, name));
                }
                // lost a race for this index
                Err(StorageError::RefAlreadyExists(_)) => index += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// stash refs with their commits, by ascending index
    pub fn list_stashes(&self) -> StorageResult<Vec<(u64, CommitId)>> {
        let mut stashes = Vec::new();
        for index in self.stash_indices()? {
            if let Some(id) = self.resolve(&Self::stash_ref_name(index))? {
                stashes.push((index, id));
            }
        }
        Ok(stashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::ObjectId;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RefManager) {
        let dir = TempDir::new().unwrap();
        let refs = RefManager::new(dir.path(), WriteMode::Fast);
        refs.init(&BranchName::main()).unwrap();
        (dir, refs)
    }

    fn commit(byte: u8) -> CommitId {
        CommitId::new(ObjectId::from_bytes([byte; 32]))
    }

    #[test]
    fn test_init_has_unborn_head() {
        let (dir, refs) = setup();
        let head = fs::read_to_string(dir.path().join("HEAD")).unwrap();
        assert_eq!(head, "ref: refs/heads/main\n");
        assert_eq!(refs.head_commit().unwrap(), None);
        assert_eq!(refs.head_branch().unwrap(), Some(BranchName::main()));
        assert_eq!(refs.head_target().unwrap(), "refs/heads/main");
    }

    #[test]
    fn test_detached_head_updates_itself() {
        let (_dir, refs) = setup();
        refs.write_ref(HEAD, &RefValue::Direct(commit(1))).unwrap();
        assert_eq!(refs.head_target().unwrap(), HEAD);
        assert_eq!(refs.head_branch().unwrap(), None);
        refs.update_head(commit(2), Some(commit(1))).unwrap();
        assert_eq!(refs.read_ref(HEAD).unwrap(), Some(RefValue::Direct(commit(2))));
        assert_eq!(refs.resolve("refs/heads/main").unwrap(), None);
    }

    #[test]
    fn test_update_head_moves_branch() {
        let (_dir, refs) = setup();
        let target = refs.update_head(commit(1), None).unwrap();
        assert_eq!(target, "refs/heads/main");
        assert_eq!(refs.head_commit().unwrap(), Some(commit(1)));

        refs.update_head(commit(2), Some(commit(1))).unwrap();
        assert_eq!(refs.resolve("refs/heads/main").unwrap(), Some(commit(2)));
    }

    #[test]
    fn test_update_head_detects_concurrent_change() {
        let (_dir, refs) = setup();
        refs.update_head(commit(1), None).unwrap();
        let result = refs.update_head(commit(3), Some(commit(2)));
        assert!(matches!(result, Err(StorageError::ConcurrentModification { .. })));
        assert_eq!(refs.head_commit().unwrap(), Some(commit(1)));
    }

    #[test]
    fn test_symbolic_cycle_detected() {
        let (_dir, refs) = setup();
        refs.write_ref("refs/heads/a", &RefValue::Symbolic("refs/heads/b".into()))
            .unwrap();
        refs.write_ref("refs/heads/b", &RefValue::Symbolic("refs/heads/a".into()))
            .unwrap();
        let result = refs.resolve("refs/heads/a");
        assert!(matches!(result, Err(StorageError::RefCycle { depth: 5, .. })));
    }

    #[test]
    fn test_chain_within_depth_resolves() {
        let (_dir, refs) = setup();
        refs.write_ref("refs/heads/c4", &RefValue::Direct(commit(7))).unwrap();
        for i in (0..4).rev() {
            refs.write_ref(
                &format!("refs/heads/c{}", i),
                &RefValue::Symbolic(format!("refs/heads/c{}", i + 1)),
            )
            .unwrap();
        }
        refs.write_ref(HEAD, &RefValue::Symbolic("refs/heads/c0".into())).unwrap();
        // HEAD -> c0 -> c1 -> c2 -> c3 -> c4 is five hops
        assert_eq!(refs.head_commit().unwrap(), Some(commit(7)));
    }

    #[test]
    fn test_malformed_ref() {
        let (dir, refs) = setup();
        fs::write(dir.path().join("refs/heads/main"), "not a commit\n").unwrap();
        let err = refs.head_commit().unwrap_err();
        assert!(matches!(err, StorageError::MalformedRef { .. }));
        assert!(err.is_integrity_fault());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (_dir, refs) = setup();
        assert!(refs.read_ref("heads/main").is_err());
        assert!(refs.read_ref("refs/../escape").is_err());
        assert!(refs.write_ref("refs/heads/a b", &RefValue::Direct(commit(1))).is_err());
        assert!(refs.delete_ref(HEAD).is_err());
    }

    #[test]
    fn test_branches_and_tags() {
        let (_dir, refs) = setup();
        refs.update_head(commit(1), None).unwrap();
        let feature = BranchName::new("feature/x").unwrap();
        refs.create_branch(&feature, commit(2)).unwrap();
        assert!(refs.branch_exists(&feature).unwrap());
        assert!(matches!(
            refs.create_branch(&feature, commit(3)),
            Err(StorageError::RefAlreadyExists(_))
        ));

        let branches = refs.list_branches().unwrap();
        assert_eq!(
            branches,
            vec![(feature, commit(2)), (BranchName::main(), commit(1))]
        );

        let tag = TagName::new("v1").unwrap();
        refs.create_tag(&tag, commit(1)).unwrap();
        assert!(refs.create_tag(&tag, commit(2)).is_err());
        assert_eq!(refs.list_tags().unwrap(), vec![(tag, commit(1))]);
    }

    #[test]
    fn test_stash_indices_are_not_reused() {
        let (_dir, refs) = setup();
        assert_eq!(refs.next_stash_index().unwrap(), 0);

        let (first, name) = refs.create_stash(commit(1)).unwrap();
        assert_eq!(first, 0);
        assert_eq!(name, "refs/stash/auto/0");
        assert_eq!(refs.create_stash(commit(2)).unwrap().0, 1);
        assert_eq!(refs.create_stash(commit(3)).unwrap().0, 2);

        assert!(refs.delete_ref(&RefManager::stash_ref_name(2)).unwrap());
        assert!(refs.delete_ref(&RefManager::stash_ref_name(0)).unwrap());
        assert_eq!(refs.next_stash_index().unwrap(), 2);

        let stashes = refs.list_stashes().unwrap();
        assert_eq!(stashes, vec![(1, commit(2))]);
    }

    #[test]
    fn test_stash_indices_sort_numerically() {
        let (_dir, refs) = setup();
        for i in 0..12u8 {
            refs.create_stash(commit(i)).unwrap();
        }
        let indices = refs.stash_indices().unwrap();
        assert_eq!(indices, (0..12).collect::<Vec<u64>>());
        assert_eq!(refs.next_stash_index().unwrap(), 12);
    }

    #[test]
    fn test_list_refs_skips_temp_files() {
        let (dir, refs) = setup();
        refs.update_head(commit(1), None).unwrap();
        fs::write(dir.path().join("refs/heads/.ref-abc"), "garbage").unwrap();
        let all = refs.list_refs("refs/").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "refs/heads/main");
    }
}
