//! Commit creation and history traversal
//!
//! commits are immutable records pointing at a root tree. In pgvc:
//! - each snapshot creates a commit whose parent is the previous HEAD
//! - each stash creates a parentless-by-branch commit reachable only by its ref
//! - history is a linear walk over first parents
//!
//! Canonical encoding:
//!
//! ```text
//! tree <hex>
//! parent <hex>          (absent for root commits)
//! author <author>
//! timestamp <unix seconds>
//!
//! <message>
//! ```

use chrono::{DateTime, TimeZone, Utc};

use crate::storage::canonical::{Canonical, DecodeError, ObjectKind};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::object::ObjectStore;
use crate::storage::types::{CommitId, ObjectId, TreeId};

/// an immutable commit object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: TreeId,
    pub parent: Option<CommitId>,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Commit {
    /// get a short summary of the commit (first line of message)
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }
}

impl Canonical for Commit {
    const KIND: ObjectKind = ObjectKind::Commit;

    fn encode(&self) -> Vec<u8> {
        let mut out = format!("tree {}\n", self.tree);
        if let Some(parent) = self.parent {
            out.push_str(&format!("parent {}\n", parent));
        }
        out.push_str(&format!("author {}\n", self.author));
        out.push_str(&format!("timestamp {}\n", self.timestamp.timestamp()));
        out.push('\n');
        out.push_str(&self.message);
        out.into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::new("commit is not utf-8"))?;
        let (headers, message) = text
            .split_once("\n\n")
            .ok_or_else(|| DecodeError::new("commit without header terminator"))?;

        let mut tree = None;
        let mut parent = None;
        let mut author = None;
        let mut timestamp = None;

        for line in headers.lines() {
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| DecodeError::new(format!("malformed header line {:?}", line)))?;
            match key {
                "tree" => tree = Some(TreeId::new(parse_id(value)?)),
                "parent" => parent = Some(CommitId::new(parse_id(value)?)),
                "author" => author = Some(value.to_string()),
                "timestamp" => {
                    let secs: i64 = value
                        .parse()
                        .map_err(|_| DecodeError::new(format!("bad timestamp '{}'", value)))?;
                    let ts = Utc
                        .timestamp_opt(secs, 0)
                        .single()
                        .ok_or_else(|| DecodeError::new(format!("timestamp out of range: {}", secs)))?;
                    timestamp = Some(ts);
                }
                other => return Err(DecodeError::new(format!("unknown commit header '{}'", other))),
            }
        }

        Ok(Commit {
            tree: tree.ok_or_else(|| DecodeError::new("commit without tree"))?,
            parent,
            author: author.ok_or_else(|| DecodeError::new("commit without author"))?,
            message: message.to_string(),
            timestamp: timestamp.ok_or_else(|| DecodeError::new("commit without timestamp"))?,
        })
    }
}

fn parse_id(hex: &str) -> Result<ObjectId, DecodeError> {
    ObjectId::from_hex(hex).map_err(|e| DecodeError::new(e.to_string()))
}

/// a commit together with its ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: CommitId,
    pub commit: Commit,
}

impl CommitInfo {
    pub fn summary(&self) -> &str {
        self.commit.summary()
    }
}

/// builder for creating commits with a fluent interface
pub struct CommitBuilder<'a> {
    store: &'a ObjectStore,
    tree_id: Option<TreeId>,
    parent: Option<CommitId>,
    message: String,
    author: String,
    timestamp: Option<DateTime<Utc>>,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(store: &'a ObjectStore) -> Self {
        Self {
            store,
            tree_id: None,
            parent: None,
            message: String::new(),
            author: String::new(),
            timestamp: None,
        }
    }

    /// set the tree for this commit
    pub fn tree(mut self, tree_id: TreeId) -> Self {
        self.tree_id = Some(tree_id);
        self
    }

    /// set (or clear) the parent commit
    pub fn parent(mut self, parent: Option<CommitId>) -> Self {
        self.parent = parent;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// override the commit time (defaults to now)
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// create the commit and return its ID
    pub fn commit(self) -> StorageResult<CommitId> {
        let tree = self
            .tree_id
            .ok_or_else(|| StorageError::Internal("commit requires a tree".to_string()))?;

        if self.author.trim().is_empty() || self.author.contains('\n') {
            return Err(StorageError::InvalidAuthor(self.author.clone()));
        }

        // the tree and parent must already be stored
        if !self.store.contains(tree.raw()) {
            return Err(StorageError::ObjectNotFound(tree.raw()));
        }
        if let Some(parent) = self.parent {
            if !self.store.contains(parent.raw()) {
                return Err(StorageError::ObjectNotFound(parent.raw()));
            }
        }

        let now = self.timestamp.unwrap_or_else(Utc::now);
        // stored at second precision
        let timestamp = Utc.timestamp_opt(now.timestamp(), 0).single().unwrap_or(now);

        let commit = Commit {
            tree,
            parent: self.parent,
            author: self.author,
            message: self.message,
            timestamp,
        };
        self.store.put_object(&commit).map(CommitId::new)
    }
}

/// get information about a commit
pub fn get_commit(store: &ObjectStore, id: CommitId) -> StorageResult<CommitInfo> {
    let commit = store.get_object::<Commit>(id.raw())?;
    Ok(CommitInfo { id, commit })
}

/// iterate over first-parent history starting from a commit
pub struct HistoryIterator<'a> {
    store: &'a ObjectStore,
    next: Option<CommitId>,
}

impl<'a> Iterator for HistoryIterator<'a> {
    type Item = StorageResult<CommitInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        match get_commit(self.store, id) {
            Ok(info) => {
                self.next = info.commit.parent;
                Some(Ok(info))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// get history for a commit, newest first
pub fn history(store: &ObjectStore, start: CommitId) -> HistoryIterator<'_> {
    HistoryIterator {
        store,
        next: Some(start),
    }
}

/// message formatting for engine-generated commits
pub struct CommitMessage;

impl CommitMessage {
    /// message for an automatic (scheduler-initiated) snapshot or stash
    pub fn automatic(message: &str) -> String {
        format!("[auto] {}", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::object::WriteMode;
    use crate::storage::tree::TreeBuilder;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ObjectStore, TreeId) {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::init(dir.path().join("objects"), WriteMode::Fast).unwrap();
        let tree = TreeBuilder::new().write(&store).unwrap();
        (dir, store, tree)
    }

    #[test]
    fn test_commit_builder() {
        let (_dir, store, tree) = setup();

        let first = CommitBuilder::new(&store)
            .tree(tree)
            .author("a@b.com")
            .message("initial")
            .commit()
            .unwrap();
        let second = CommitBuilder::new(&store)
            .tree(tree)
            .parent(Some(first))
            .author("a@b.com")
            .message("Second commit\n\nwith body")
            .commit()
            .unwrap();

        let info = get_commit(&store, second).unwrap();
        assert_eq!(info.commit.parent, Some(first));
        assert_eq!(info.commit.tree, tree);
        assert_eq!(info.summary(), "Second commit");
        assert_eq!(info.commit.message, "Second commit\n\nwith body");
    }

    #[test]
    fn test_encode_decode_roundtrip_keeps_fields() {
        let (_dir, store, tree) = setup();
        let ts = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let id = CommitBuilder::new(&store)
            .tree(tree)
            .author("dev@studio")
            .message("")
            .timestamp(ts)
            .commit()
            .unwrap();
        let info = get_commit(&store, id).unwrap();
        assert_eq!(info.commit.timestamp, ts);
        assert_eq!(info.commit.message, "");
        assert_eq!(info.commit.parent, None);
    }

    #[test]
    fn test_same_content_same_id() {
        let (_dir, store, tree) = setup();
        let ts = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let build = || {
            CommitBuilder::new(&store)
                .tree(tree)
                .author("a@b.com")
                .message("m")
                .timestamp(ts)
                .commit()
                .unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_commit_requires_tree_and_author() {
        let (_dir, store, tree) = setup();
        assert!(CommitBuilder::new(&store).author("a").commit().is_err());
        assert!(matches!(
            CommitBuilder::new(&store).tree(tree).commit(),
            Err(StorageError::InvalidAuthor(author)) if author.is_empty()
        ));
        assert!(matches!(
            CommitBuilder::new(&store).tree(tree).author("a\nb").commit(),
            Err(StorageError::InvalidAuthor(author)) if author == "a\nb"
        ));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let (_dir, store, tree) = setup();
        let bogus = CommitId::new(ObjectId::from_bytes([9; 32]));
        let result = CommitBuilder::new(&store)
            .tree(tree)
            .parent(Some(bogus))
            .author("a")
            .commit();
        assert!(matches!(result, Err(StorageError::ObjectNotFound(_))));
    }

    #[test]
    fn test_history_iteration() {
        let (_dir, store, tree) = setup();
        let mut parent = None;
        let mut ids = Vec::new();
        for i in 0..3 {
            let id = CommitBuilder::new(&store)
                .tree(tree)
                .parent(parent)
                .author("a")
                .message(format!("c{}", i))
                .commit()
                .unwrap();
            ids.push(id);
            parent = Some(id);
        }

        let commits: Vec<_> = history(&store, ids[2]).collect::<Result<_, _>>().unwrap();
        assert_eq!(commits.len(), 3);
        assert_eq!(commits[0].id, ids[2]);
        assert_eq!(commits[1].id, ids[1]);
        assert_eq!(commits[2].id, ids[0]);
    }

    #[test]
    fn test_commit_messages() {
        assert_eq!(CommitMessage::automatic("hourly"), "[auto] hourly");
    }
}
