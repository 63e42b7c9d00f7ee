//! core type-safe identifiers and names for the storage layer.

use std::fmt;
use std::fmt::Formatter;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A SHA-256 content ID (32 bytes), rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// length of the hex form
    pub const HEX_LEN: usize = 64;

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// parse an ObjectId from its 64-character hex form
    pub fn from_hex(text: &str) -> Result<Self, InvalidNameError> {
        if text.len() != Self::HEX_LEN {
            return Err(InvalidNameError::InvalidObjectId(text.to_string()));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(text, &mut bytes).map_err(|_| InvalidNameError::InvalidObjectId(text.to_string()))?;
        Ok(Self(bytes))
    }

    /// short form, used in logs and listings
    pub fn short(&self) -> String {
        self.to_hex()[..10].to_string()
    }

    /// first two hex characters (fan-out directory) and the remainder
    pub(crate) fn split_hex(&self) -> (String, String) {
        let hex = self.to_hex();
        let (dir, file) = hex.split_at(2);
        (dir.to_string(), file.to_string())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl TryFrom<String> for ObjectId {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.to_hex()
    }
}

/// This makes sure we don't accidentally pass a blob ID where a commit ID
/// is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub(crate) ObjectId);

impl CommitId {
    pub(crate) fn new(id: ObjectId) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> ObjectId {
        self.0
    }

    /// parse CommitId from a hex string
    pub fn from_hex(hex: &str) -> Result<Self, InvalidNameError> {
        ObjectId::from_hex(hex).map(CommitId)
    }

    /// short form of the commit ID
    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// blob identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(pub(crate) ObjectId);

impl BlobId {
    pub(crate) fn new(id: ObjectId) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> ObjectId {
        self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// tree identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeId(pub(crate) ObjectId);

impl TreeId {
    pub(crate) fn new(id: ObjectId) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> ObjectId {
        self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Checks one `/`-separated ref name fragment (a branch or tag name).
pub(crate) fn validate_ref_fragment(name: &str) -> Result<(), InvalidNameError> {
    if name.is_empty() {
        return Err(InvalidNameError::Empty);
    }
    if name.len() > 200 {
        return Err(InvalidNameError::TooLong(name.len()));
    }
    for (i, c) in name.chars().enumerate() {
        if c.is_whitespace() || c.is_control() || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\') {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
    }
    if name
        .split('/')
        .any(|part| part.is_empty() || part.starts_with('.') || part.ends_with(".lock"))
    {
        return Err(InvalidNameError::InvalidPath(name.to_string()));
    }
    Ok(())
}

/// a validated branch name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchName(String);

impl BranchName {
    /// the default branch name
    pub const MAIN: &'static str = "main";

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        validate_ref_fragment(&name)?;
        Ok(Self(name))
    }

    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    /// full ref path (e.g., "refs/heads/main")
    pub fn as_ref_path(&self) -> String {
        format!("refs/heads/{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// a validated tag name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagName(String);

impl TagName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        validate_ref_fragment(&name)?;
        Ok(Self(name))
    }

    pub fn as_ref_path(&self) -> String {
        format!("refs/tags/{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// error type for invalid names (branches, tags, refs, tree entries, IDs)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidCharacter { char: char, position: usize },
    InvalidPath(String),
    InvalidObjectId(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character {:?} at position {}", char, position)
            }
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
            Self::InvalidObjectId(id) => write!(f, "invalid object id: '{}'", id),
        }
    }
}

impl std::error::Error for InvalidNameError {}

/// a single entry of a working-tree or tree-to-tree diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl Change {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.marker(), self.path.display())
    }
}

/// the type of change in a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// single-letter marker used in status output
    pub fn marker(&self) -> char {
        match self {
            ChangeKind::Added => 'A',
            ChangeKind::Modified => 'M',
            ChangeKind::Deleted => 'D',
        }
    }
}
