//! File operations applied inside a transaction.

use std::fmt;
use std::path::{Path, PathBuf};

/// Kind of a [`FileOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Move,
    Delete,
    Copy,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Move => "move",
            OpKind::Delete => "delete",
            OpKind::Copy => "copy",
        };
        write!(f, "{}", name)
    }
}

/// One mutation of the working tree or control directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperation {
    Move { from: PathBuf, to: PathBuf },
    Delete { path: PathBuf },
    Copy { from: PathBuf, to: PathBuf },
}

impl FileOperation {
    pub fn move_file(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        FileOperation::Move {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn delete(path: impl Into<PathBuf>) -> Self {
        FileOperation::Delete { path: path.into() }
    }

    pub fn copy(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        FileOperation::Copy {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Build an operation from its kind; `dst` is ignored for deletes.
    pub fn from_kind(kind: OpKind, src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        match kind {
            OpKind::Move => Self::move_file(src, dst),
            OpKind::Delete => Self::delete(src),
            OpKind::Copy => Self::copy(src, dst),
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            FileOperation::Move { .. } => OpKind::Move,
            FileOperation::Delete { .. } => OpKind::Delete,
            FileOperation::Copy { .. } => OpKind::Copy,
        }
    }

    /// the path whose previous content this operation replaces or removes
    pub fn destination(&self) -> &Path {
        match self {
            FileOperation::Move { to, .. } | FileOperation::Copy { to, .. } => to,
            FileOperation::Delete { path } => path,
        }
    }
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOperation::Move { from, to } | FileOperation::Copy { from, to } => {
                write!(f, "{} {} -> {}", self.kind(), from.display(), to.display())
            }
            FileOperation::Delete { path } => write!(f, "delete {}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_kind() {
        let op = FileOperation::from_kind(OpKind::Delete, "a.txt", "ignored");
        assert_eq!(op, FileOperation::delete("a.txt"));
        assert_eq!(op.destination(), Path::new("a.txt"));

        let op = FileOperation::from_kind(OpKind::Move, "staged/0", "a.txt");
        assert_eq!(op.kind(), OpKind::Move);
        assert_eq!(op.destination(), Path::new("a.txt"));
        assert_eq!(op.to_string(), "move staged/0 -> a.txt");
    }
}
