//! Ignore rules read from the project's `.pgignore`.
//!
//! One glob per line, `#` starts a comment. Later rules override earlier
//! ones. `!pattern` re-includes, a trailing `/` limits a rule to directories,
//! and a pattern containing `/` is anchored at the project root; otherwise it
//! matches the last path component at any depth.

use std::fs;
use std::io;
use std::path::Path;

use glob::{MatchOptions, Pattern};

use crate::storage::{StorageError, StorageResult};

pub const IGNORE_FILE: &str = ".pgignore";

/// top-level entries that are never part of a snapshot
pub const ALWAYS_IGNORED: &[&str] = &[".pgvc", ".pgvc-work"];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct IgnoreRule {
    pattern: Pattern,
    negated: bool,
    dir_only: bool,
    anchored: bool,
}

impl IgnoreRule {
    fn parse(line: &str) -> Option<Result<Self, glob::PatternError>> {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (negated, rest) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (dir_only, rest) = match rest.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let (leading_slash, rest) = match rest.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        if rest.is_empty() {
            return None;
        }

        Some(Pattern::new(rest).map(|pattern| IgnoreRule {
            pattern,
            negated,
            dir_only,
            anchored: leading_slash || rest.contains('/'),
        }))
    }

    fn matches(&self, relative: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        let candidate = if self.anchored {
            relative
        } else {
            relative.rsplit('/').next().unwrap_or(relative)
        };
        self.pattern.matches_with(candidate, MATCH_OPTIONS)
    }
}

/// An ordered set of ignore rules; the last matching rule decides.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<IgnoreRule>,
}

impl IgnoreRules {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse ignore-file text. Invalid globs are skipped with a warning.
    pub fn parse(text: &str) -> Self {
        let mut rules = Vec::new();
        for (number, line) in text.lines().enumerate() {
            match IgnoreRule::parse(line) {
                None => {}
                Some(Ok(rule)) => rules.push(rule),
                Some(Err(e)) => {
                    tracing::warn!(line = number + 1, pattern = line, error = %e, "skipping invalid ignore pattern")
                }
            }
        }
        Self { rules }
    }

    /// Load `<project>/.pgignore`; a missing file means no rules.
    pub fn load(project_root: &Path) -> StorageResult<Self> {
        let path = project_root.join(IGNORE_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::empty()),
            Err(e) => Err(StorageError::IoAt { path, source: e }),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether a project-relative, `/`-separated path is excluded.
    pub fn is_ignored(&self, relative: &str, is_dir: bool) -> bool {
        let first = relative.split('/').next().unwrap_or(relative);
        if ALWAYS_IGNORED.contains(&first) {
            return true;
        }

        let mut ignored = false;
        for rule in &self.rules {
            if rule.matches(relative, is_dir) {
                ignored = !rule.negated;
            }
        }
        ignored
    }
}
