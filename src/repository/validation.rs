//! Pre-flight validation of pending changes.
//!
//! Validators are supplied by the host; the repository only runs them and
//! aggregates what they report. Info and warning issues never block. Error
//! and critical issues block a snapshot unless the caller confirms.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::storage::{Change, ChangeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Severity::Error | Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

/// A single finding reported by a validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub category: String,
    pub title: String,
    pub description: String,
    pub affected_paths: Vec<PathBuf>,
    pub suggested_action: Option<String>,
    pub auto_fixable: bool,
}

impl ValidationIssue {
    pub fn new(severity: Severity, category: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            severity,
            category: category.into(),
            title: title.into(),
            description: String::new(),
            affected_paths: Vec::new(),
            suggested_action: None,
            auto_fixable: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.affected_paths.push(path.into());
        self
    }

    pub fn suggested_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }

    pub fn auto_fixable(mut self, value: bool) -> Self {
        self.auto_fixable = value;
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.category, self.title)
    }
}

/// Checks pending changes before they are captured.
pub trait Validator: Send + Sync {
    /// `changes` are relative to `project_root`
    fn validate(&self, project_root: &Path, changes: &[Change]) -> Vec<ValidationIssue>;
}

/// Aggregated validator output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
    /// number of pending changes that were validated
    pub changes: usize,
}

impl ValidationReport {
    pub fn new(issues: Vec<ValidationIssue>, changes: usize) -> Self {
        Self { issues, changes }
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    pub fn blocking(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity.is_blocking())
    }

    /// true when an error or critical issue needs the caller's confirmation
    pub fn requires_confirmation(&self) -> bool {
        self.blocking().next().is_some()
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// paths named by blocking issues
    pub fn blocking_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.blocking().flat_map(|i| i.affected_paths.iter().cloned()).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    pub fn summary(&self) -> String {
        format!(
            "{} changes: {} critical, {} errors, {} warnings, {} info",
            self.changes,
            self.count(Severity::Critical),
            self.count(Severity::Error),
            self.count(Severity::Warning),
            self.count(Severity::Info)
        )
    }
}

/// Flags large added or modified files.
#[derive(Debug, Clone, Copy)]
pub struct FileSizeValidator {
    pub warn_bytes: u64,
    pub error_bytes: u64,
}

impl Default for FileSizeValidator {
    fn default() -> Self {
        Self {
            warn_bytes: 100 * 1024 * 1024,
            error_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl Validator for FileSizeValidator {
    fn validate(&self, project_root: &Path, changes: &[Change]) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for change in changes {
            if change.kind == ChangeKind::Deleted {
                continue;
            }
            let Ok(metadata) = fs::metadata(project_root.join(&change.path)) else {
                continue;
            };
            let size = metadata.len();
            let severity = if size >= self.error_bytes {
                Severity::Error
            } else if size >= self.warn_bytes {
                Severity::Warning
            } else {
                continue;
            };
            issues.push(
                ValidationIssue::new(severity, "size", "large file")
                    .description(format!("{} is {} bytes", change.path.display(), size))
                    .path(change.path.clone())
                    .suggested_action("add it to .pgignore if it is a build artifact"),
            );
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_report_counts() {
        let report = ValidationReport::new(
            vec![
                ValidationIssue::new(Severity::Info, "naming", "odd name"),
                ValidationIssue::new(Severity::Warning, "size", "big").path("a.bin"),
            ],
            2,
        );
        assert!(!report.requires_confirmation());
        assert_eq!(report.count(Severity::Warning), 1);
        assert_eq!(report.summary(), "2 changes: 0 critical, 0 errors, 1 warnings, 1 info");
    }

    #[test]
    fn test_blocking_issues() {
        let report = ValidationReport::new(
            vec![
                ValidationIssue::new(Severity::Critical, "refs", "broken").path("b"),
                ValidationIssue::new(Severity::Error, "refs", "broken").path("a").path("b"),
            ],
            1,
        );
        assert!(report.requires_confirmation());
        assert_eq!(report.blocking_paths(), vec![PathBuf::from("a"), PathBuf::from("b")]);
    }

    #[test]
    fn test_file_size_validator() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("small.txt"), "hi").unwrap();
        fs::write(dir.path().join("big.bin"), vec![0u8; 64]).unwrap();

        let validator = FileSizeValidator {
            warn_bytes: 10,
            error_bytes: 50,
        };
        let changes = vec![
            Change::new("small.txt", ChangeKind::Added),
            Change::new("big.bin", ChangeKind::Modified),
            Change::new("gone.bin", ChangeKind::Deleted),
        ];
        let issues = validator.validate(dir.path(), &changes);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Error);
        assert_eq!(issues[0].affected_paths, vec![PathBuf::from("big.bin")]);
    }
}
