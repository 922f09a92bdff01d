//! `revtrail check` command implementation.
//!
//! Validates a configuration file:
//! - YAML parsing and cross-entity validation
//! - Attribute lists that can never take effect
//! - Readability of an existing file-backed audit log

use anyhow::Result;
use revtrail_audit::{AuditedRegistry, FileStore};
use revtrail_core::{RevtrailConfig, StorageBackend};
use std::path::{Path, PathBuf};

// ============================================================================
// Check Result Types
// ============================================================================

/// Severity level for check results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// A single check finding.
#[derive(Debug, Clone)]
pub struct CheckFinding {
    pub severity: Severity,
    /// Category of the check that produced this finding.
    pub category: String,
    pub message: String,
    /// Optional location within the file (e.g., "entities.User.redacted").
    pub location: Option<String>,
}

impl CheckFinding {
    fn error(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, category, message)
    }

    fn warning(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, category, message)
    }

    fn info(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, category, message)
    }

    fn new(severity: Severity, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            category: category.into(),
            message: message.into(),
            location: None,
        }
    }

    fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Results of running all checks.
#[derive(Debug, Default)]
pub struct CheckResults {
    pub file: PathBuf,
    pub findings: Vec<CheckFinding>,
}

impl CheckResults {
    fn new(file: &Path) -> Self {
        Self {
            file: file.to_path_buf(),
            findings: Vec::new(),
        }
    }

    fn push(&mut self, finding: CheckFinding) {
        self.findings.push(finding);
    }

    pub fn has_errors(&self) -> bool {
        self.count(Severity::Error) > 0
    }

    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }

    /// Print findings grouped by severity, then a summary line.
    pub fn print_summary(&self) {
        println!("Checking {}...", self.file.display());

        for severity in [Severity::Error, Severity::Warning, Severity::Info] {
            let mut group: Vec<_> = self
                .findings
                .iter()
                .filter(|f| f.severity == severity)
                .collect();
            if group.is_empty() {
                continue;
            }
            group.sort_by(|a, b| a.category.cmp(&b.category));

            println!("\n{} ({}):", severity, group.len());
            println!("{}", "-".repeat(60));
            for finding in group {
                print_finding(finding);
            }
        }

        println!();
        if self.findings.iter().all(|f| f.severity == Severity::Info) {
            println!("All checks passed.");
        } else {
            println!(
                "{} error(s), {} warning(s).",
                self.error_count(),
                self.warning_count()
            );
        }
    }
}

fn print_finding(finding: &CheckFinding) {
    let location = finding
        .location
        .as_ref()
        .map(|l| format!(" [{}]", l))
        .unwrap_or_default();

    println!("  [{}]{}: {}", finding.category, location, finding.message);
}

// ============================================================================
// Main Check Runner
// ============================================================================

/// Run every check against the configuration at `config_path`.
pub fn run(config_path: &Path) -> Result<CheckResults> {
    let mut results = CheckResults::new(config_path);

    let config = match RevtrailConfig::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            results.push(CheckFinding::error("parse", e.to_string()));
            return Ok(results);
        }
    };

    if let Err(e) = AuditedRegistry::from_config(&config) {
        results.push(CheckFinding::error("validate", e.to_string()));
    }

    check_attribute_lists(&config, &mut results);
    check_storage(&config, config_path, &mut results);

    tracing::debug!(
        findings = results.findings.len(),
        errors = results.error_count(),
        "Configuration check finished"
    );
    Ok(results)
}

fn check_attribute_lists(config: &RevtrailConfig, results: &mut CheckResults) {
    let ignored = &config.audit.ignored_attributes;

    for (name, entity) in &config.entities {
        if entity.on.is_empty() {
            results.push(
                CheckFinding::warning("actions", format!("'{}' audits no actions", name))
                    .with_location(format!("entities.{}.on", name)),
            );
        }

        for attribute in entity.only.iter().filter(|a| ignored.contains(*a)) {
            results.push(
                CheckFinding::warning(
                    "attributes",
                    format!("'{}' is globally ignored and never recorded", attribute),
                )
                .with_location(format!("entities.{}.only", name)),
            );
        }

        for attribute in &entity.redacted {
            let excluded = entity.except.contains(attribute)
                || (!entity.only.is_empty() && !entity.only.contains(attribute))
                || ignored.contains(attribute);
            if excluded {
                results.push(
                    CheckFinding::warning(
                        "attributes",
                        format!("redacted attribute '{}' is never recorded", attribute),
                    )
                    .with_location(format!("entities.{}.redacted", name)),
                );
            }
        }
    }
}

fn check_storage(config: &RevtrailConfig, config_path: &Path, results: &mut CheckResults) {
    if !config.audit.enabled {
        results.push(CheckFinding::info("storage", "auditing is disabled"));
        return;
    }
    if config.audit.storage.backend != StorageBackend::File {
        return;
    }

    if config.audit.storage.file_path.is_none() {
        results.push(
            CheckFinding::info("storage", "no file_path set; using audit.log")
                .with_location("audit.storage.file_path"),
        );
    }

    // Relative log paths are resolved against the configuration's directory.
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let log_path = base_dir.join(config.audit.file_path());
    if !log_path.exists() {
        return;
    }

    if let Err(e) = FileStore::open(&log_path) {
        results.push(
            CheckFinding::error("storage", format!("audit log is unreadable: {}", e))
                .with_location("audit.storage.file_path"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn check(yaml: &str) -> (TempDir, CheckResults) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("revtrail.yaml");
        fs::write(&path, yaml).unwrap();
        let results = run(&path).unwrap();
        (dir, results)
    }

    #[test]
    fn test_valid_config_passes() {
        let (_dir, results) = check(
            "entities:\n  User:\n    except: [password_digest]\n    subtypes: [Admin]\n",
        );
        assert!(!results.has_errors());
        assert_eq!(results.warning_count(), 0);
    }

    #[test]
    fn test_unparseable_config() {
        let (_dir, results) = check("entities: [oops");
        assert_eq!(results.error_count(), 1);
        assert_eq!(results.findings[0].category, "parse");
    }

    #[test]
    fn test_only_and_except_conflict() {
        let (_dir, results) = check("entities:\n  User:\n    only: [a]\n    except: [b]\n");
        assert!(results.has_errors());
        assert_eq!(results.findings[0].category, "validate");
    }

    #[test]
    fn test_unreachable_redaction_warns() {
        let (_dir, results) =
            check("entities:\n  User:\n    except: [ssn]\n    redacted: [ssn]\n");
        assert!(!results.has_errors());
        assert_eq!(results.warning_count(), 1);
        assert_eq!(
            results.findings[0].location.as_deref(),
            Some("entities.User.redacted")
        );
    }

    #[test]
    fn test_corrupt_log_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("audit.log"), "not json\n").unwrap();
        let path = dir.path().join("revtrail.yaml");
        fs::write(&path, "audit:\n  storage:\n    backend: file\n").unwrap();

        let results = run(&path).unwrap();
        assert!(results.has_errors());
        assert!(results.findings.iter().any(|f| f.category == "storage"
            && f.severity == Severity::Error));
    }
}
