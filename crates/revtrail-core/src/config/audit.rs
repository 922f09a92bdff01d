//! Audit pipeline configuration.

use serde::{Deserialize, Serialize};

/// Configuration for change auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Whether audit records are written at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Attributes never recorded for any entity.
    #[serde(default = "default_ignored_attributes")]
    pub ignored_attributes: Vec<String>,

    /// Value stored in place of redacted attributes.
    #[serde(default = "default_redaction_marker")]
    pub redaction_marker: String,

    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Storage backend type.
    #[serde(default)]
    pub backend: StorageBackend,

    /// File path (for file backend).
    #[serde(default)]
    pub file_path: Option<String>,
}

/// Storage backend type.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Keep records in process memory.
    #[default]
    Memory,
    /// Append records to a JSON Lines file.
    File,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ignored_attributes: default_ignored_attributes(),
            redaction_marker: default_redaction_marker(),
            storage: StorageConfig::default(),
        }
    }
}

impl AuditConfig {
    /// Resolve the log file path for the file backend.
    pub fn file_path(&self) -> &str {
        self.storage.file_path.as_deref().unwrap_or("audit.log")
    }
}

fn default_enabled() -> bool {
    true
}

fn default_ignored_attributes() -> Vec<String> {
    ["id", "created_at", "updated_at", "lock_version"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_redaction_marker() -> String {
    "[REDACTED]".to_string()
}
