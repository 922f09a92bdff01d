//! Configuration types for revtrail.
//!
//! A single YAML file (conventionally `revtrail.yaml`) configures both the
//! audit pipeline (storage backend, ignored attributes, redaction) and the
//! set of audited entity types with their per-entity options.
//!
//! # Example
//!
//! ```yaml
//! audit:
//!   storage:
//!     backend: file
//!     file_path: audit.log
//! entities:
//!   User:
//!     except: [password_digest]
//!     subtypes: [Admin]
//! ```

pub mod audit;
pub mod entity;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

pub use audit::{AuditConfig, StorageBackend, StorageConfig};
pub use entity::EntityConfig;

/// Complete revtrail configuration loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevtrailConfig {
    /// Audit pipeline configuration.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Audited entity types keyed by type name.
    #[serde(default)]
    pub entities: BTreeMap<String, EntityConfig>,
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RevtrailConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Check cross-entity consistency.
    ///
    /// Rejects entities that declare both `only` and `except`, subtypes
    /// claimed by more than one entity, and subtypes that are registered
    /// entities themselves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut owners: HashMap<&str, &str> = HashMap::new();

        for (name, entity) in &self.entities {
            if !entity.only.is_empty() && !entity.except.is_empty() {
                return Err(ConfigError::Config(format!(
                    "entity '{}' declares both 'only' and 'except'",
                    name
                )));
            }

            for subtype in &entity.subtypes {
                if self.entities.contains_key(subtype) {
                    return Err(ConfigError::Config(format!(
                        "subtype '{}' of '{}' is also registered as an entity",
                        subtype, name
                    )));
                }
                if let Some(previous) = owners.insert(subtype, name) {
                    return Err(ConfigError::Config(format!(
                        "subtype '{}' is declared under both '{}' and '{}'",
                        subtype, previous, name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Get an entity's configuration by type name.
    pub fn get_entity(&self, name: &str) -> Option<&EntityConfig> {
        self.entities.get(name)
    }
}
