//! Per-entity audit options.

use serde::{Deserialize, Serialize};

use crate::ActionKind;

/// Audit options for one entity type.
///
/// `only` and `except` are mutually exclusive; when both are empty every
/// attribute not globally ignored is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Allow list of audited attributes.
    #[serde(default)]
    pub only: Vec<String>,

    /// Deny list of attributes.
    #[serde(default)]
    pub except: Vec<String>,

    /// Actions that produce records.
    #[serde(default = "default_actions")]
    pub on: Vec<ActionKind>,

    /// Attributes recorded with their values replaced by the redaction marker.
    #[serde(default)]
    pub redacted: Vec<String>,

    /// Reject mutations that carry no audit comment.
    #[serde(default)]
    pub comment_required: bool,

    /// Subtypes audited under this entity's type.
    #[serde(default)]
    pub subtypes: Vec<String>,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            only: Vec::new(),
            except: Vec::new(),
            on: default_actions(),
            redacted: Vec::new(),
            comment_required: false,
            subtypes: Vec::new(),
        }
    }
}

fn default_actions() -> Vec<ActionKind> {
    ActionKind::ALL.to_vec()
}
