use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Configuration types shared across all revtrail crates
pub mod config;

pub use config::{
    AuditConfig, ConfigError, EntityConfig, RevtrailConfig, StorageBackend, StorageConfig,
};

/// Kind of mutation an audit record describes.
///
/// This is a closed set: any other stored value is a data-integrity problem
/// and fails to parse with [`InvalidActionKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Destroy,
}

impl ActionKind {
    pub const ALL: [ActionKind; 3] = [ActionKind::Create, ActionKind::Update, ActionKind::Destroy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for ActionKind {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// An action string outside `create | update | destroy`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid action kind: {0:?}")]
pub struct InvalidActionKind(pub String);

impl FromStr for ActionKind {
    type Err = InvalidActionKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "destroy" => Ok(Self::Destroy),
            other => Err(InvalidActionKind(other.to_string())),
        }
    }
}

/// Identity of an entity: its type name plus primary key.
///
/// One audit table covers many entity types, so every record carries the
/// pair rather than just an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub id: i64,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, id: i64) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.id)
    }
}

/// Who (or what) a change is attributed to.
///
/// Either a reference to an identity entity or a free-text label such as a
/// background job name. The two forms are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Party {
    Reference(EntityRef),
    Label(String),
}

impl Party {
    pub fn reference(entity_type: impl Into<String>, id: i64) -> Self {
        Self::Reference(EntityRef::new(entity_type, id))
    }

    pub fn label(text: impl Into<String>) -> Self {
        Self::Label(text.into())
    }

    pub fn as_reference(&self) -> Option<&EntityRef> {
        match self {
            Self::Reference(entity) => Some(entity),
            Self::Label(_) => None,
        }
    }

    pub fn as_label(&self) -> Option<&str> {
        match self {
            Self::Reference(_) => None,
            Self::Label(text) => Some(text),
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference(entity) => entity.fmt(f),
            Self::Label(text) => f.write_str(text),
        }
    }
}

impl From<EntityRef> for Party {
    fn from(entity: EntityRef) -> Self {
        Self::Reference(entity)
    }
}

impl From<&str> for Party {
    fn from(text: &str) -> Self {
        Self::Label(text.to_string())
    }
}

impl From<String> for Party {
    fn from(text: String) -> Self {
        Self::Label(text)
    }
}
