//! Error types for the audit crate.

use chrono::{DateTime, Utc};
use revtrail_core::{ConfigError, EntityRef, InvalidActionKind};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// A stored or requested action is outside `create | update | destroy`.
    #[error("invalid action kind: {0:?}")]
    InvalidActionKind(String),

    /// Undo was asked to reverse a record with an unrecognized action.
    #[error("cannot undo unknown action kind: {0:?}")]
    UnknownActionKind(String),

    /// The requested version does not exist in the entity's history.
    #[error("no revision {version} for {entity}")]
    RevisionNotFound { entity: EntityRef, version: u64 },

    /// No record of the entity was created at or before the given time.
    #[error("no revision of {entity} at or before {at}")]
    NoRevisionAt { entity: EntityRef, at: DateTime<Utc> },

    /// Reconstruction was asked for an entity with no records.
    #[error("no audit records to reconstruct from")]
    EmptyHistory,

    /// A record's diff payload could not be decoded.
    #[error("audit record {0} has an undecodable diff")]
    UndecodableChanges(Uuid),

    /// A record chain handed to the reconstructor spans several entities.
    #[error("record for {found} in history of {expected}")]
    MixedEntities { expected: EntityRef, found: EntityRef },

    /// Two records of one entity share a version.
    #[error("duplicate version {version} for {entity}")]
    DuplicateVersion { entity: EntityRef, version: u64 },

    /// A record's version is not the next one for its entity.
    #[error("version conflict for {entity}: expected {expected}, found {found}")]
    VersionConflict {
        entity: EntityRef,
        expected: u64,
        found: u64,
    },

    /// The entity type requires an audit comment and none was given.
    #[error("audit comment required for {0}")]
    CommentRequired(String),

    /// The live entity does not exist.
    #[error("entity not found: {0}")]
    EntityNotFound(EntityRef),

    /// Attribution scopes were exited out of order.
    #[error("attribution store corrupted: {0}")]
    AttributionRestoreFailure(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<InvalidActionKind> for AuditError {
    fn from(err: InvalidActionKind) -> Self {
        Self::InvalidActionKind(err.0)
    }
}
