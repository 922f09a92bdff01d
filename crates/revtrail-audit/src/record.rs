//! Audit record types.
//!
//! An [`AuditRecord`] is the unit of history: one mutation of one entity,
//! with its encoded diff, its version in the entity's history and the
//! attribution captured when it was made.

use chrono::{DateTime, Utc};
use revtrail_core::{ActionKind, EntityRef, Party};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attribution::AttributionSnapshot;
use crate::codec::{self, Changes, Decoded};
use crate::error::AuditError;

/// A persisted audit record.
///
/// Records are immutable once stored; only `created_at` may be corrected
/// administratively through the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record ID.
    pub id: Uuid,

    /// The audited entity.
    pub entity: EntityRef,

    /// Parent entity the change belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated: Option<EntityRef>,

    /// Stored action. Kept as text so corrupted rows stay readable;
    /// use [`AuditRecord::action_kind`] to interpret it.
    pub action: String,

    /// Encoded diff payload.
    pub changes: String,

    /// Position in the entity's history, starting at 1.
    pub version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Party>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<Party>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Free-text audit comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// When the mutation was recorded.
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Interpret the stored action.
    pub fn action_kind(&self) -> Result<ActionKind, AuditError> {
        Ok(self.action.parse::<ActionKind>()?)
    }

    /// Decode the stored diff.
    pub fn decoded_changes(&self) -> Decoded {
        codec::decode(&self.changes)
    }

    /// Format the record as a human-readable log line.
    ///
    /// Format: `[timestamp] v3 update Type#id actor=... tenant=... changed=[...]`
    pub fn to_log_line(&self) -> String {
        let mut line = format!(
            "[{}] v{} {} {}",
            self.created_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.version,
            self.action,
            self.entity,
        );

        if let Some(ref actor) = self.actor {
            line.push_str(&format!(" actor={}", actor));
        }

        if let Some(ref tenant) = self.tenant {
            line.push_str(&format!(" tenant={}", tenant));
        }

        if let Some(ref request_id) = self.request_id {
            line.push_str(&format!(" request_id={}", request_id));
        }

        if let Some(ref comment) = self.comment {
            line.push_str(&format!(" comment=\"{}\"", comment.replace('"', "'")));
        }

        let decoded = self.decoded_changes();
        if !decoded.is_fallback() && !decoded.changes.is_empty() {
            let fields: Vec<&str> = decoded.changes.keys().map(String::as_str).collect();
            line.push_str(&format!(" changed=[{}]", fields.join(",")));
        }

        line
    }
}

/// A record that has not been assigned a version yet.
///
/// Drafts become [`AuditRecord`]s inside the store, which assigns the
/// version under per-entity serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub entity: EntityRef,
    pub associated: Option<EntityRef>,
    pub action: String,
    pub changes: String,
    pub actor: Option<Party>,
    pub tenant: Option<Party>,
    pub remote_address: Option<String>,
    pub request_id: Option<String>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditDraft {
    /// Create a builder for a draft.
    pub fn builder(entity: EntityRef, action: ActionKind) -> AuditDraftBuilder {
        AuditDraftBuilder::new(entity, action)
    }

    /// Turn the draft into a record with the given version.
    pub fn into_record(self, version: u64) -> AuditRecord {
        AuditRecord {
            id: Uuid::new_v4(),
            entity: self.entity,
            associated: self.associated,
            action: self.action,
            changes: self.changes,
            version,
            actor: self.actor,
            tenant: self.tenant,
            remote_address: self.remote_address,
            request_id: self.request_id,
            comment: self.comment,
            created_at: self.created_at,
        }
    }

    /// Whether this draft records a create.
    pub fn is_create(&self) -> bool {
        self.action == ActionKind::Create.as_str()
    }
}

/// Builder for audit drafts.
#[derive(Debug)]
pub struct AuditDraftBuilder {
    draft: AuditDraft,
}

impl AuditDraftBuilder {
    /// Create a new builder with required fields and an empty diff.
    pub fn new(entity: EntityRef, action: ActionKind) -> Self {
        Self {
            draft: AuditDraft {
                entity,
                associated: None,
                action: action.as_str().to_string(),
                changes: String::new(),
                actor: None,
                tenant: None,
                remote_address: None,
                request_id: None,
                comment: None,
                created_at: Utc::now(),
            },
        }
    }

    /// Encode and set the diff.
    pub fn changes(mut self, changes: &Changes) -> Result<Self, AuditError> {
        self.draft.changes = codec::encode(changes)?;
        Ok(self)
    }

    /// Set the actor.
    pub fn actor(mut self, actor: Party) -> Self {
        self.draft.actor = Some(actor);
        self
    }

    /// Set the tenant.
    pub fn tenant(mut self, tenant: Party) -> Self {
        self.draft.tenant = Some(tenant);
        self
    }

    /// Set the remote address.
    pub fn remote_address(mut self, address: impl Into<String>) -> Self {
        self.draft.remote_address = Some(address.into());
        self
    }

    /// Set the request ID.
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.draft.request_id = Some(id.into());
        self
    }

    /// Copy every attribution field from a resolved snapshot.
    pub fn attribution(mut self, snapshot: AttributionSnapshot) -> Self {
        self.draft.actor = snapshot.actor;
        self.draft.tenant = snapshot.tenant;
        self.draft.remote_address = snapshot.remote_address;
        self.draft.request_id = snapshot.request_id;
        self
    }

    /// Set the audit comment.
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.draft.comment = Some(comment.into());
        self
    }

    /// Set the associated (parent) entity.
    pub fn associated(mut self, entity: EntityRef) -> Self {
        self.draft.associated = Some(entity);
        self
    }

    /// Override the recording time.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.draft.created_at = at;
        self
    }

    /// Build the draft.
    pub fn build(self) -> AuditDraft {
        self.draft
    }
}
