//! Revision reconstruction.
//!
//! Rebuilds an entity's attributes at any version by replaying its records
//! forward from an empty map, applying only the new side of each change.
//! Old values are never read here, so legacy records that stored only new
//! values replay like any other.

use chrono::{DateTime, Utc};
use revtrail_core::{ActionKind, EntityRef};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::codec::Attributes;
use crate::error::AuditError;
use crate::record::AuditRecord;

/// An entity's reconstructed state at one version.
///
/// Always a transient value: nothing here is written back to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Revision {
    pub entity: EntityRef,
    pub version: u64,
    /// Action of the record at this version.
    pub action: ActionKind,
    pub attributes: Attributes,
    /// `false` when the entity has been destroyed.
    pub persisted: bool,
    /// Some record up to this version had an unreadable diff and was skipped.
    pub degraded: bool,
    pub recorded_at: DateTime<Utc>,
}

impl Revision {
    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }
}

type Chain<'a> = Vec<(&'a AuditRecord, ActionKind)>;

/// Validate a record chain and order it by version.
fn ordered(records: &[AuditRecord]) -> Result<Chain<'_>, AuditError> {
    let first = records.first().ok_or(AuditError::EmptyHistory)?;

    let mut chain = Vec::with_capacity(records.len());
    for record in records {
        if record.entity != first.entity {
            return Err(AuditError::MixedEntities {
                expected: first.entity.clone(),
                found: record.entity.clone(),
            });
        }
        chain.push((record, record.action_kind()?));
    }

    chain.sort_by_key(|(record, _)| record.version);
    for pair in chain.windows(2) {
        if pair[0].0.version == pair[1].0.version {
            return Err(AuditError::DuplicateVersion {
                entity: first.entity.clone(),
                version: pair[0].0.version,
            });
        }
    }
    Ok(chain)
}

fn is_destroyed(chain: &Chain<'_>) -> bool {
    chain
        .last()
        .is_some_and(|(_, action)| *action == ActionKind::Destroy)
}

#[derive(Default)]
struct Replay {
    attributes: Attributes,
    degraded: bool,
}

impl Replay {
    fn apply(&mut self, record: &AuditRecord, action: ActionKind) {
        // A destroy stores only old values; the state stays as it was.
        if action == ActionKind::Destroy {
            return;
        }

        let decoded = record.decoded_changes();
        if decoded.is_fallback() {
            tracing::warn!(
                record_id = %record.id,
                entity = %record.entity,
                version = record.version,
                "Skipping undecodable audit record during reconstruction"
            );
            self.degraded = true;
            return;
        }

        for (attribute, change) in decoded.changes {
            self.attributes.insert(attribute, change.new_value().clone());
        }
    }

    fn snapshot(&self, record: &AuditRecord, action: ActionKind, destroyed: bool) -> Revision {
        Revision {
            entity: record.entity.clone(),
            version: record.version,
            action,
            attributes: self.attributes.clone(),
            persisted: !destroyed,
            degraded: self.degraded,
            recorded_at: record.created_at,
        }
    }
}

/// Reconstruct the state as of `target_version`.
///
/// `records` must all belong to one entity; their order does not matter.
pub fn reconstruct(records: &[AuditRecord], target_version: u64) -> Result<Revision, AuditError> {
    let chain = ordered(records)?;
    let destroyed = is_destroyed(&chain);

    let mut replay = Replay::default();
    for (record, action) in &chain {
        if record.version > target_version {
            break;
        }
        replay.apply(record, *action);
        if record.version == target_version {
            return Ok(replay.snapshot(record, *action, destroyed));
        }
    }

    Err(AuditError::RevisionNotFound {
        entity: chain[0].0.entity.clone(),
        version: target_version,
    })
}

/// Reconstruct every version in one pass, keyed by version.
pub fn reconstruct_all(records: &[AuditRecord]) -> Result<BTreeMap<u64, Revision>, AuditError> {
    let chain = ordered(records)?;
    let destroyed = is_destroyed(&chain);

    let mut replay = Replay::default();
    let mut revisions = BTreeMap::new();
    for (record, action) in &chain {
        replay.apply(record, *action);
        revisions.insert(record.version, replay.snapshot(record, *action, destroyed));
    }
    Ok(revisions)
}

/// Reconstruct the state as of the last record created at or before `at`.
pub fn reconstruct_at(records: &[AuditRecord], at: DateTime<Utc>) -> Result<Revision, AuditError> {
    let chain = ordered(records)?;
    let target = chain
        .iter()
        .filter(|(record, _)| record.created_at <= at)
        .map(|(record, _)| record.version)
        .max()
        .ok_or_else(|| AuditError::NoRevisionAt {
            entity: chain[0].0.entity.clone(),
            at,
        })?;

    reconstruct(records, target)
}
