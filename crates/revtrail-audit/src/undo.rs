//! Undo engine.
//!
//! Reverses the effect of a single audit record against the live entity
//! store. Only old values are used; legacy entries that never stored an old
//! value leave their attribute untouched.

use revtrail_core::{ActionKind, EntityRef};

use crate::codec::Attributes;
use crate::entity::EntityRepository;
use crate::error::AuditError;
use crate::record::AuditRecord;

/// What an undo did to the live entity store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOutcome {
    /// A created entity was removed.
    Deleted(EntityRef),
    /// A destroyed entity was inserted again, under a new id.
    Recreated(EntityRef),
    /// An updated entity got its old values back.
    Reverted(EntityRef),
}

impl UndoOutcome {
    pub fn entity(&self) -> &EntityRef {
        match self {
            Self::Deleted(entity) | Self::Recreated(entity) | Self::Reverted(entity) => entity,
        }
    }
}

fn old_values(record: &AuditRecord) -> Result<Attributes, AuditError> {
    let decoded = record.decoded_changes();
    if decoded.is_fallback() {
        return Err(AuditError::UndecodableChanges(record.id));
    }

    Ok(decoded
        .changes
        .into_iter()
        .filter_map(|(attribute, change)| {
            change.old_value().cloned().map(|old| (attribute, old))
        })
        .collect())
}

/// Reverse `record` against `repository`.
///
/// Each action touches the repository exactly once, so the live entity is
/// never left partially reverted.
pub async fn undo<R>(record: &AuditRecord, repository: &R) -> Result<UndoOutcome, AuditError>
where
    R: EntityRepository + ?Sized,
{
    let action: ActionKind = record
        .action
        .parse()
        .map_err(|_| AuditError::UnknownActionKind(record.action.clone()))?;

    let outcome = match action {
        ActionKind::Create => {
            repository.delete(&record.entity).await?;
            UndoOutcome::Deleted(record.entity.clone())
        }
        ActionKind::Destroy => {
            let attributes = old_values(record)?;
            let entity = repository
                .insert(&record.entity.entity_type, attributes)
                .await?;
            UndoOutcome::Recreated(entity)
        }
        ActionKind::Update => {
            let attributes = old_values(record)?;
            repository.update(&record.entity, attributes).await?;
            UndoOutcome::Reverted(record.entity.clone())
        }
    };

    tracing::debug!(
        record_id = %record.id,
        version = record.version,
        action = %record.action,
        outcome = ?outcome,
        "Audit record undone"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Change, Changes};
    use crate::entity::MemoryRepository;
    use crate::record::AuditDraft;
    use serde_json::{json, Value};

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    fn record(entity: &EntityRef, action: ActionKind, changes: &[(&str, Change)]) -> AuditRecord {
        let changes: Changes = changes
            .iter()
            .map(|(name, change)| (name.to_string(), change.clone()))
            .collect();
        AuditDraft::builder(entity.clone(), action)
            .changes(&changes)
            .unwrap()
            .build()
            .into_record(1)
    }

    #[tokio::test]
    async fn test_undo_update_restores_old_values() {
        let repo = MemoryRepository::new();
        let user = repo
            .insert("User", attrs(json!({"name": "Joe", "age": 31})))
            .await
            .unwrap();

        let update = record(&user, ActionKind::Update, &[("name", Change::pair("John", "Joe"))]);
        let outcome = undo(&update, &repo).await.unwrap();

        assert_eq!(outcome, UndoOutcome::Reverted(user.clone()));
        assert_eq!(
            repo.find(&user).await.unwrap(),
            Some(attrs(json!({"name": "John", "age": 31})))
        );
    }

    #[tokio::test]
    async fn test_undo_create_deletes() {
        let repo = MemoryRepository::new();
        let user = repo.insert("User", attrs(json!({"name": "John"}))).await.unwrap();

        let create = record(&user, ActionKind::Create, &[("name", Change::created("John"))]);
        assert_eq!(undo(&create, &repo).await.unwrap(), UndoOutcome::Deleted(user.clone()));
        assert_eq!(repo.count("User").await.unwrap(), 0);

        assert!(matches!(
            undo(&create, &repo).await,
            Err(AuditError::EntityNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_undo_destroy_recreates() {
        let repo = MemoryRepository::new();
        let gone = EntityRef::new("User", 1);

        let destroy = record(
            &gone,
            ActionKind::Destroy,
            &[("name", Change::destroyed("Joe")), ("age", Change::destroyed(31))],
        );
        let outcome = undo(&destroy, &repo).await.unwrap();

        let UndoOutcome::Recreated(entity) = outcome else {
            panic!("expected a recreated entity, got {outcome:?}");
        };
        assert_eq!(
            repo.find(&entity).await.unwrap(),
            Some(attrs(json!({"name": "Joe", "age": 31})))
        );
    }

    #[tokio::test]
    async fn test_legacy_entries_without_old_value_are_left_alone() {
        let repo = MemoryRepository::new();
        let user = repo
            .insert("User", attrs(json!({"name": "Joe", "age": 31})))
            .await
            .unwrap();

        let mut legacy = record(&user, ActionKind::Update, &[]);
        legacy.changes = r#"{"name": ["John", "Joe"], "age": 31}"#.to_string();
        undo(&legacy, &repo).await.unwrap();

        assert_eq!(
            repo.find(&user).await.unwrap(),
            Some(attrs(json!({"name": "John", "age": 31})))
        );
    }

    #[tokio::test]
    async fn test_unknown_action_names_the_value() {
        let repo = MemoryRepository::new();
        let mut archived = record(&EntityRef::new("User", 1), ActionKind::Update, &[]);
        archived.action = "archive".to_string();

        let err = undo(&archived, &repo).await.unwrap_err();
        assert!(matches!(err, AuditError::UnknownActionKind(ref value) if value == "archive"));
        assert!(err.to_string().contains("archive"));
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_surfaced() {
        let repo = MemoryRepository::new();
        let user = repo.insert("User", attrs(json!({"name": "Joe"}))).await.unwrap();

        let mut broken = record(&user, ActionKind::Update, &[]);
        broken.changes = "not a diff".to_string();

        let err = undo(&broken, &repo).await.unwrap_err();
        assert!(matches!(err, AuditError::UndecodableChanges(id) if id == broken.id));
    }
}
