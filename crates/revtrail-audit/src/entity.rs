//! Host entity persistence boundary.
//!
//! [`EntityRepository`] is the small surface the undo engine needs from the
//! host. [`AuditedRepository`] wraps any repository and audits every
//! mutation made through it, committing the audit together with the
//! mutation.

use async_trait::async_trait;
use revtrail_core::{ActionKind, EntityRef};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

use crate::auditor::{Auditor, Mutation};
use crate::codec::{diff_attributes, Attributes, Change, Changes};
use crate::error::AuditError;

/// Trait for host entity storage.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// Current attributes of a live entity.
    async fn find(&self, entity: &EntityRef) -> Result<Option<Attributes>, AuditError>;

    /// Persist a new entity and return its reference.
    async fn insert(
        &self,
        entity_type: &str,
        attributes: Attributes,
    ) -> Result<EntityRef, AuditError>;

    /// Assign `attributes` onto a live entity and persist it in one step.
    async fn update(&self, entity: &EntityRef, attributes: Attributes) -> Result<(), AuditError>;

    /// Remove a live entity.
    async fn delete(&self, entity: &EntityRef) -> Result<(), AuditError>;

    /// Replace the whole row of `entity`, recreating it under the same id if
    /// it is gone.
    async fn restore(&self, entity: &EntityRef, attributes: Attributes) -> Result<(), AuditError>;

    /// Number of live entities of a type.
    async fn count(&self, entity_type: &str) -> Result<usize, AuditError>;
}

#[derive(Default)]
struct MemoryState {
    rows: HashMap<EntityRef, Attributes>,
    next_ids: HashMap<String, i64>,
}

/// In-process entity storage with per-type id sequences starting at 1.
///
/// A subtype draws ids from its base type's sequence, like rows of one
/// shared table.
#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<MemoryState>,
    sequences: HashMap<String, String>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate ids for `subtype` from the sequence of `base`.
    pub fn subtype(mut self, subtype: impl Into<String>, base: impl Into<String>) -> Self {
        self.sequences.insert(subtype.into(), base.into());
        self
    }

    fn sequence<'a>(&'a self, entity_type: &'a str) -> &'a str {
        self.sequences
            .get(entity_type)
            .map(String::as_str)
            .unwrap_or(entity_type)
    }
}

#[async_trait]
impl EntityRepository for MemoryRepository {
    async fn find(&self, entity: &EntityRef) -> Result<Option<Attributes>, AuditError> {
        Ok(self.state.read().await.rows.get(entity).cloned())
    }

    async fn insert(
        &self,
        entity_type: &str,
        attributes: Attributes,
    ) -> Result<EntityRef, AuditError> {
        let mut state = self.state.write().await;
        let next = state
            .next_ids
            .entry(self.sequence(entity_type).to_string())
            .or_insert(0);
        *next += 1;
        let entity = EntityRef::new(entity_type, *next);
        state.rows.insert(entity.clone(), attributes);
        Ok(entity)
    }

    async fn update(&self, entity: &EntityRef, attributes: Attributes) -> Result<(), AuditError> {
        let mut state = self.state.write().await;
        let row = state
            .rows
            .get_mut(entity)
            .ok_or_else(|| AuditError::EntityNotFound(entity.clone()))?;
        row.extend(attributes);
        Ok(())
    }

    async fn delete(&self, entity: &EntityRef) -> Result<(), AuditError> {
        let mut state = self.state.write().await;
        state
            .rows
            .remove(entity)
            .map(|_| ())
            .ok_or_else(|| AuditError::EntityNotFound(entity.clone()))
    }

    async fn restore(&self, entity: &EntityRef, attributes: Attributes) -> Result<(), AuditError> {
        let mut state = self.state.write().await;
        let next = state
            .next_ids
            .entry(self.sequence(&entity.entity_type).to_string())
            .or_insert(0);
        *next = (*next).max(entity.id);
        state.rows.insert(entity.clone(), attributes);
        Ok(())
    }

    async fn count(&self, entity_type: &str) -> Result<usize, AuditError> {
        let state = self.state.read().await;
        Ok(state
            .rows
            .keys()
            .filter(|entity| entity.entity_type == entity_type)
            .count())
    }
}

fn every_attribute(attributes: &Attributes, change: fn(Value) -> Change) -> Changes {
    attributes
        .iter()
        .map(|(name, value)| (name.clone(), change(value.clone())))
        .collect()
}

/// Repository decorator that audits every mutation made through it.
///
/// Mutations of one entity run one at a time, from reading the current row
/// to storing the audit. If the audit cannot be stored, the host mutation
/// is reverted before the error is returned.
pub struct AuditedRepository<R> {
    inner: R,
    auditor: Arc<Auditor>,
    locks: Mutex<HashMap<EntityRef, Arc<AsyncMutex<()>>>>,
}

impl<R: EntityRepository> AuditedRepository<R> {
    pub fn new(inner: R, auditor: Arc<Auditor>) -> Self {
        Self {
            inner,
            auditor,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn auditor(&self) -> &Arc<Auditor> {
        &self.auditor
    }

    async fn lock(&self, entity: &EntityRef) -> Result<OwnedMutexGuard<()>, AuditError> {
        let lock = {
            let mut locks = self.locks.lock().map_err(|e| {
                AuditError::StorageError(format!("Failed to acquire entity lock: {}", e))
            })?;
            Arc::clone(locks.entry(entity.clone()).or_default())
        };
        Ok(lock.lock_owned().await)
    }

    async fn load(&self, entity: &EntityRef) -> Result<Attributes, AuditError> {
        self.inner
            .find(entity)
            .await?
            .ok_or_else(|| AuditError::EntityNotFound(entity.clone()))
    }

    /// Insert with an audit comment.
    pub async fn insert_with_comment(
        &self,
        entity_type: &str,
        attributes: Attributes,
        comment: Option<String>,
    ) -> Result<EntityRef, AuditError> {
        // The id is unknown until the host assigns it; the draft is prepared
        // first so a rejected audit never leaves an unaudited row behind.
        let changes = every_attribute(&attributes, |value| Change::created(value));
        let placeholder = EntityRef::new(entity_type, 0);
        let mut mutation = Mutation::new(placeholder, ActionKind::Create, changes);
        mutation.comment = comment;

        let inner = &self.inner;
        let mut tx = self.auditor.transaction();
        tx.stage(mutation)?;
        tx.commit_reverting(
            inner.insert(entity_type, attributes),
            |entity, drafts| {
                for draft in drafts {
                    draft.entity.id = entity.id;
                }
            },
            |entity| async move { inner.delete(&entity).await },
        )
        .await
    }

    /// Update with an audit comment.
    pub async fn update_with_comment(
        &self,
        entity: &EntityRef,
        attributes: Attributes,
        comment: Option<String>,
    ) -> Result<(), AuditError> {
        let _guard = self.lock(entity).await?;
        let before = self.load(entity).await?;
        let mut after = before.clone();
        after.extend(attributes.clone());

        let changes = diff_attributes(&before, &after);
        let mut mutation = Mutation::new(entity.clone(), ActionKind::Update, changes);
        mutation.comment = comment;

        let inner = &self.inner;
        let mut tx = self.auditor.transaction();
        tx.stage(mutation)?;
        tx.commit_reverting(
            inner.update(entity, attributes),
            |_, _| {},
            |()| inner.restore(entity, before),
        )
        .await
    }

    /// Delete with an audit comment.
    pub async fn delete_with_comment(
        &self,
        entity: &EntityRef,
        comment: Option<String>,
    ) -> Result<(), AuditError> {
        let _guard = self.lock(entity).await?;
        let before = self.load(entity).await?;

        let changes = every_attribute(&before, |value| Change::destroyed(value));
        let mut mutation = Mutation::new(entity.clone(), ActionKind::Destroy, changes);
        mutation.comment = comment;

        let inner = &self.inner;
        let mut tx = self.auditor.transaction();
        tx.stage(mutation)?;
        tx.commit_reverting(
            inner.delete(entity),
            |_, _| {},
            |()| inner.restore(entity, before),
        )
        .await
    }
}

#[async_trait]
impl<R: EntityRepository> EntityRepository for AuditedRepository<R> {
    async fn find(&self, entity: &EntityRef) -> Result<Option<Attributes>, AuditError> {
        self.inner.find(entity).await
    }

    async fn insert(
        &self,
        entity_type: &str,
        attributes: Attributes,
    ) -> Result<EntityRef, AuditError> {
        self.insert_with_comment(entity_type, attributes, None).await
    }

    async fn update(&self, entity: &EntityRef, attributes: Attributes) -> Result<(), AuditError> {
        self.update_with_comment(entity, attributes, None).await
    }

    async fn delete(&self, entity: &EntityRef) -> Result<(), AuditError> {
        self.delete_with_comment(entity, None).await
    }

    /// Restores are repairs of the host store and are not audited.
    async fn restore(&self, entity: &EntityRef, attributes: Attributes) -> Result<(), AuditError> {
        let _guard = self.lock(entity).await?;
        self.inner.restore(entity, attributes).await
    }

    async fn count(&self, entity_type: &str) -> Result<usize, AuditError> {
        self.inner.count(entity_type).await
    }
}
