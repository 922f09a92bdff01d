//! The auditor: turns host mutations into versioned audit records.
//!
//! The host persistence layer reports each create, update and destroy as a
//! [`Mutation`]. The auditor filters it through the registry, captures the
//! current attribution and hands the draft to the store, which assigns the
//! version.

use chrono::{DateTime, Utc};
use revtrail_core::{ActionKind, AuditConfig, EntityRef, RevtrailConfig};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use crate::attribution::current_attribution;
use crate::codec::Changes;
use crate::error::AuditError;
use crate::record::{AuditDraft, AuditRecord};
use crate::registry::AuditedRegistry;
use crate::revision::{self, Revision};
use crate::storage::{create_store, AuditFilter, AuditStore, MemoryStore};

/// One host mutation as reported by the persistence layer.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub entity: EntityRef,
    /// Raw action text; parsed when the mutation is prepared.
    pub action: String,
    pub changes: Changes,
    pub comment: Option<String>,
    pub associated: Option<EntityRef>,
}

impl Mutation {
    pub fn new(entity: EntityRef, action: impl AsRef<str>, changes: Changes) -> Self {
        Self {
            entity,
            action: action.as_ref().to_string(),
            changes,
            comment: None,
            associated: None,
        }
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn associated(mut self, entity: EntityRef) -> Self {
        self.associated = Some(entity);
        self
    }
}

/// Records audits for registered entity types.
pub struct Auditor {
    config: AuditConfig,
    registry: Arc<AuditedRegistry>,
    store: Arc<dyn AuditStore>,
}

impl Auditor {
    /// Create an auditor over an explicit registry and store.
    pub fn new(
        config: AuditConfig,
        registry: AuditedRegistry,
        store: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            store,
        }
    }

    /// Build the registry and storage backend from configuration.
    pub fn from_config(config: &RevtrailConfig) -> Result<Self, AuditError> {
        let registry = AuditedRegistry::from_config(config)?;
        let store = create_store(&config.audit)?;

        tracing::info!(
            entities = config.entities.len(),
            backend = ?config.audit.storage.backend,
            enabled = config.audit.enabled,
            "Auditor initialized"
        );

        Ok(Self::new(config.audit.clone(), registry, store))
    }

    /// Create a disabled (no-op) auditor.
    pub fn disabled() -> Self {
        Self {
            config: AuditConfig {
                enabled: false,
                ..Default::default()
            },
            registry: Arc::new(AuditedRegistry::new()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn registry(&self) -> &AuditedRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    /// Build the draft for a mutation, or `None` when nothing is recorded.
    ///
    /// Nothing is recorded when auditing is disabled, the entity type is not
    /// audited, the action is excluded for the type, or an update changed
    /// no recorded attribute.
    pub fn prepare(&self, mutation: Mutation) -> Result<Option<AuditDraft>, AuditError> {
        if !self.config.enabled {
            return Ok(None);
        }

        let action: ActionKind = mutation.action.parse()?;
        let entity_type = &mutation.entity.entity_type;
        let (Some(base), Some(options)) = (
            self.registry.resolve(entity_type),
            self.registry.options(entity_type),
        ) else {
            tracing::trace!(entity_type = %entity_type, "Entity type is not audited");
            return Ok(None);
        };
        if !options.audits_action(action) {
            return Ok(None);
        }

        let changes = self.registry.filter_changes(base, mutation.changes);
        if changes.is_empty() && action == ActionKind::Update {
            tracing::debug!(entity = %mutation.entity, "Skipping audit of no-op update");
            return Ok(None);
        }

        let has_comment = mutation
            .comment
            .as_deref()
            .is_some_and(|comment| !comment.trim().is_empty());
        if options.requires_comment() && !has_comment {
            return Err(AuditError::CommentRequired(base.to_string()));
        }

        let entity = EntityRef::new(base, mutation.entity.id);
        let mut builder = AuditDraft::builder(entity, action)
            .changes(&changes)?
            .attribution(current_attribution());
        if let Some(comment) = mutation.comment {
            builder = builder.comment(comment);
        }
        if let Some(associated) = mutation.associated {
            builder = builder.associated(associated);
        }
        Ok(Some(builder.build()))
    }

    /// Record one mutation immediately.
    pub async fn record(&self, mutation: Mutation) -> Result<Option<AuditRecord>, AuditError> {
        let Some(draft) = self.prepare(mutation)? else {
            return Ok(None);
        };

        let mut records = self.store.append(vec![draft]).await?;
        let record = records.pop();
        if let Some(ref record) = record {
            tracing::debug!(
                record_id = %record.id,
                entity = %record.entity,
                action = %record.action,
                version = record.version,
                "Audit record created"
            );
        }
        Ok(record)
    }

    /// Record a mutation without a comment or associated entity.
    pub async fn begin_audit(
        &self,
        entity: EntityRef,
        action: impl AsRef<str>,
        changes: Changes,
    ) -> Result<Option<AuditRecord>, AuditError> {
        self.record(Mutation::new(entity, action, changes)).await
    }

    /// Start a transaction whose audits commit together with a host mutation.
    pub fn transaction(&self) -> AuditTransaction<'_> {
        AuditTransaction {
            auditor: self,
            drafts: Vec::new(),
        }
    }

    fn audited_ref(&self, entity: &EntityRef) -> EntityRef {
        match self.registry.resolve(&entity.entity_type) {
            Some(base) => EntityRef::new(base, entity.id),
            None => entity.clone(),
        }
    }

    /// All records of an entity, ordered by version.
    pub async fn history(&self, entity: &EntityRef) -> Result<Vec<AuditRecord>, AuditError> {
        self.store.records_for(&self.audited_ref(entity)).await
    }

    /// Every reconstructed revision of an entity, keyed by version.
    pub async fn revisions(
        &self,
        entity: &EntityRef,
    ) -> Result<BTreeMap<u64, Revision>, AuditError> {
        revision::reconstruct_all(&self.history(entity).await?)
    }

    /// The entity as of `version`.
    pub async fn revision(&self, entity: &EntityRef, version: u64) -> Result<Revision, AuditError> {
        revision::reconstruct(&self.history(entity).await?, version)
    }

    /// The entity as of the latest record created at or before `at`.
    pub async fn revision_at(
        &self,
        entity: &EntityRef,
        at: DateTime<Utc>,
    ) -> Result<Revision, AuditError> {
        revision::reconstruct_at(&self.history(entity).await?, at)
    }

    /// Query audit records with filters.
    pub async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        self.store.query(filter).await
    }
}

/// Audits staged for one host mutation.
///
/// Staged drafts are stored only when the host's own commit succeeds.
/// Dropping the transaction without committing discards them.
pub struct AuditTransaction<'a> {
    auditor: &'a Auditor,
    drafts: Vec<AuditDraft>,
}

impl AuditTransaction<'_> {
    /// Prepare and stage a mutation. Returns whether anything was staged.
    pub fn stage(&mut self, mutation: Mutation) -> Result<bool, AuditError> {
        match self.auditor.prepare(mutation)? {
            Some(draft) => {
                self.drafts.push(draft);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stage an already prepared draft.
    pub fn push(&mut self, draft: AuditDraft) {
        self.drafts.push(draft);
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    /// Store every staged draft as one batch.
    pub async fn commit(mut self) -> Result<Vec<AuditRecord>, AuditError> {
        let drafts = std::mem::take(&mut self.drafts);
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        self.auditor.store.append(drafts).await
    }

    /// Run the host's commit, then store the staged drafts.
    ///
    /// A failed host commit discards every draft and its error is returned
    /// unchanged.
    pub async fn commit_with<T, F>(self, host: F) -> Result<T, AuditError>
    where
        F: Future<Output = Result<T, AuditError>>,
    {
        self.commit_mapped(host, |_, _| {}).await
    }

    /// Like [`commit_with`](Self::commit_with), with the host's result
    /// available to patch the drafts before they are stored.
    ///
    /// Creates use this to fill in the id the host assigned.
    pub async fn commit_mapped<T, F, M>(mut self, host: F, patch: M) -> Result<T, AuditError>
    where
        F: Future<Output = Result<T, AuditError>>,
        M: FnOnce(&T, &mut [AuditDraft]),
    {
        let value = self.run_host(host, patch).await?;
        if let Err(err) = self.commit().await {
            tracing::error!(error = %err, "Host mutation committed but its audit was not stored");
            return Err(err);
        }
        Ok(value)
    }

    /// Like [`commit_mapped`](Self::commit_mapped), but a failure to store
    /// the audit after the host committed runs `revert` on the host's result
    /// before the audit error is returned.
    pub async fn commit_reverting<T, F, M, R, RF>(
        mut self,
        host: F,
        patch: M,
        revert: R,
    ) -> Result<T, AuditError>
    where
        F: Future<Output = Result<T, AuditError>>,
        M: FnOnce(&T, &mut [AuditDraft]),
        R: FnOnce(T) -> RF,
        RF: Future<Output = Result<(), AuditError>>,
    {
        let value = self.run_host(host, patch).await?;
        let Err(err) = self.commit().await else {
            return Ok(value);
        };

        match revert(value).await {
            Ok(()) => {
                tracing::warn!(error = %err, "Audit was not stored; host mutation reverted");
            }
            Err(revert_err) => tracing::error!(
                error = %err,
                revert_error = %revert_err,
                "Host mutation committed but its audit was not stored"
            ),
        }
        Err(err)
    }

    /// Check the staged drafts, run the host's commit and patch the drafts.
    /// On any failure every draft is discarded.
    async fn run_host<T, F, M>(&mut self, host: F, patch: M) -> Result<T, AuditError>
    where
        F: Future<Output = Result<T, AuditError>>,
        M: FnOnce(&T, &mut [AuditDraft]),
    {
        if let Err(err) = self.preflight().await {
            self.discard();
            return Err(err);
        }

        let value = match host.await {
            Ok(value) => value,
            Err(err) => {
                self.discard();
                return Err(err);
            }
        };

        patch(&value, self.drafts.as_mut_slice());
        Ok(value)
    }

    /// Reject a staged create whose entity already has history before the
    /// host commits anything.
    async fn preflight(&self) -> Result<(), AuditError> {
        for draft in self.drafts.iter().filter(|draft| draft.is_create()) {
            let found = self.auditor.store.next_version(&draft.entity).await?;
            if found != 1 {
                return Err(AuditError::VersionConflict {
                    entity: draft.entity.clone(),
                    expected: 1,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Discard every staged draft.
    pub fn rollback(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        let discarded = std::mem::take(&mut self.drafts).len();
        if discarded > 0 {
            tracing::debug!(discarded, "Audit transaction rolled back");
        }
    }
}

impl Drop for AuditTransaction<'_> {
    fn drop(&mut self) {
        if !self.drafts.is_empty() {
            tracing::warn!(
                discarded = self.drafts.len(),
                "Audit transaction dropped without commit"
            );
        }
    }
}
