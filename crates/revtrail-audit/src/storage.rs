//! Audit storage backends.
//!
//! A store owns version assignment: drafts go in, versioned records come
//! out. Assignment and persistence happen under a per-entity lock, so two
//! concurrent mutations of one entity never share a version while
//! mutations of different entities never wait on each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revtrail_core::{ActionKind, AuditConfig, EntityRef, Party, StorageBackend};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::AuditError;
use crate::record::{AuditDraft, AuditRecord};

/// Trait for audit storage backends.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Version the next record of `entity` would get.
    async fn next_version(&self, entity: &EntityRef) -> Result<u64, AuditError>;

    /// Assign versions to `drafts` and persist them as one batch.
    ///
    /// Either every draft is stored or none is. Records are returned in
    /// draft order.
    async fn append(&self, drafts: Vec<AuditDraft>) -> Result<Vec<AuditRecord>, AuditError>;

    /// Store an already versioned record.
    ///
    /// The version must be exactly the entity's next version.
    async fn insert(&self, record: AuditRecord) -> Result<(), AuditError>;

    /// All records of one entity, ordered by version.
    async fn records_for(&self, entity: &EntityRef) -> Result<Vec<AuditRecord>, AuditError>;

    /// Query audit records with filters.
    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditRecord>, AuditError>;

    /// Get an audit record by ID.
    async fn get(&self, id: Uuid) -> Result<Option<AuditRecord>, AuditError>;

    /// Administrative correction of a record's timestamp.
    async fn correct_timestamp(
        &self,
        id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<(), AuditError>;
}

/// Create a storage backend based on configuration.
pub fn create_store(config: &AuditConfig) -> Result<Arc<dyn AuditStore>, AuditError> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::File => Ok(Arc::new(FileStore::open(config.file_path())?)),
    }
}

/// Filter for querying audit records.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Filter by entity type.
    pub entity_type: Option<String>,
    /// Filter by entity ID.
    pub entity_id: Option<i64>,
    /// Filter by action.
    pub action: Option<ActionKind>,
    /// Filter by actor.
    pub actor: Option<Party>,
    /// Filter by tenant.
    pub tenant: Option<Party>,
    /// Filter by request ID.
    pub request_id: Option<String>,
    /// Filter by start time.
    pub start_time: Option<DateTime<Utc>>,
    /// Filter by end time.
    pub end_time: Option<DateTime<Utc>>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Offset for pagination.
    pub offset: Option<usize>,
}

impl AuditFilter {
    /// Filter matching every record of one entity.
    pub fn for_entity(entity: &EntityRef) -> Self {
        Self {
            entity_type: Some(entity.entity_type.clone()),
            entity_id: Some(entity.id),
            ..Default::default()
        }
    }

    fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(ref entity_type) = self.entity_type {
            if &record.entity.entity_type != entity_type {
                return false;
            }
        }
        if let Some(entity_id) = self.entity_id {
            if record.entity.id != entity_id {
                return false;
            }
        }
        if let Some(action) = self.action {
            if record.action != action.as_str() {
                return false;
            }
        }
        if let Some(ref actor) = self.actor {
            if record.actor.as_ref() != Some(actor) {
                return false;
            }
        }
        if let Some(ref tenant) = self.tenant {
            if record.tenant.as_ref() != Some(tenant) {
                return false;
            }
        }
        if let Some(ref request_id) = self.request_id {
            if record.request_id.as_ref() != Some(request_id) {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if record.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if record.created_at > end {
                return false;
            }
        }
        true
    }
}

type History = Arc<AsyncMutex<Vec<AuditRecord>>>;

fn next_in(history: &[AuditRecord]) -> u64 {
    history.last().map(|record| record.version).unwrap_or(0) + 1
}

/// In-process storage.
#[derive(Default)]
pub struct MemoryStore {
    histories: RwLock<HashMap<EntityRef, History>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from existing records, checking version order.
    pub fn from_records(records: Vec<AuditRecord>) -> Result<Self, AuditError> {
        let mut grouped: HashMap<EntityRef, Vec<AuditRecord>> = HashMap::new();
        for record in records {
            grouped.entry(record.entity.clone()).or_default().push(record);
        }

        let mut histories = HashMap::with_capacity(grouped.len());
        for (entity, mut history) in grouped {
            history.sort_by_key(|record| record.version);
            for pair in history.windows(2) {
                if pair[0].version == pair[1].version {
                    return Err(AuditError::DuplicateVersion {
                        entity,
                        version: pair[0].version,
                    });
                }
                if pair[1].version != pair[0].version + 1 {
                    tracing::warn!(
                        entity = %entity,
                        after = pair[0].version,
                        next = pair[1].version,
                        "Gap in audit history"
                    );
                }
            }
            histories.insert(entity, Arc::new(AsyncMutex::new(history)));
        }

        Ok(Self {
            histories: RwLock::new(histories),
        })
    }

    fn history(&self, entity: &EntityRef) -> Result<History, AuditError> {
        if let Some(history) = self.existing(entity)? {
            return Ok(history);
        }
        let mut histories = self.histories.write().map_err(|e| {
            AuditError::StorageError(format!("Failed to acquire write lock: {}", e))
        })?;
        Ok(Arc::clone(histories.entry(entity.clone()).or_default()))
    }

    fn existing(&self, entity: &EntityRef) -> Result<Option<History>, AuditError> {
        let histories = self.histories.read().map_err(|e| {
            AuditError::StorageError(format!("Failed to acquire read lock: {}", e))
        })?;
        Ok(histories.get(entity).cloned())
    }

    fn all_histories(&self) -> Result<Vec<History>, AuditError> {
        let histories = self.histories.read().map_err(|e| {
            AuditError::StorageError(format!("Failed to acquire read lock: {}", e))
        })?;
        Ok(histories.values().cloned().collect())
    }

    /// Append `drafts`, running `persist` on the new records before they
    /// become visible. A `persist` failure stores nothing.
    pub(crate) async fn append_with<P>(
        &self,
        drafts: Vec<AuditDraft>,
        persist: P,
    ) -> Result<Vec<AuditRecord>, AuditError>
    where
        P: FnOnce(&[AuditRecord]) -> Result<(), AuditError> + Send,
    {
        let mut grouped: BTreeMap<EntityRef, Vec<(usize, AuditDraft)>> = BTreeMap::new();
        for (position, draft) in drafts.into_iter().enumerate() {
            grouped
                .entry(draft.entity.clone())
                .or_default()
                .push((position, draft));
        }

        // Locks are taken in entity order so overlapping batches cannot deadlock.
        let mut guards = Vec::with_capacity(grouped.len());
        for entity in grouped.keys() {
            guards.push(self.history(entity)?.lock_owned().await);
        }

        let mut batches = Vec::with_capacity(grouped.len());
        for ((entity, drafts), guard) in grouped.into_iter().zip(guards.iter()) {
            let mut version = next_in(guard);
            let mut batch = Vec::with_capacity(drafts.len());
            for (position, draft) in drafts {
                if draft.is_create() && version != 1 {
                    return Err(AuditError::VersionConflict {
                        entity,
                        expected: 1,
                        found: version,
                    });
                }
                batch.push((position, draft.into_record(version)));
                version += 1;
            }
            batches.push(batch);
        }

        let mut ordered: Vec<(usize, AuditRecord)> = batches.iter().flatten().cloned().collect();
        ordered.sort_by_key(|(position, _)| *position);
        let records: Vec<AuditRecord> = ordered.into_iter().map(|(_, record)| record).collect();

        persist(&records)?;

        for (guard, batch) in guards.iter_mut().zip(batches) {
            guard.extend(batch.into_iter().map(|(_, record)| record));
        }

        for record in &records {
            tracing::debug!(
                record_id = %record.id,
                entity = %record.entity,
                action = %record.action,
                version = record.version,
                "Audit record appended"
            );
        }

        Ok(records)
    }

    pub(crate) async fn insert_with<P>(
        &self,
        record: AuditRecord,
        persist: P,
    ) -> Result<(), AuditError>
    where
        P: FnOnce(&AuditRecord) -> Result<(), AuditError> + Send,
    {
        let history = self.history(&record.entity)?;
        let mut history = history.lock().await;

        let expected = next_in(&history);
        let misplaced_create = record.action == ActionKind::Create.as_str() && expected != 1;
        if record.version != expected || misplaced_create {
            return Err(AuditError::VersionConflict {
                entity: record.entity.clone(),
                expected,
                found: record.version,
            });
        }

        persist(&record)?;
        history.push(record);
        Ok(())
    }

    pub(crate) async fn all_records(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let mut records = Vec::new();
        for history in self.all_histories()? {
            records.extend(history.lock().await.iter().cloned());
        }
        Ok(records)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn next_version(&self, entity: &EntityRef) -> Result<u64, AuditError> {
        match self.existing(entity)? {
            Some(history) => Ok(next_in(&history.lock().await)),
            None => Ok(1),
        }
    }

    async fn append(&self, drafts: Vec<AuditDraft>) -> Result<Vec<AuditRecord>, AuditError> {
        self.append_with(drafts, |_| Ok(())).await
    }

    async fn insert(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.insert_with(record, |_| Ok(())).await
    }

    async fn records_for(&self, entity: &EntityRef) -> Result<Vec<AuditRecord>, AuditError> {
        match self.existing(entity)? {
            Some(history) => Ok(history.lock().await.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let mut results: Vec<_> = self
            .all_records()
            .await?
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect();

        results.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.entity.cmp(&b.entity))
                .then_with(|| a.version.cmp(&b.version))
        });

        // Apply offset and limit
        if let Some(offset) = filter.offset {
            results = results.into_iter().skip(offset).collect();
        }
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }

        Ok(results)
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditRecord>, AuditError> {
        for history in self.all_histories()? {
            if let Some(record) = history.lock().await.iter().find(|r| r.id == id) {
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }

    async fn correct_timestamp(
        &self,
        id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<(), AuditError> {
        for history in self.all_histories()? {
            if let Some(record) = history.lock().await.iter_mut().find(|r| r.id == id) {
                record.created_at = created_at;
                return Ok(());
            }
        }
        Err(AuditError::StorageError(format!("no audit record {}", id)))
    }
}

/// File storage (JSON Lines, one record per line).
///
/// The existing log is read on open and kept in an in-memory index. Every
/// write is appended to the file before it becomes visible in the index.
/// Timestamp corrections are appended as a repeated line for the same record
/// ID; on load the last line for an ID supplies its `created_at`.
pub struct FileStore {
    path: PathBuf,
    index: MemoryStore,
    file: Mutex<File>,
}

impl FileStore {
    /// Open (or create) a log file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            Self::read_log(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!(path = %path.display(), records = records.len(), "Opened audit log");

        Ok(Self {
            path,
            index: MemoryStore::from_records(records)?,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every record from the log.
    ///
    /// A final line without its newline is the remainder of an interrupted
    /// write: it is cut from the file so later appends start on a clean
    /// line. Any other unreadable line is an error.
    fn read_log(path: &Path) -> Result<Vec<AuditRecord>, AuditError> {
        let contents = fs::read(path)?;
        let lines: Vec<&[u8]> = contents.split_inclusive(|byte| *byte == b'\n').collect();
        let mut records: Vec<AuditRecord> = Vec::new();
        let mut positions: HashMap<Uuid, usize> = HashMap::new();
        let mut offset = 0;

        for (number, line) in lines.iter().enumerate() {
            let start = offset;
            offset += line.len();
            if line.trim_ascii().is_empty() {
                continue;
            }

            let record: AuditRecord = match serde_json::from_slice(line) {
                Ok(record) => record,
                Err(e) if number + 1 == lines.len() && !line.ends_with(b"\n") => {
                    tracing::warn!(
                        path = %path.display(),
                        line = number + 1,
                        error = %e,
                        "Discarding torn final audit line"
                    );
                    OpenOptions::new()
                        .write(true)
                        .open(path)?
                        .set_len(start as u64)?;
                    return Ok(records);
                }
                Err(e) => {
                    return Err(AuditError::StorageError(format!(
                        "{}:{}: unreadable audit record: {}",
                        path.display(),
                        number + 1,
                        e
                    )));
                }
            };

            match positions.get(&record.id) {
                Some(&position) => records[position].created_at = record.created_at,
                None => {
                    positions.insert(record.id, records.len());
                    records.push(record);
                }
            }
        }

        // A complete record that lost only its newline.
        if contents.last().is_some_and(|byte| *byte != b'\n') {
            OpenOptions::new().append(true).open(path)?.write_all(b"\n")?;
        }

        Ok(records)
    }

    fn write_lines<'a>(
        &self,
        records: impl IntoIterator<Item = &'a AuditRecord>,
    ) -> Result<(), AuditError> {
        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let mut file = self.file.lock().map_err(|e| {
            AuditError::StorageError(format!("Failed to acquire file lock: {}", e))
        })?;
        file.write_all(&buffer)?;
        file.flush()?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for FileStore {
    async fn next_version(&self, entity: &EntityRef) -> Result<u64, AuditError> {
        self.index.next_version(entity).await
    }

    async fn append(&self, drafts: Vec<AuditDraft>) -> Result<Vec<AuditRecord>, AuditError> {
        self.index
            .append_with(drafts, |records| self.write_lines(records))
            .await
    }

    async fn insert(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.index
            .insert_with(record, |record| self.write_lines([record]))
            .await
    }

    async fn records_for(&self, entity: &EntityRef) -> Result<Vec<AuditRecord>, AuditError> {
        self.index.records_for(entity).await
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        self.index.query(filter).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditRecord>, AuditError> {
        self.index.get(id).await
    }

    async fn correct_timestamp(
        &self,
        id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<(), AuditError> {
        let mut record = self
            .index
            .get(id)
            .await?
            .ok_or_else(|| AuditError::StorageError(format!("no audit record {}", id)))?;
        record.created_at = created_at;

        self.write_lines([&record])?;
        self.index.correct_timestamp(id, created_at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Change, Changes};

    fn draft(entity: &EntityRef, action: ActionKind) -> AuditDraft {
        let mut changes = Changes::new();
        changes.insert("name".into(), Change::created("John"));
        AuditDraft::builder(entity.clone(), action)
            .changes(&changes)
            .unwrap()
            .build()
    }

    #[tokio::test]
    async fn test_memory_store_assigns_versions() {
        let store = MemoryStore::new();
        let user = EntityRef::new("User", 1);

        assert_eq!(store.next_version(&user).await.unwrap(), 1);

        let records = store
            .append(vec![
                draft(&user, ActionKind::Create),
                draft(&user, ActionKind::Update),
            ])
            .await
            .unwrap();
        assert_eq!(records.iter().map(|r| r.version).collect::<Vec<_>>(), vec![1, 2]);

        store.append(vec![draft(&user, ActionKind::Update)]).await.unwrap();
        assert_eq!(store.next_version(&user).await.unwrap(), 4);

        let history = store.records_for(&user).await.unwrap();
        assert_eq!(history.iter().map(|r| r.version).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_batch_returns_draft_order() {
        let store = MemoryStore::new();
        let post = EntityRef::new("Post", 1);
        let user = EntityRef::new("User", 1);

        let records = store
            .append(vec![
                draft(&user, ActionKind::Create),
                draft(&post, ActionKind::Create),
                draft(&user, ActionKind::Update),
            ])
            .await
            .unwrap();

        assert_eq!(records[0].entity, user);
        assert_eq!(records[1].entity, post);
        assert_eq!(records[2].version, 2);
    }

    #[tokio::test]
    async fn test_second_create_conflicts() {
        let store = MemoryStore::new();
        let user = EntityRef::new("User", 1);
        store.append(vec![draft(&user, ActionKind::Create)]).await.unwrap();

        let err = store
            .append(vec![draft(&user, ActionKind::Update), draft(&user, ActionKind::Create)])
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::VersionConflict { .. }));

        // Nothing from the failed batch was stored.
        assert_eq!(store.records_for(&user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_requires_next_version() {
        let store = MemoryStore::new();
        let user = EntityRef::new("User", 1);

        let skipped = draft(&user, ActionKind::Update).into_record(2);
        assert!(matches!(
            store.insert(skipped).await,
            Err(AuditError::VersionConflict { expected: 1, found: 2, .. })
        ));

        store.insert(draft(&user, ActionKind::Create).into_record(1)).await.unwrap();
        store.insert(draft(&user, ActionKind::Update).into_record(2)).await.unwrap();
        assert_eq!(store.next_version(&user).await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_never_share_a_version() {
        let store = Arc::new(MemoryStore::new());
        let user = EntityRef::new("User", 1);
        store.append(vec![draft(&user, ActionKind::Create)]).await.unwrap();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = Arc::clone(&store);
                let user = user.clone();
                tokio::spawn(
                    async move { store.append(vec![draft(&user, ActionKind::Update)]).await },
                )
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let versions: Vec<u64> = store
            .records_for(&user)
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, (1..=33).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_query_filters() {
        let store = MemoryStore::new();
        let alice = EntityRef::new("User", 1);
        let bob = EntityRef::new("User", 2);

        let mut by_admin = draft(&alice, ActionKind::Create);
        by_admin.actor = Some(Party::label("admin"));
        store
            .append(vec![
                by_admin,
                draft(&bob, ActionKind::Create),
                draft(&bob, ActionKind::Update),
            ])
            .await
            .unwrap();

        let bobs = store.query(AuditFilter::for_entity(&bob)).await.unwrap();
        assert_eq!(bobs.len(), 2);

        let updates = store
            .query(AuditFilter {
                action: Some(ActionKind::Update),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updates.len(), 1);

        let admin = store
            .query(AuditFilter {
                actor: Some(Party::label("admin")),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(admin.len(), 1);
        assert_eq!(admin[0].entity, alice);

        let limited = store
            .query(AuditFilter {
                entity_type: Some("User".into()),
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_file_store_reopens_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let user = EntityRef::new("User", 1);

        let corrected_at = Utc::now() - chrono::Duration::days(1);
        let first_id = {
            let store = FileStore::open(&path).unwrap();
            let records = store
                .append(vec![draft(&user, ActionKind::Create), draft(&user, ActionKind::Update)])
                .await
                .unwrap();
            store.correct_timestamp(records[0].id, corrected_at).await.unwrap();
            records[0].id
        };

        let store = FileStore::open(&path).unwrap();
        let history = store.records_for(&user).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, first_id);
        assert_eq!(history[0].created_at, corrected_at);
        assert_eq!(store.next_version(&user).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_file_store_recovers_torn_final_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let user = EntityRef::new("User", 1);

        {
            let store = FileStore::open(&path).unwrap();
            store.append(vec![draft(&user, ActionKind::Create)]).await.unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"id":"5f0c"#).unwrap();
        drop(file);

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.records_for(&user).await.unwrap().len(), 1);
        store.append(vec![draft(&user, ActionKind::Update)]).await.unwrap();
        drop(store);

        let store = FileStore::open(&path).unwrap();
        let versions: Vec<u64> = store
            .records_for(&user)
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_middle_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let user = EntityRef::new("User", 1);
        {
            let store = FileStore::open(&path).unwrap();
            store.append(vec![draft(&user, ActionKind::Create)]).await.unwrap();
        }
        let valid = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, format!("{{\"id\":\"5f0c\n{}", valid)).unwrap();

        let err = FileStore::open(&path).err().unwrap();
        assert!(err.to_string().contains("audit.log:1"));
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        std::fs::write(&path, "not a record\n").unwrap();

        let err = FileStore::open(&path).err().unwrap();
        assert!(err.to_string().contains("audit.log:1"));
    }
}
