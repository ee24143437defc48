//! Shared store handle for the queue, conflicts, cache, and checkpoints.
//!
//! Collaborators enqueue mutations and read state through this type. Queue
//! status changes and conflict creation are crate-private and driven by the
//! sync engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libsql::Connection;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::db::{
    begin, finish, CacheRepository, CheckpointRepository, ConflictRepository, Database,
    LibSqlCacheRepository, LibSqlCheckpointRepository, LibSqlConflictRepository,
    LibSqlQueueRepository, QueueRepository,
};
use crate::models::{
    CacheEntry, CacheKey, CacheStats, ConflictResolution, EntityKey, FailureKind, Mutation,
    QueueCounts, QueueItem, QueueItemInput, QueueStatus, Record, SyncCheckpoint, SyncConflict,
};
use crate::util::now_ms;
use crate::{Error, Result};

/// Thread-safe handle over the local sync database.
#[derive(Clone)]
pub struct SyncStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    config: Arc<SyncConfig>,
}

impl SyncStore {
    /// Open the store at the given filesystem path, creating parent directories.
    pub async fn open_path(db_path: impl Into<PathBuf>, config: SyncConfig) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening sync store at {}", db_path.display());
        let db = Database::open(&db_path).await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
            config: Arc::new(config),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory(config: SyncConfig) -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
            config: Arc::new(config),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn cache<'a>(&'a self, conn: &'a Connection) -> LibSqlCacheRepository<'a> {
        LibSqlCacheRepository::new(conn, &self.config.cache)
    }

    // Mutation queue

    /// Persist a new pending mutation and apply its optimistic cache writes.
    ///
    /// Re-enqueueing with a known `optimistic_id` returns the existing item.
    /// The cache writes and the queue insert commit together or not at all.
    pub async fn enqueue(&self, input: QueueItemInput) -> Result<QueueItem> {
        input.mutation.validate()?;

        let db = self.db.lock().await;
        let conn = db.connection();
        let queue = LibSqlQueueRepository::new(conn);

        if let Some(optimistic_id) = input.optimistic_id.as_deref() {
            if let Some(existing) = queue.find_by_optimistic_id(optimistic_id).await? {
                tracing::debug!(item = %existing.id, optimistic_id, "Mutation already queued");
                return Ok(existing);
            }
        }

        let mut item = input.into_item(now_ms());
        if queue.get(&item.id).await?.is_some() {
            return Err(Error::InvalidInput(format!(
                "queue item id {} already exists",
                item.id
            )));
        }

        begin(conn).await?;
        let result: Result<QueueItem> = async {
            let cache = self.cache(conn);
            fill_missing_base(&cache, &mut item).await?;
            for (key, value) in optimistic_values(&cache, &item).await? {
                cache.apply_optimistic(&key, &item.optimistic_id, &value).await?;
            }
            queue.insert(&item).await
        }
        .await;
        let stored = finish(conn, result).await?;

        tracing::info!(
            item = %stored.id,
            kind = stored.mutation.kind(),
            table = stored.mutation.table(),
            "Queued mutation"
        );
        Ok(stored)
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<QueueItem>> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).get(id).await
    }

    /// Every queue item in drain order
    pub async fn list_all(&self) -> Result<Vec<QueueItem>> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection()).list_all().await
    }

    pub async fn all_failed(&self) -> Result<Vec<QueueItem>> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .list_by_status(QueueStatus::Failed)
            .await
    }

    pub async fn count_by_status(&self) -> Result<QueueCounts> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .count_by_status()
            .await
    }

    /// Items waiting for (or inside) a sync pass
    pub async fn pending_count(&self) -> Result<usize> {
        let counts = self.count_by_status().await?;
        Ok(counts.pending + counts.processing)
    }

    /// Items not yet completed, whatever their state
    pub async fn queue_count(&self) -> Result<usize> {
        Ok(self.count_by_status().await?.outstanding())
    }

    /// Move a failed item (transient or fatal) back to pending.
    pub async fn retry(&self, id: &str) -> Result<QueueItem> {
        let db = self.db.lock().await;
        let item = LibSqlQueueRepository::new(db.connection()).requeue(id).await?;
        tracing::info!(item = id, "Queue item scheduled for retry");
        Ok(item)
    }

    /// Abandon a failed item, undoing its optimistic cache writes.
    pub async fn discard(&self, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let queue = LibSqlQueueRepository::new(conn);

        let item = queue
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue item {id}")))?;
        if item.status != QueueStatus::Failed {
            return Err(Error::InvalidInput(format!(
                "only failed items can be discarded; {id} is {}",
                item.status
            )));
        }

        begin(conn).await?;
        let result: Result<()> = async {
            rollback_item_writes(&self.cache(conn), &item).await?;
            LibSqlConflictRepository::new(conn)
                .delete_for_item(id)
                .await?;
            queue.delete(id).await
        }
        .await;
        finish(conn, result).await?;

        tracing::info!(item = id, "Discarded failed queue item");
        Ok(())
    }

    /// Drop completed items older than the configured retention.
    pub async fn purge_completed(&self) -> Result<usize> {
        let retention = i64::try_from(self.config.completed_retention.as_millis()).unwrap_or(i64::MAX);
        self.purge_completed_before(now_ms().saturating_sub(retention))
            .await
    }

    pub async fn purge_completed_before(&self, before: i64) -> Result<usize> {
        let db = self.db.lock().await;
        let purged = LibSqlQueueRepository::new(db.connection())
            .purge_completed(before)
            .await?;
        if purged > 0 {
            tracing::info!("Purged {purged} completed queue item(s)");
        }
        Ok(purged)
    }

    // Conflicts

    pub async fn unresolved_conflicts(&self, scope_id: &str) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_unresolved(Some(scope_id))
            .await
    }

    pub async fn conflict_count(&self, scope_id: &str) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .count_unresolved(Some(scope_id))
            .await
    }

    /// Unresolved conflicts across every scope
    pub async fn all_unresolved_conflicts(&self) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_unresolved(None)
            .await
    }

    pub async fn get_conflict(&self, id: &str) -> Result<Option<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection()).get(id).await
    }

    pub async fn conflicts_for_item(&self, queue_item_id: &str) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_for_item(queue_item_id)
            .await
    }

    /// Record a resolution choice.
    ///
    /// Returns `false` when the conflict does not exist or is already
    /// resolved. `Merged` requires `resolved_data`; the other strategies take
    /// none.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        strategy: ConflictResolution,
        resolved_data: Option<Record>,
    ) -> Result<bool> {
        match (strategy, &resolved_data) {
            (ConflictResolution::Merged, None) => {
                return Err(Error::InvalidInput(
                    "merged resolution requires resolved data".to_string(),
                ))
            }
            (ConflictResolution::ClientWins | ConflictResolution::ServerWins, Some(_)) => {
                return Err(Error::InvalidInput(format!(
                    "resolved data is only accepted for merged resolutions, not {strategy}"
                )))
            }
            _ => {}
        }

        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .resolve(id, strategy, resolved_data.as_ref(), now_ms())
            .await
    }

    // Checkpoints

    pub async fn all_checkpoints(&self, scope_id: &str) -> Result<Vec<SyncCheckpoint>> {
        let db = self.db.lock().await;
        LibSqlCheckpointRepository::new(db.connection())
            .list(scope_id)
            .await
    }

    pub async fn checkpoint(&self, scope_id: &str, table_name: &str) -> Result<Option<SyncCheckpoint>> {
        let db = self.db.lock().await;
        LibSqlCheckpointRepository::new(db.connection())
            .get(scope_id, table_name)
            .await
    }

    // Local cache

    pub async fn cache_get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let db = self.db.lock().await;
        self.cache(db.connection()).get(key).await
    }

    pub async fn cache_list(&self, scope_id: &str, collection: &str) -> Result<Vec<CacheEntry>> {
        let db = self.db.lock().await;
        self.cache(db.connection())
            .list_collection(scope_id, collection)
            .await
    }

    pub async fn cache_put(&self, key: &CacheKey, data: &Value) -> Result<()> {
        let db = self.db.lock().await;
        self.cache(db.connection()).put(key, data).await
    }

    pub async fn cache_invalidate(&self, key: &CacheKey) -> Result<usize> {
        let db = self.db.lock().await;
        self.cache(db.connection()).invalidate(key).await
    }

    pub async fn cache_invalidate_where<F>(&self, scope_id: &str, predicate: F) -> Result<usize>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let db = self.db.lock().await;
        self.cache(db.connection())
            .invalidate_where(scope_id, predicate)
            .await
    }

    pub async fn cache_stats(&self, scope_id: &str) -> Result<CacheStats> {
        let db = self.db.lock().await;
        self.cache(db.connection()).stats(scope_id).await
    }

    // Engine-side operations

    pub(crate) async fn recover_interrupted(&self) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlQueueRepository::new(db.connection())
            .recover_interrupted()
            .await
    }

    /// Move an eligible item into `processing`, via `pending` if it failed before.
    pub(crate) async fn begin_item(&self, item: &QueueItem) -> Result<QueueItem> {
        let db = self.db.lock().await;
        let queue = LibSqlQueueRepository::new(db.connection());
        if item.status == QueueStatus::Failed {
            queue.requeue(&item.id).await?;
        }
        queue.mark_processing(&item.id).await
    }

    /// Adopt the server's values, advance the table checkpoint, and complete the item.
    pub(crate) async fn complete_item(
        &self,
        item: &QueueItem,
        server: &[(EntityKey, Value)],
        records_synced: i64,
    ) -> Result<QueueItem> {
        let db = self.db.lock().await;
        let conn = db.connection();

        begin(conn).await?;
        let result: Result<QueueItem> = async {
            let cache = self.cache(conn);
            for (entity, value) in server {
                let key = CacheKey::for_entity(&item.scope_id, entity);
                settle(&cache, &key, &item.optimistic_id, value).await?;
            }
            LibSqlCheckpointRepository::new(conn)
                .advance(&item.scope_id, item.mutation.table(), records_synced, now_ms())
                .await?;
            LibSqlQueueRepository::new(conn).mark_completed(&item.id).await
        }
        .await;
        finish(conn, result).await
    }

    /// Record a failed attempt; fatal failures also undo the optimistic writes.
    pub(crate) async fn fail_item(
        &self,
        item: &QueueItem,
        error: &str,
        kind: FailureKind,
    ) -> Result<QueueItem> {
        let db = self.db.lock().await;
        let conn = db.connection();

        begin(conn).await?;
        let result: Result<QueueItem> = async {
            if kind == FailureKind::Fatal {
                rollback_item_writes(&self.cache(conn), item).await?;
            }
            LibSqlQueueRepository::new(conn)
                .mark_failed(&item.id, error, kind)
                .await
        }
        .await;
        finish(conn, result).await
    }

    /// Store new conflicts, settle the records that agreed, and block the item.
    pub(crate) async fn record_conflicts(
        &self,
        item: &QueueItem,
        conflicts: &[SyncConflict],
        agreed: &[(EntityKey, Value)],
    ) -> Result<QueueItem> {
        let first = conflicts
            .first()
            .ok_or_else(|| Error::InvalidInput("no conflicts to record".to_string()))?;

        let db = self.db.lock().await;
        let conn = db.connection();

        begin(conn).await?;
        let result: Result<QueueItem> = async {
            let store = LibSqlConflictRepository::new(conn);
            for conflict in conflicts {
                store.insert(conflict).await?;
            }
            let cache = self.cache(conn);
            for (entity, value) in agreed {
                let key = CacheKey::for_entity(&item.scope_id, entity);
                settle(&cache, &key, &item.optimistic_id, value).await?;
            }
            LibSqlQueueRepository::new(conn)
                .mark_awaiting_confirmation(&item.id, &first.id)
                .await
        }
        .await;
        finish(conn, result).await
    }

    /// Resolved conflicts whose outcome has not been applied yet
    pub(crate) async fn pending_resolutions(&self) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        LibSqlConflictRepository::new(db.connection())
            .list_pending_application()
            .await
    }

    /// Mark a resolution applied and write `value` to the cache.
    ///
    /// Completes the originating item once none of its conflicts remain open.
    /// Returns the completed item, if this call completed it.
    pub(crate) async fn finish_resolution(
        &self,
        conflict_id: &str,
        value: &Value,
    ) -> Result<Option<QueueItem>> {
        let db = self.db.lock().await;
        let conn = db.connection();

        begin(conn).await?;
        let result: Result<Option<QueueItem>> = async {
            let conflicts = LibSqlConflictRepository::new(conn);
            let queue = LibSqlQueueRepository::new(conn);

            let conflict = conflicts
                .get(conflict_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
            if conflict.is_applied() {
                return Ok(None);
            }
            let item = queue
                .get(&conflict.queue_item_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("queue item {}", conflict.queue_item_id)))?;

            conflicts.mark_applied(conflict_id, now_ms()).await?;
            let key = CacheKey::for_entity(&conflict.scope_id, &conflict.entity_key());
            settle(&self.cache(conn), &key, &item.optimistic_id, value).await?;

            let still_open = conflicts.count_open_for_item(&item.id).await?;
            if still_open == 0 && item.status == QueueStatus::AwaitingConfirmation {
                return Ok(Some(queue.mark_completed(&item.id).await?));
            }
            Ok(None)
        }
        .await;
        finish(conn, result).await
    }
}

/// Replace an optimistic write with `value`, or store `value` outright when
/// the write was already reconciled.
async fn settle(
    cache: &LibSqlCacheRepository<'_>,
    key: &CacheKey,
    optimistic_id: &str,
    value: &Value,
) -> Result<()> {
    if cache.confirm_optimistic(key, optimistic_id, value).await? {
        return Ok(());
    }
    if value.is_null() {
        cache.invalidate(key).await.map(|_| ())
    } else {
        cache.put(key, value).await
    }
}

async fn rollback_item_writes(cache: &LibSqlCacheRepository<'_>, item: &QueueItem) -> Result<()> {
    for key in cache.optimistic_keys(&item.optimistic_id).await? {
        cache.rollback_optimistic(&key, &item.optimistic_id).await?;
    }
    Ok(())
}

/// Updates queued without a base assume whatever the cache currently shows.
async fn fill_missing_base(cache: &LibSqlCacheRepository<'_>, item: &mut QueueItem) -> Result<()> {
    let scope_id = item.scope_id.clone();
    if let Mutation::RecordUpdate { table, id, base, .. } = &mut item.mutation {
        if base.is_empty() {
            let key = CacheKey::record(scope_id, table.as_str(), id.as_str());
            if let Some(Value::Object(cached)) = cache.get(&key).await?.map(|entry| entry.data) {
                *base = cached;
            }
        }
    }
    Ok(())
}

/// The cache values an item shows before the remote store confirms it.
async fn optimistic_values(
    cache: &LibSqlCacheRepository<'_>,
    item: &QueueItem,
) -> Result<Vec<(CacheKey, Value)>> {
    let mut values = Vec::new();

    match &item.mutation {
        Mutation::RecordDelete { table, id } => {
            values.push((CacheKey::record(&item.scope_id, table, id), Value::Null));
        }
        Mutation::RecordUpdate { changes, .. } => {
            for (entity, snapshot) in item.mutation.client_snapshots() {
                let key = CacheKey::for_entity(&item.scope_id, &entity);
                // Layer the change over the newest visible value
                let value = match cache.get(&key).await?.map(|entry| entry.data) {
                    Some(Value::Object(mut current)) => {
                        for (field, value) in changes {
                            current.insert(field.clone(), value.clone());
                        }
                        Value::Object(current)
                    }
                    _ => Value::Object(snapshot),
                };
                values.push((key, value));
            }
        }
        Mutation::RecordCreate { .. } | Mutation::BulkInsert { .. } => {
            for (entity, snapshot) in item.mutation.client_snapshots() {
                values.push((
                    CacheKey::for_entity(&item.scope_id, &entity),
                    Value::Object(snapshot),
                ));
            }
        }
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldStamps;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    async fn store() -> SyncStore {
        SyncStore::open_in_memory(SyncConfig::default()).await.unwrap()
    }

    fn create(id: &str, amount: i64) -> QueueItemInput {
        QueueItemInput::new(
            "farm-1",
            Mutation::RecordCreate {
                table: "expenses".into(),
                id: id.into(),
                record: record(json!({"amount": amount})),
            },
        )
    }

    fn key(id: &str) -> CacheKey {
        CacheKey::record("farm-1", "expenses", id)
    }

    fn conflict_for(item: &QueueItem, id: &str) -> SyncConflict {
        SyncConflict {
            id: id.to_string(),
            queue_item_id: item.id.clone(),
            scope_id: item.scope_id.clone(),
            table_name: "expenses".into(),
            record_id: "e-1".into(),
            client_data: record(json!({"id": "e-1", "amount": 100})),
            server_data: record(json!({"id": "e-1", "amount": 75})),
            client_stamps: FieldStamps::uniform(2),
            server_stamps: FieldStamps::uniform(1),
            created_at: 10,
            resolution: None,
            resolved_data: None,
            resolved_at: None,
            applied_at: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_writes_optimistic_cache_entry() {
        let store = store().await;
        let item = store.enqueue(create("e-1", 100)).await.unwrap();

        assert_eq!(item.status, QueueStatus::Pending);
        let entry = store.cache_get(&key("e-1")).await.unwrap().unwrap();
        assert_eq!(entry.data, json!({"id": "e-1", "amount": 100}));
        assert_eq!(entry.optimistic_id.as_deref(), Some(item.optimistic_id.as_str()));
        assert_eq!(store.pending_count().await.unwrap(), 1);

        store.enqueue(create("e-0", 7)).await.unwrap();
        let listed = store.cache_list("farm-1", "expenses").await.unwrap();
        assert_eq!(
            listed.iter().map(|entry| entry.data["id"].clone()).collect::<Vec<_>>(),
            vec![json!("e-0"), json!("e-1")]
        );
        assert!(store.cache_list("farm-2", "expenses").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_is_idempotent_per_optimistic_id() {
        let store = store().await;
        let first = store
            .enqueue(create("e-1", 100).with_optimistic_id("opt-1"))
            .await
            .unwrap();
        let again = store
            .enqueue(create("e-1", 100).with_optimistic_id("opt-1"))
            .await
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(store.queue_count().await.unwrap(), 1);

        let clash = store
            .enqueue(create("e-2", 1).with_id(first.id.clone()))
            .await;
        assert!(matches!(clash, Err(Error::InvalidInput(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enqueue_rejects_invalid_mutation() {
        let store = store().await;
        let input = QueueItemInput::new(
            "farm-1",
            Mutation::RecordDelete {
                table: "expenses".into(),
                id: String::new(),
            },
        );
        assert!(matches!(
            store.enqueue(input).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_queue_insert_leaves_no_optimistic_write() {
        let store = store().await;
        {
            let db = store.db.lock().await;
            db.connection()
                .execute(
                    "CREATE TRIGGER reject_queue_insert BEFORE INSERT ON queue_items
                     BEGIN SELECT RAISE(ABORT, 'disk full'); END",
                    (),
                )
                .await
                .unwrap();
        }

        assert!(store.enqueue(create("e-1", 100)).await.is_err());
        assert!(store.cache_get(&key("e-1")).await.unwrap().is_none());
        assert_eq!(store.cache_stats("farm-1").await.unwrap().optimistic, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_without_base_assumes_cached_value() {
        let store = store().await;
        store
            .cache_put(&key("e-1"), &json!({"id": "e-1", "amount": 50, "category": "Other"}))
            .await
            .unwrap();

        let item = store
            .enqueue(QueueItemInput::new(
                "farm-1",
                Mutation::RecordUpdate {
                    table: "expenses".into(),
                    id: "e-1".into(),
                    base: Record::new(),
                    changes: record(json!({"amount": 100})),
                },
            ))
            .await
            .unwrap();

        assert_eq!(
            item.mutation.base_snapshot().cloned().map(Value::Object),
            Some(json!({"id": "e-1", "amount": 50, "category": "Other"}))
        );
        let entry = store.cache_get(&key("e-1")).await.unwrap().unwrap();
        assert_eq!(entry.data, json!({"id": "e-1", "amount": 100, "category": "Other"}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fatal_failure_rolls_back_and_discard_removes_item() {
        let store = store().await;
        let item = store.enqueue(create("e-1", 100)).await.unwrap();

        let processing = store.begin_item(&item).await.unwrap();
        let failed = store
            .fail_item(&processing, "rejected", FailureKind::Fatal)
            .await
            .unwrap();
        assert_eq!(failed.failure_kind, Some(FailureKind::Fatal));
        assert!(!failed.is_eligible_for_sync());
        assert!(store.cache_get(&key("e-1")).await.unwrap().is_none());
        assert_eq!(store.all_failed().await.unwrap().len(), 1);

        store.discard(&item.id).await.unwrap();
        assert!(store.get_item(&item.id).await.unwrap().is_none());
        assert!(matches!(
            store.discard(&item.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_discard_rolls_back_transient_failure() {
        let store = store().await;
        let item = store.enqueue(create("e-1", 100)).await.unwrap();

        assert!(store.discard(&item.id).await.is_err());

        let processing = store.begin_item(&item).await.unwrap();
        store
            .fail_item(&processing, "timeout", FailureKind::Transient)
            .await
            .unwrap();
        // Transient failures keep the optimistic write visible
        assert!(store.cache_get(&key("e-1")).await.unwrap().is_some());

        store.discard(&item.id).await.unwrap();
        assert!(store.cache_get(&key("e-1")).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_requires_failed_item() {
        let store = store().await;
        let item = store.enqueue(create("e-1", 100)).await.unwrap();
        assert!(matches!(
            store.retry(&item.id).await,
            Err(Error::InvalidTransition { .. })
        ));

        let processing = store.begin_item(&item).await.unwrap();
        store
            .fail_item(&processing, "rejected", FailureKind::Fatal)
            .await
            .unwrap();
        let retried = store.retry(&item.id).await.unwrap();
        assert_eq!(retried.status, QueueStatus::Pending);
        assert_eq!(retried.retry_count, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolution_completes_item_once_all_conflicts_applied() {
        let store = store().await;
        let item = store.enqueue(create("e-1", 100)).await.unwrap();
        let processing = store.begin_item(&item).await.unwrap();

        let blocked = store
            .record_conflicts(
                &processing,
                &[conflict_for(&item, "c-1"), conflict_for(&item, "c-2")],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(blocked.status, QueueStatus::AwaitingConfirmation);
        assert_eq!(blocked.conflict_id.as_deref(), Some("c-1"));
        assert_eq!(store.conflict_count("farm-1").await.unwrap(), 2);
        assert_eq!(store.conflict_count("farm-2").await.unwrap(), 0);

        for id in ["c-1", "c-2"] {
            assert!(store
                .resolve_conflict(id, ConflictResolution::ServerWins, None)
                .await
                .unwrap());
        }
        assert_eq!(store.pending_resolutions().await.unwrap().len(), 2);

        let server = json!({"id": "e-1", "amount": 75});
        assert!(store.finish_resolution("c-1", &server).await.unwrap().is_none());
        let completed = store.finish_resolution("c-2", &server).await.unwrap().unwrap();
        assert_eq!(completed.status, QueueStatus::Completed);

        // Applying twice is a no-op
        assert!(store.finish_resolution("c-2", &server).await.unwrap().is_none());

        let entry = store.cache_get(&key("e-1")).await.unwrap().unwrap();
        assert_eq!(entry.data, server);
        assert!(!entry.is_optimistic());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolve_conflict_validates_resolved_data() {
        let store = store().await;
        let item = store.enqueue(create("e-1", 100)).await.unwrap();
        let processing = store.begin_item(&item).await.unwrap();
        store
            .record_conflicts(&processing, &[conflict_for(&item, "c-1")], &[])
            .await
            .unwrap();
        assert!(!store.get_conflict("c-1").await.unwrap().unwrap().is_resolved());

        assert!(matches!(
            store
                .resolve_conflict("c-1", ConflictResolution::Merged, None)
                .await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            store
                .resolve_conflict("c-1", ConflictResolution::ClientWins, Some(Record::new()))
                .await,
            Err(Error::InvalidInput(_))
        ));
        assert!(!store
            .resolve_conflict("missing", ConflictResolution::ClientWins, None)
            .await
            .unwrap());

        let merged = record(json!({"id": "e-1", "amount": 90}));
        assert!(store
            .resolve_conflict("c-1", ConflictResolution::Merged, Some(merged.clone()))
            .await
            .unwrap());
        let conflict = store.get_conflict("c-1").await.unwrap().unwrap();
        assert!(conflict.is_resolved());
        assert_eq!(conflict.resolved_data, Some(merged));
        assert!(store.unresolved_conflicts("farm-1").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_complete_item_advances_checkpoint() {
        let store = store().await;
        let item = store.enqueue(create("e-1", 100)).await.unwrap();
        let processing = store.begin_item(&item).await.unwrap();

        let server = json!({"id": "e-1", "amount": 100, "updated_at": 5});
        let completed = store
            .complete_item(&processing, &[(EntityKey::new("expenses", "e-1"), server.clone())], 1)
            .await
            .unwrap();
        assert_eq!(completed.status, QueueStatus::Completed);

        let checkpoint = store.checkpoint("farm-1", "expenses").await.unwrap().unwrap();
        assert_eq!(checkpoint.records_synced, 1);
        assert_eq!(store.all_checkpoints("farm-1").await.unwrap().len(), 1);

        let entry = store.cache_get(&key("e-1")).await.unwrap().unwrap();
        assert_eq!(entry.data, server);
        assert!(!entry.is_optimistic());

        assert_eq!(store.purge_completed_before(i64::MAX).await.unwrap(), 1);
    }
}
