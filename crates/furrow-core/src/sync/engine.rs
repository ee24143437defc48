//! Sync engine: drains the mutation queue against a remote store.
//!
//! A pass handles one item at a time, in queue order. Each item ends the pass
//! `completed`, `failed`, or `awaiting_confirmation`; nothing is retried
//! within the same pass. Concurrent `sync()` calls share one pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use super::remote::{RemoteRequest, RemoteStore};
use super::resolver;
use crate::config::ConflictPolicy;
use crate::models::{
    record_id, ConflictResolution, EntityKey, FailureKind, Mutation, QueueCounts, QueueItem,
    QueueStatus, Record, SyncConflict,
};
use crate::services::SyncStore;
use crate::state::SyncState;
use crate::util::now_ms;
use crate::{Error, Result};

/// Why a pass did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: i64,
    pub finished_at: i64,
    pub skipped: Option<SkipReason>,
    /// Items sent to the remote store
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Items that ended the pass blocked on a new conflict
    pub conflicted: usize,
    /// Items held back behind an earlier item for the same record
    pub deferred: usize,
    /// Items found stuck in `processing` and returned to `pending`
    pub recovered: usize,
    /// Previously resolved conflicts applied at the start of the pass
    pub resolutions_applied: usize,
    pub aborted: bool,
}

impl SyncReport {
    pub const fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// Point-in-time health snapshot for status badges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub queue: QueueCounts,
    pub unresolved_conflicts: usize,
    pub last_report: Option<SyncReport>,
}

type SharedOutcome = Option<std::result::Result<SyncReport, String>>;
type FlightSlot = Mutex<Option<watch::Receiver<SharedOutcome>>>;

enum Flight {
    Lead(watch::Sender<SharedOutcome>),
    Follow(watch::Receiver<SharedOutcome>),
}

enum ItemOutcome {
    Completed,
    Failed,
    /// `settled` when an automatic merge already completed the item
    Conflicted { settled: bool },
}

/// Clears the in-flight slot when the leading pass ends or is dropped.
struct FlightGuard<'a>(&'a FlightSlot);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.0).take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SyncEngine<R> {
    store: SyncStore,
    remote: R,
    in_flight: FlightSlot,
    abort: AtomicBool,
    state: watch::Sender<SyncState>,
    last_report: Mutex<Option<SyncReport>>,
}

impl<R: RemoteStore> SyncEngine<R> {
    pub fn new(store: SyncStore, remote: R) -> Self {
        let (state, _) = watch::channel(SyncState::default());
        Self {
            store,
            remote,
            in_flight: Mutex::new(None),
            abort: AtomicBool::new(false),
            state,
            last_report: Mutex::new(None),
        }
    }

    pub const fn store(&self) -> &SyncStore {
        &self.store
    }

    pub const fn remote(&self) -> &R {
        &self.remote
    }

    /// Watch the coarse sync state as passes start and finish.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Stop the current pass before its next item. The item in flight finishes.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        tracing::info!("Sync abort requested");
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let state = *self.state.borrow();
        let last_report = lock(&self.last_report).clone();
        let queue = self.store.count_by_status().await?;
        let unresolved_conflicts = self.store.all_unresolved_conflicts().await?.len();

        Ok(SyncStatus {
            state,
            queue,
            unresolved_conflicts,
            last_report,
        })
    }

    /// Run one sync pass, or join the pass already in flight.
    pub async fn sync(&self) -> Result<SyncReport> {
        let flight = {
            let mut slot = lock(&self.in_flight);
            if let Some(receiver) = slot.as_ref() {
                Flight::Follow(receiver.clone())
            } else {
                let (sender, receiver) = watch::channel(None);
                *slot = Some(receiver);
                Flight::Lead(sender)
            }
        };

        let sender = match flight {
            Flight::Lead(sender) => sender,
            Flight::Follow(receiver) => {
                tracing::debug!("Sync already in flight; sharing its result");
                return follow(receiver).await;
            }
        };

        let _guard = FlightGuard(&self.in_flight);
        let result = self.run_pass().await;

        if let Ok(report) = &result {
            *lock(&self.last_report) = Some(report.clone());
        }
        let shared = match &result {
            Ok(report) => Ok(report.clone()),
            Err(error) => Err(error.to_string()),
        };
        sender.send_replace(Some(shared));
        result
    }

    async fn run_pass(&self) -> Result<SyncReport> {
        self.abort.store(false, Ordering::SeqCst);
        let mut report = SyncReport {
            started_at: now_ms(),
            ..SyncReport::default()
        };

        if !self.remote.is_reachable().await {
            tracing::info!("Sync skipped: remote store unreachable");
            report.skipped = Some(SkipReason::Offline);
            report.finished_at = now_ms();
            self.state.send_replace(SyncState::Offline);
            return Ok(report);
        }

        self.state.send_replace(SyncState::Syncing);
        let outcome = self.drain(&mut report).await;
        report.finished_at = now_ms();

        match outcome {
            Ok(()) => {
                let state = if report.failed > 0 {
                    SyncState::Error
                } else {
                    SyncState::Synced
                };
                self.state.send_replace(state);
                tracing::info!(
                    processed = report.processed,
                    completed = report.completed,
                    failed = report.failed,
                    conflicted = report.conflicted,
                    deferred = report.deferred,
                    aborted = report.aborted,
                    "Sync pass finished"
                );
                Ok(report)
            }
            Err(error) => {
                self.state.send_replace(SyncState::Error);
                tracing::error!("Sync pass failed: {error}");
                Err(error)
            }
        }
    }

    async fn drain(&self, report: &mut SyncReport) -> Result<()> {
        report.recovered = self.store.recover_interrupted().await?;

        for conflict in self.store.pending_resolutions().await? {
            match self.apply_resolution(&conflict).await {
                Ok(_) => report.resolutions_applied += 1,
                Err(error) => {
                    tracing::warn!(conflict = %conflict.id, "Could not apply conflict resolution: {error}");
                }
            }
        }

        // Items enqueued after this snapshot wait for the next pass
        let items = self.store.list_all().await?;
        let mut blocked: BTreeSet<EntityKey> = items
            .iter()
            .filter(|item| item.status != QueueStatus::Completed && !item.is_eligible_for_sync())
            .flat_map(|item| item.mutation.entity_keys())
            .collect();
        let mut tallies: BTreeMap<(String, String), i64> = BTreeMap::new();

        for item in items.iter().filter(|item| item.is_eligible_for_sync()) {
            if self.abort.load(Ordering::SeqCst) {
                tracing::info!("Sync pass aborted; remaining items wait for the next pass");
                report.aborted = true;
                break;
            }

            let entities = item.mutation.entity_keys();
            if entities.iter().any(|entity| blocked.contains(entity)) {
                tracing::debug!(item = %item.id, "Deferred behind an earlier change to the same record");
                report.deferred += 1;
                blocked.extend(entities);
                continue;
            }

            report.processed += 1;
            let tally = tallies
                .entry((item.scope_id.clone(), item.mutation.table().to_string()))
                .or_insert(0);
            let records = item.mutation.record_count();

            match self.process_item(item, *tally + records).await? {
                ItemOutcome::Completed => {
                    *tally += records;
                    report.completed += 1;
                }
                ItemOutcome::Failed => {
                    report.failed += 1;
                    blocked.extend(entities);
                }
                ItemOutcome::Conflicted { settled } => {
                    report.conflicted += 1;
                    if !settled {
                        blocked.extend(entities);
                    }
                }
            }
        }

        Ok(())
    }

    async fn process_item(&self, item: &QueueItem, records_synced: i64) -> Result<ItemOutcome> {
        let item = self.store.begin_item(item).await?;
        tracing::debug!(item = %item.id, kind = item.mutation.kind(), "Sending mutation");

        let request = RemoteRequest {
            idempotency_key: item.optimistic_id.clone(),
            mutation: item.mutation.clone(),
        };
        let response = match self.remote.apply(&request).await {
            Ok(response) if response.idempotency_key == request.idempotency_key => response,
            Ok(response) => {
                let message = format!(
                    "response attributed to '{}' instead of '{}'",
                    response.idempotency_key, request.idempotency_key
                );
                return self.fail(&item, &message, FailureKind::Transient).await;
            }
            Err(error) => {
                let kind = if error.is_transient() {
                    FailureKind::Transient
                } else {
                    FailureKind::Fatal
                };
                return self.fail(&item, &error.to_string(), kind).await;
            }
        };

        let config = self.store.config();
        let server = server_values(&item.mutation, &response.rows);
        let detected = resolver::detect(
            &item.mutation,
            item.created_at,
            &response.rows,
            &config.ignored_fields,
        );

        if detected.is_empty() {
            self.store
                .complete_item(&item, &server, records_synced)
                .await?;
            tracing::debug!(item = %item.id, "Mutation applied");
            return Ok(ItemOutcome::Completed);
        }

        let detected_at = now_ms();
        let conflicts = detected
            .into_iter()
            .map(|detected| {
                tracing::warn!(
                    item = %item.id,
                    entity = %detected.entity,
                    fields = ?detected.fields,
                    "Server state diverged from the queued change"
                );
                SyncConflict {
                    id: Uuid::now_v7().to_string(),
                    queue_item_id: item.id.clone(),
                    scope_id: item.scope_id.clone(),
                    table_name: detected.entity.table,
                    record_id: detected.entity.id,
                    client_data: detected.client,
                    server_data: detected.server,
                    client_stamps: detected.client_stamps,
                    server_stamps: detected.server_stamps,
                    created_at: detected_at,
                    resolution: None,
                    resolved_data: None,
                    resolved_at: None,
                    applied_at: None,
                }
            })
            .collect::<Vec<_>>();

        let conflicted: BTreeSet<EntityKey> =
            conflicts.iter().map(SyncConflict::entity_key).collect();
        let agreed = server
            .into_iter()
            .filter(|(entity, _)| !conflicted.contains(entity))
            .collect::<Vec<_>>();
        self.store
            .record_conflicts(&item, &conflicts, &agreed)
            .await?;

        let settled = match config.conflict_policy {
            ConflictPolicy::Manual => false,
            ConflictPolicy::AutoMerge => self.auto_merge(&conflicts).await,
        };
        Ok(ItemOutcome::Conflicted { settled })
    }

    async fn fail(&self, item: &QueueItem, error: &str, kind: FailureKind) -> Result<ItemOutcome> {
        tracing::warn!(item = %item.id, kind = %kind, "Mutation failed: {error}");
        self.store.fail_item(item, error, kind).await?;
        Ok(ItemOutcome::Failed)
    }

    /// Merge-resolve and apply fresh conflicts; `true` once the item completed.
    async fn auto_merge(&self, conflicts: &[SyncConflict]) -> bool {
        let mut completed = false;
        for conflict in conflicts {
            match self.merge_conflict(&conflict.id).await {
                Ok(item) => completed |= item.is_some(),
                Err(error) => {
                    tracing::warn!(conflict = %conflict.id, "Automatic merge not applied: {error}");
                    return false;
                }
            }
        }
        completed
    }

    /// Record a resolution choice for a conflict.
    ///
    /// Returns `false` when the conflict is unknown or already resolved.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ConflictResolution,
        resolved_data: Option<Record>,
    ) -> Result<bool> {
        self.store
            .resolve_conflict(conflict_id, strategy, resolved_data)
            .await
    }

    /// Resolve a conflict with the per-field merge and apply it.
    pub async fn merge_conflict(&self, conflict_id: &str) -> Result<Option<QueueItem>> {
        let conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;

        let merged = resolver::merge(
            &conflict.client_data,
            &conflict.server_data,
            &conflict.client_stamps,
            &conflict.server_stamps,
        );
        if !self
            .store
            .resolve_conflict(conflict_id, ConflictResolution::Merged, Some(merged))
            .await?
        {
            return Err(Error::InvalidInput(format!(
                "conflict {conflict_id} is already resolved"
            )));
        }
        self.apply_conflict_resolution(conflict_id).await
    }

    /// Push a recorded resolution to the remote store and the cache.
    ///
    /// Returns the originating queue item when this call completed it.
    /// Applying an already applied resolution is a no-op.
    pub async fn apply_conflict_resolution(&self, conflict_id: &str) -> Result<Option<QueueItem>> {
        let conflict = self
            .store
            .get_conflict(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;
        if conflict.is_applied() {
            return Ok(None);
        }
        self.apply_resolution(&conflict).await
    }

    async fn apply_resolution(&self, conflict: &SyncConflict) -> Result<Option<QueueItem>> {
        let value = match conflict.resolution {
            None => {
                return Err(Error::InvalidInput(format!(
                    "conflict {} has no resolution yet",
                    conflict.id
                )))
            }
            Some(ConflictResolution::ServerWins) => Value::Object(conflict.server_data.clone()),
            Some(ConflictResolution::ClientWins) => {
                self.write_resolution(conflict, &conflict.client_data).await?
            }
            Some(ConflictResolution::Merged) => {
                let data = conflict.resolved_data.as_ref().ok_or_else(|| {
                    Error::InvalidInput(format!("merged conflict {} has no data", conflict.id))
                })?;
                self.write_resolution(conflict, data).await?
            }
        };

        let completed = self.store.finish_resolution(&conflict.id, &value).await?;
        tracing::info!(
            conflict = %conflict.id,
            resolution = ?conflict.resolution,
            completed = completed.is_some(),
            "Conflict resolution applied"
        );
        Ok(completed)
    }

    /// Send `data` as an authoritative write of the conflicted record.
    async fn write_resolution(&self, conflict: &SyncConflict, data: &Record) -> Result<Value> {
        let item = self
            .store
            .get_item(&conflict.queue_item_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue item {}", conflict.queue_item_id)))?;

        let request = RemoteRequest {
            idempotency_key: format!("{}:resolve:{}", item.optimistic_id, conflict.id),
            mutation: Mutation::RecordUpdate {
                table: conflict.table_name.clone(),
                id: conflict.record_id.clone(),
                base: conflict.server_data.clone(),
                changes: resolver::authoritative_changes(
                    data,
                    &conflict.server_data,
                    &self.store.config().ignored_fields,
                ),
            },
        };
        let response = self.remote.apply(&request).await?;
        if response.idempotency_key != request.idempotency_key {
            return Err(Error::Sync(format!(
                "resolution response attributed to '{}'",
                response.idempotency_key
            )));
        }

        let row = response
            .rows
            .into_iter()
            .find(|row| record_id(row) == Some(conflict.record_id.as_str()))
            .unwrap_or_else(|| data.clone());
        Ok(Value::Object(row))
    }
}

async fn follow(mut receiver: watch::Receiver<SharedOutcome>) -> Result<SyncReport> {
    let outcome = match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.as_ref().cloned(),
        Err(_) => None,
    };

    match outcome {
        Some(Ok(report)) => Ok(report),
        Some(Err(message)) => Err(Error::Sync(message)),
        None => Err(Error::Sync("in-flight sync was cancelled".to_string())),
    }
}

/// What the cache should hold for each entity once the item is confirmed.
///
/// Records the server did not echo fall back to the client's snapshot.
fn server_values(mutation: &Mutation, rows: &[Record]) -> Vec<(EntityKey, Value)> {
    if let Mutation::RecordDelete { table, id } = mutation {
        return vec![(EntityKey::new(table, id), Value::Null)];
    }

    mutation
        .client_snapshots()
        .into_iter()
        .map(|(entity, client)| {
            let row = rows
                .iter()
                .find(|row| record_id(row) == Some(entity.id.as_str()))
                .cloned()
                .unwrap_or(client);
            (entity, Value::Object(row))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn server_values_prefer_echoed_rows() {
        let mutation = Mutation::BulkInsert {
            table: "harvests".into(),
            records: vec![
                record(json!({"id": "h-1", "kg": 10})),
                record(json!({"id": "h-2", "kg": 12})),
            ],
        };
        let rows = vec![record(json!({"id": "h-2", "kg": 12, "updated_at": 9}))];

        assert_eq!(
            server_values(&mutation, &rows),
            vec![
                (EntityKey::new("harvests", "h-1"), json!({"id": "h-1", "kg": 10})),
                (
                    EntityKey::new("harvests", "h-2"),
                    json!({"id": "h-2", "kg": 12, "updated_at": 9})
                ),
            ]
        );
    }

    #[test]
    fn server_values_for_delete_is_tombstone() {
        let mutation = Mutation::RecordDelete {
            table: "expenses".into(),
            id: "e-1".into(),
        };
        assert_eq!(
            server_values(&mutation, &[]),
            vec![(EntityKey::new("expenses", "e-1"), Value::Null)]
        );
    }

    #[tokio::test]
    async fn follower_sees_cancelled_leader() {
        let (sender, receiver) = watch::channel::<SharedOutcome>(None);
        drop(sender);
        let err = follow(receiver).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn follower_receives_published_report() {
        let (sender, receiver) = watch::channel::<SharedOutcome>(None);
        let report = SyncReport {
            processed: 2,
            completed: 2,
            ..SyncReport::default()
        };
        sender.send_replace(Some(Ok(report.clone())));
        drop(sender);

        assert_eq!(follow(receiver).await.unwrap(), report);
    }
}
