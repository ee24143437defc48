//! In-process remote store.
//!
//! Behaves like a minimal row store with an idempotency ledger. Clones share
//! state, so a test can keep a handle while the engine owns another.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;

use super::remote::{RemoteError, RemoteRequest, RemoteResponse, RemoteResult, RemoteStore};
use crate::models::{record_id, FailureKind, Mutation, Record, ID_FIELD};
use crate::util::now_ms;

#[derive(Debug)]
struct State {
    online: bool,
    latency: Duration,
    tables: BTreeMap<String, BTreeMap<String, Record>>,
    ledger: HashMap<String, RemoteResponse>,
    failures: HashMap<String, VecDeque<FailureKind>>,
    /// Every key received, in arrival order
    received: Vec<String>,
    /// Keys that changed server state
    applied: Vec<String>,
    clock: i64,
}

#[derive(Debug, Clone)]
pub struct MemoryRemoteStore {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                online: true,
                latency: Duration::ZERO,
                tables: BTreeMap::new(),
                ledger: HashMap::new(),
                failures: HashMap::new(),
                received: Vec::new(),
                applied: Vec::new(),
                clock: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Delay every `apply` call, so overlapping callers can be observed
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Write a row directly, as another client would.
    pub fn seed(&self, table: &str, row: Record) {
        if let Some(id) = record_id(&row).map(str::to_string) {
            self.lock()
                .tables
                .entry(table.to_string())
                .or_default()
                .insert(id, row);
        }
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Record> {
        self.lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// Fail the next call carrying `idempotency_key` with the given kind.
    pub fn fail_next(&self, idempotency_key: &str, kind: FailureKind) {
        self.lock()
            .failures
            .entry(idempotency_key.to_string())
            .or_default()
            .push_back(kind);
    }

    /// Keys received so far, including replays and failed calls
    pub fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    /// Keys that produced a server-side change
    pub fn applied(&self) -> Vec<String> {
        self.lock().applied.clone()
    }

    fn apply_locked(state: &mut State, request: &RemoteRequest) -> RemoteResult<RemoteResponse> {
        if let Some(kind) = state
            .failures
            .get_mut(&request.idempotency_key)
            .and_then(VecDeque::pop_front)
        {
            return Err(match kind {
                FailureKind::Transient => RemoteError::Transient("injected failure".to_string()),
                FailureKind::Fatal => RemoteError::Rejected("injected rejection".to_string()),
            });
        }

        if let Some(response) = state.ledger.get(&request.idempotency_key) {
            return Ok(response.clone());
        }

        state.clock = now_ms().max(state.clock + 1);
        let stamp = Value::from(state.clock);
        let table = state
            .tables
            .entry(request.mutation.table().to_string())
            .or_default();

        let rows = match &request.mutation {
            Mutation::RecordCreate { id, record, .. } => {
                vec![insert_if_absent(table, id, record, &stamp)]
            }
            Mutation::RecordUpdate { id, changes, .. } => {
                let row = table
                    .get_mut(id)
                    .ok_or_else(|| RemoteError::Rejected(format!("record {id} does not exist")))?;
                for (field, value) in changes {
                    row.insert(field.clone(), value.clone());
                }
                row.insert("updated_at".to_string(), stamp);
                vec![row.clone()]
            }
            Mutation::RecordDelete { id, .. } => {
                table.remove(id);
                Vec::new()
            }
            Mutation::BulkInsert { records, .. } => records
                .iter()
                .filter_map(|record| {
                    let id = record_id(record)?.to_string();
                    Some(insert_if_absent(table, &id, record, &stamp))
                })
                .collect(),
        };

        let response = RemoteResponse {
            idempotency_key: request.idempotency_key.clone(),
            rows,
        };
        state
            .ledger
            .insert(request.idempotency_key.clone(), response.clone());
        state.applied.push(request.idempotency_key.clone());
        Ok(response)
    }
}

/// Insert `record` unless a row already exists; returns the stored row.
fn insert_if_absent(
    table: &mut BTreeMap<String, Record>,
    id: &str,
    record: &Record,
    stamp: &Value,
) -> Record {
    table
        .entry(id.to_string())
        .or_insert_with(|| {
            let mut row = record.clone();
            row.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
            row.entry("created_at").or_insert_with(|| stamp.clone());
            row.insert("updated_at".to_string(), stamp.clone());
            row
        })
        .clone()
}

impl RemoteStore for MemoryRemoteStore {
    async fn is_reachable(&self) -> bool {
        self.lock().online
    }

    async fn apply(&self, request: &RemoteRequest) -> RemoteResult<RemoteResponse> {
        let latency = {
            let mut state = self.lock();
            state.received.push(request.idempotency_key.clone());
            if !state.online {
                return Err(RemoteError::Transient("remote store offline".to_string()));
            }
            state.latency
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        Self::apply_locked(&mut state, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn create(key: &str, id: &str, amount: i64) -> RemoteRequest {
        RemoteRequest {
            idempotency_key: key.to_string(),
            mutation: Mutation::RecordCreate {
                table: "expenses".into(),
                id: id.into(),
                record: record(json!({"amount": amount})),
            },
        }
    }

    #[tokio::test]
    async fn replay_with_same_key_has_one_effect() {
        let remote = MemoryRemoteStore::new();
        let first = remote.apply(&create("opt-1", "e-1", 100)).await.unwrap();
        let replay = remote.apply(&create("opt-1", "e-1", 100)).await.unwrap();

        assert_eq!(first, replay);
        assert_eq!(remote.applied(), vec!["opt-1"]);
        assert_eq!(remote.received().len(), 2);
        assert_eq!(remote.row("expenses", "e-1").unwrap()["amount"], json!(100));
    }

    #[tokio::test]
    async fn update_of_missing_row_is_rejected() {
        let remote = MemoryRemoteStore::new();
        let request = RemoteRequest {
            idempotency_key: "opt-1".into(),
            mutation: Mutation::RecordUpdate {
                table: "expenses".into(),
                id: "nope".into(),
                base: Record::new(),
                changes: record(json!({"amount": 1})),
            },
        };

        let err = remote.apply(&request).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn offline_and_injected_failures() {
        let remote = MemoryRemoteStore::new();
        remote.set_online(false);
        assert!(!remote.is_reachable().await);
        assert!(remote
            .apply(&create("opt-1", "e-1", 1))
            .await
            .unwrap_err()
            .is_transient());

        remote.set_online(true);
        remote.fail_next("opt-1", FailureKind::Fatal);
        assert!(!remote
            .apply(&create("opt-1", "e-1", 1))
            .await
            .unwrap_err()
            .is_transient());
        assert!(remote.apply(&create("opt-1", "e-1", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn create_over_existing_row_returns_server_copy() {
        let remote = MemoryRemoteStore::new();
        remote.seed("expenses", record(json!({"id": "e-1", "amount": 5})));

        let response = remote.apply(&create("opt-1", "e-1", 100)).await.unwrap();
        assert_eq!(response.rows[0]["amount"], json!(5));
    }
}
