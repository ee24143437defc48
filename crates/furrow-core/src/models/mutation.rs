//! Mutation model
//!
//! A mutation is the replayable description of one local change. Each variant
//! carries everything needed to rebuild the remote call without extra context.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A record snapshot: a JSON object keyed by column name.
pub type Record = Map<String, Value>;

/// Column holding a record's identity.
pub const ID_FIELD: &str = "id";

/// Identifies one remote entity (table + row id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub table: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

/// A queued local change, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mutation {
    /// Insert a single record
    RecordCreate {
        table: String,
        id: String,
        record: Record,
    },
    /// Change some fields of a record the client already knew about
    RecordUpdate {
        table: String,
        id: String,
        /// Snapshot the client assumed when the change was made
        #[serde(default)]
        base: Record,
        /// Fields written by this change
        changes: Record,
    },
    /// Remove a record
    RecordDelete { table: String, id: String },
    /// Insert many records in one call; every record carries its own `id`
    BulkInsert { table: String, records: Vec<Record> },
}

impl Mutation {
    /// Short kind tag, matching the serialized `type`.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RecordCreate { .. } => "record_create",
            Self::RecordUpdate { .. } => "record_update",
            Self::RecordDelete { .. } => "record_delete",
            Self::BulkInsert { .. } => "bulk_insert",
        }
    }

    /// Table (collection) this mutation writes to.
    pub fn table(&self) -> &str {
        match self {
            Self::RecordCreate { table, .. }
            | Self::RecordUpdate { table, .. }
            | Self::RecordDelete { table, .. }
            | Self::BulkInsert { table, .. } => table,
        }
    }

    /// Entities touched by this mutation, in payload order.
    pub fn entity_keys(&self) -> Vec<EntityKey> {
        match self {
            Self::RecordCreate { table, id, .. }
            | Self::RecordUpdate { table, id, .. }
            | Self::RecordDelete { table, id } => vec![EntityKey::new(table, id)],
            Self::BulkInsert { table, records } => records
                .iter()
                .filter_map(record_id)
                .map(|id| EntityKey::new(table, id))
                .collect(),
        }
    }

    /// Number of records this mutation syncs when it succeeds.
    pub fn record_count(&self) -> i64 {
        match self {
            Self::BulkInsert { records, .. } => i64::try_from(records.len()).unwrap_or(i64::MAX),
            _ => 1,
        }
    }

    /// Full snapshots the client expects the server to hold after this change.
    ///
    /// Deletes have no snapshot. Updates overlay `changes` on `base`.
    pub fn client_snapshots(&self) -> Vec<(EntityKey, Record)> {
        match self {
            Self::RecordCreate { table, id, record } => {
                vec![(EntityKey::new(table, id), with_id(record.clone(), id))]
            }
            Self::RecordUpdate {
                table,
                id,
                base,
                changes,
            } => {
                let mut snapshot = base.clone();
                for (field, value) in changes {
                    snapshot.insert(field.clone(), value.clone());
                }
                vec![(EntityKey::new(table, id), with_id(snapshot, id))]
            }
            Self::RecordDelete { .. } => Vec::new(),
            Self::BulkInsert { table, records } => records
                .iter()
                .filter_map(|record| {
                    record_id(record).map(|id| (EntityKey::new(table, id), record.clone()))
                })
                .collect(),
        }
    }

    /// The snapshot the client assumed before the change, if it had one.
    pub const fn base_snapshot(&self) -> Option<&Record> {
        match self {
            Self::RecordUpdate { base, .. } => Some(base),
            _ => None,
        }
    }

    /// Fields this mutation writes, or `None` when it writes whole records.
    pub fn changed_fields(&self) -> Option<BTreeSet<String>> {
        match self {
            Self::RecordUpdate { changes, .. } => Some(changes.keys().cloned().collect()),
            _ => None,
        }
    }

    /// Reject payloads that could never be replayed.
    pub fn validate(&self) -> Result<()> {
        if self.table().trim().is_empty() {
            return Err(Error::InvalidInput("mutation table must not be empty".into()));
        }

        match self {
            Self::RecordCreate { id, .. } | Self::RecordDelete { id, .. } => require_id(id),
            Self::RecordUpdate { id, changes, .. } => {
                require_id(id)?;
                if changes.is_empty() {
                    return Err(Error::InvalidInput(format!(
                        "update of {id} carries no changes"
                    )));
                }
                Ok(())
            }
            Self::BulkInsert { records, .. } => {
                if records.is_empty() {
                    return Err(Error::InvalidInput("bulk insert carries no records".into()));
                }
                let mut seen = BTreeSet::new();
                for (index, record) in records.iter().enumerate() {
                    let id = record_id(record).ok_or_else(|| {
                        Error::InvalidInput(format!("bulk record #{index} has no string id"))
                    })?;
                    if !seen.insert(id) {
                        return Err(Error::InvalidInput(format!(
                            "bulk insert repeats record id {id}"
                        )));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Read the string `id` of a record, if present.
pub fn record_id(record: &Record) -> Option<&str> {
    record
        .get(ID_FIELD)
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
}

fn with_id(mut record: Record, id: &str) -> Record {
    record
        .entry(ID_FIELD)
        .or_insert_with(|| Value::String(id.to_string()));
    record
}

fn require_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        Err(Error::InvalidInput("record id must not be empty".into()))
    } else {
        Ok(())
    }
}
