//! Sync conflict model

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{EntityKey, Record};

/// Policy chosen to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Re-apply the client snapshot as an authoritative write
    ClientWins,
    /// Adopt the server snapshot and drop the client's intent
    ServerWins,
    /// Write a per-field merge of both snapshots
    Merged,
}

impl ConflictResolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientWins => "client_wins",
            Self::ServerWins => "server_wins",
            Self::Merged => "merged",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client_wins" => Ok(Self::ClientWins),
            "server_wins" => Ok(Self::ServerWins),
            "merged" => Ok(Self::Merged),
            other => Err(format!("unknown conflict resolution: {other}")),
        }
    }
}

/// Per-field update timestamps for one snapshot (Unix ms).
///
/// Fields without an explicit stamp fall back to `default`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStamps {
    pub default: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, i64>,
}

impl FieldStamps {
    /// Every field shares one timestamp.
    pub const fn uniform(at: i64) -> Self {
        Self {
            default: at,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>, at: i64) -> Self {
        self.fields.insert(field.into(), at);
        self
    }

    pub fn stamp(&self, field: &str) -> i64 {
        self.fields.get(field).copied().unwrap_or(self.default)
    }
}

/// A disagreement between what the client assumed and what the server holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    /// Queue item blocked by this conflict
    pub queue_item_id: String,
    pub scope_id: String,
    pub table_name: String,
    pub record_id: String,
    pub client_data: Record,
    pub server_data: Record,
    pub client_stamps: FieldStamps,
    pub server_stamps: FieldStamps,
    /// Detection timestamp (Unix ms)
    pub created_at: i64,
    /// Set once; unresolved while `None`
    pub resolution: Option<ConflictResolution>,
    /// Present only for `Merged`
    pub resolved_data: Option<Record>,
    pub resolved_at: Option<i64>,
    /// When the resolution reached the remote store and cache
    pub applied_at: Option<i64>,
}

impl SyncConflict {
    pub const fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub const fn is_applied(&self) -> bool {
        self.applied_at.is_some()
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(&self.table_name, &self.record_id)
    }
}
