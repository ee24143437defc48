//! Sync checkpoint model

use serde::{Deserialize, Serialize};

/// Per-table sync progress marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub scope_id: String,
    pub table_name: String,
    /// Last successful sync (Unix ms); never decreases
    pub last_sync_at: i64,
    /// Records synced for this table in the most recent successful pass
    pub records_synced: i64,
}
