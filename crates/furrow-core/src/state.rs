//! Observable sync health.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse sync state published to collaborators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No pass has run yet
    #[default]
    Idle,
    /// Remote store unreachable at the last attempt
    Offline,
    Syncing,
    /// Last pass finished without failures
    Synced,
    /// Last pass failed or left failed items behind
    Error,
}

impl SyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
