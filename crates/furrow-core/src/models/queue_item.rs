//! Queue item model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Mutation;

/// Lifecycle state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for the next sync pass
    Pending,
    /// Remote call in flight
    Processing,
    /// Blocked on an unresolved conflict
    AwaitingConfirmation,
    /// Last attempt failed; see `failure_kind`
    Failed,
    /// Applied remotely; terminal
    Completed,
}

impl QueueStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Processing,
        Self::AwaitingConfirmation,
        Self::Failed,
        Self::Completed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Processing -> Pending` only happens when recovering items orphaned by
    /// a crash mid-pass.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (
                    Self::Processing,
                    Self::Completed | Self::Failed | Self::AwaitingConfirmation | Self::Pending
                )
                | (Self::Failed, Self::Pending)
                | (Self::AwaitingConfirmation, Self::Completed)
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown queue status: {s}"))
    }
}

/// Why a failed item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network or timeout; retried on the next pass
    Transient,
    /// Permanently rejected by the remote; waits for an explicit retry
    Fatal,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "fatal" => Ok(Self::Fatal),
            other => Err(format!("unknown failure kind: {other}")),
        }
    }
}

/// Caller-supplied description of a new queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItemInput {
    /// Human-meaningful debugging key; generated when absent
    pub id: Option<String>,
    /// Idempotency token; generated when absent, reuse it for retries of the same change
    pub optimistic_id: Option<String>,
    /// Tenant scope (e.g. farm) the change belongs to
    pub scope_id: String,
    pub mutation: Mutation,
    /// Creation timestamp (Unix ms); defaults to now
    pub created_at: Option<i64>,
}

impl QueueItemInput {
    pub fn new(scope_id: impl Into<String>, mutation: Mutation) -> Self {
        Self {
            id: None,
            optimistic_id: None,
            scope_id: scope_id.into(),
            mutation,
            created_at: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_optimistic_id(mut self, optimistic_id: impl Into<String>) -> Self {
        self.optimistic_id = Some(optimistic_id.into());
        self
    }

    #[must_use]
    pub const fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Fill generated fields, producing a pending item.
    pub fn into_item(self, now: i64) -> QueueItem {
        let kind = self.mutation.kind();
        let optimistic_id = self
            .optimistic_id
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let id = self.id.unwrap_or_else(|| {
            let short = optimistic_id.chars().rev().take(8).collect::<String>();
            format!("{kind}-{short}")
        });
        let created_at = self.created_at.unwrap_or(now);

        QueueItem {
            seq: 0,
            id,
            optimistic_id,
            scope_id: self.scope_id,
            mutation: self.mutation,
            created_at,
            status: QueueStatus::Pending,
            retry_count: 0,
            last_error: None,
            failure_kind: None,
            conflict_id: None,
            updated_at: now,
        }
    }
}

/// A persisted pending local change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Insertion sequence; tie-breaker for equal `created_at`
    pub seq: i64,
    pub id: String,
    pub optimistic_id: String,
    pub scope_id: String,
    pub mutation: Mutation,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    pub status: QueueStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// First conflict raised for this item, if any
    pub conflict_id: Option<String>,
    /// Last status change (Unix ms)
    pub updated_at: i64,
}

impl QueueItem {
    /// Whether an automatic sync pass should attempt this item.
    pub fn is_eligible_for_sync(&self) -> bool {
        match self.status {
            QueueStatus::Pending => true,
            QueueStatus::Failed => self.failure_kind != Some(FailureKind::Fatal),
            _ => false,
        }
    }
}

/// Queue counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub awaiting_confirmation: usize,
    pub failed: usize,
    pub completed: usize,
}

impl QueueCounts {
    pub fn add(&mut self, status: QueueStatus, count: usize) {
        match status {
            QueueStatus::Pending => self.pending += count,
            QueueStatus::Processing => self.processing += count,
            QueueStatus::AwaitingConfirmation => self.awaiting_confirmation += count,
            QueueStatus::Failed => self.failed += count,
            QueueStatus::Completed => self.completed += count,
        }
    }

    /// Items not yet completed.
    pub const fn outstanding(&self) -> usize {
        self.pending + self.processing + self.awaiting_confirmation + self.failed
    }
}
