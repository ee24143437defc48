//! Remote store abstraction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Mutation, Record};

/// One replayable call against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Repeated sends with the same key must have a single effect
    pub idempotency_key: String,
    pub mutation: Mutation,
}

/// The remote store's answer to a `RemoteRequest`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    /// Echo of the request's key; a mismatch means the response is not ours
    pub idempotency_key: String,
    /// Server rows after the change, one per touched record (empty for deletes)
    #[serde(default)]
    pub rows: Vec<Record>,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network, timeout, or server-side trouble; worth retrying
    #[error("Remote store unavailable: {0}")]
    Transient(String),
    /// The remote permanently refused the payload
    #[error("Remote store rejected mutation: {0}")]
    Rejected(String),
    #[error("Remote HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl RemoteError {
    /// Whether a later attempt might succeed without changing the payload.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Rejected(_) => false,
            Self::Http(error) => !error.is_builder(),
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Opaque request/response API the sync engine replays mutations against.
#[allow(async_fn_in_trait)]
pub trait RemoteStore {
    /// Cheap reachability probe; `false` skips the whole pass
    async fn is_reachable(&self) -> bool;

    /// Apply one mutation, honouring `request.idempotency_key`
    async fn apply(&self, request: &RemoteRequest) -> RemoteResult<RemoteResponse>;
}
