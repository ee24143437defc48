//! Replaying queued mutations against the remote store.

mod engine;
mod http;
mod memory;
mod remote;
pub mod resolver;

pub use engine::{SkipReason, SyncEngine, SyncReport, SyncStatus};
pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;
pub use remote::{RemoteError, RemoteRequest, RemoteResponse, RemoteResult, RemoteStore};
