//! furrow-core - Offline-first record sync for Furrow
//!
//! This crate holds the durable mutation queue, the local record cache,
//! conflict bookkeeping, per-table sync checkpoints, and the engine that
//! replays queued mutations against a remote store. Every write lands in
//! one local libSQL database so the queue and the cache never disagree.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use config::{CachePolicy, ConfigError, ConflictPolicy, SyncConfig};
pub use error::{Error, Result};
pub use models::{
    CacheEntry, CacheKey, ConflictResolution, EntityKey, Mutation, QueueItem, QueueItemInput,
    QueueStatus, Record, SyncCheckpoint, SyncConflict,
};
pub use services::SyncStore;
pub use state::SyncState;
pub use sync::{HttpRemoteStore, MemoryRemoteStore, RemoteStore, SyncEngine, SyncReport};
