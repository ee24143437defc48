//! Data models for Furrow

mod cache_entry;
mod checkpoint;
mod mutation;
mod queue_item;
mod sync_conflict;

pub use cache_entry::{CacheEntry, CacheKey, CacheStats, CollectionCacheStats};
pub use checkpoint::SyncCheckpoint;
pub use mutation::{record_id, EntityKey, Mutation, Record, ID_FIELD};
pub use queue_item::{FailureKind, QueueCounts, QueueItem, QueueItemInput, QueueStatus};
pub use sync_conflict::{ConflictResolution, FieldStamps, SyncConflict};
