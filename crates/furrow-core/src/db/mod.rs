//! Database layer for Furrow

mod cache_repository;
mod checkpoint_repository;
mod conflict_repository;
mod connection;
mod migrations;
mod queue_repository;
mod rows;

pub use cache_repository::{CacheRepository, LibSqlCacheRepository};
pub use checkpoint_repository::{CheckpointRepository, LibSqlCheckpointRepository};
pub use conflict_repository::{ConflictRepository, LibSqlConflictRepository};
pub(crate) use connection::{begin, finish};
pub use connection::Database;
pub use queue_repository::{LibSqlQueueRepository, QueueRepository};
