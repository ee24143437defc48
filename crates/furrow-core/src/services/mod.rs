//! Shared service layer.

mod sync_store;

pub use sync_store::SyncStore;
