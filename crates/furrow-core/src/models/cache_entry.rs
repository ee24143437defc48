//! Local cache entry model

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::EntityKey;

/// Scoped cache key: a whole collection, or one record within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub scope_id: String,
    pub collection: String,
    pub id: Option<String>,
}

impl CacheKey {
    pub fn collection(scope_id: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            scope_id: scope_id.into(),
            collection: collection.into(),
            id: None,
        }
    }

    pub fn record(
        scope_id: impl Into<String>,
        collection: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            scope_id: scope_id.into(),
            collection: collection.into(),
            id: Some(id.into()),
        }
    }

    pub fn for_entity(scope_id: impl Into<String>, entity: &EntityKey) -> Self {
        Self::record(scope_id, &entity.table, &entity.id)
    }

    /// Stored form of the id column; collection-level entries use an empty id.
    pub(crate) fn id_column(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}/{}", self.scope_id, self.collection, id),
            None => write!(f, "{}:{}", self.scope_id, self.collection),
        }
    }
}

/// Last-known-good copy of a remote collection or record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Cached value; `null` marks an optimistic delete
    pub data: Value,
    /// Last write (Unix ms)
    pub last_updated: i64,
    /// Set while the value is an unconfirmed optimistic write
    pub optimistic_id: Option<String>,
    /// Within the collection's TTL at read time
    pub is_fresh: bool,
}

impl CacheEntry {
    pub const fn is_optimistic(&self) -> bool {
        self.optimistic_id.is_some()
    }

    pub fn is_tombstone(&self) -> bool {
        self.data.is_null()
    }
}

/// Cache freshness summary for one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCacheStats {
    pub collection: String,
    pub entries: usize,
    pub fresh: usize,
    pub optimistic: usize,
    /// Most recent write in the collection (Unix ms)
    pub last_updated: Option<i64>,
}

/// Cache diagnostics for one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub scope_id: String,
    pub entries: usize,
    pub fresh: usize,
    pub stale: usize,
    pub optimistic: usize,
    pub collections: Vec<CollectionCacheStats>,
}
