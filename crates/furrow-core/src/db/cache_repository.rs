//! Local cache repository and optimistic write ledger
//!
//! Every optimistic write records the value it replaced in `optimistic_writes`.
//! Confirming or rolling back a write consumes its ledger row, so each write is
//! reconciled exactly once. When several writes are stacked on one key, only
//! the newest owns the visible value; older writes hand their outcome to the
//! next-newer row's `previous_data` instead of touching the cache entry.
//!
//! Callers wrap multi-step changes in a transaction (see `connection::begin`).

#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;

use libsql::{params, Connection, Row};
use serde_json::Value;

use super::rows;
use crate::config::CachePolicy;
use crate::error::Result;
use crate::models::{CacheEntry, CacheKey, CacheStats, CollectionCacheStats};
use crate::util::now_ms;

const COLUMNS: &str = "scope_id, collection, record_id, data, last_updated, optimistic_id";

/// Trait for local cache operations (async)
#[allow(async_fn_in_trait)]
pub trait CacheRepository {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Record-level entries of one collection, ordered by id
    async fn list_collection(&self, scope_id: &str, collection: &str) -> Result<Vec<CacheEntry>>;

    /// Store a last-known-good server value
    ///
    /// If the key carries unconfirmed optimistic writes, the visible value is
    /// kept and the server value becomes the baseline a rollback restores.
    async fn put(&self, key: &CacheKey, data: &Value) -> Result<()>;

    /// Drop a record entry, or a whole collection when the key has no id
    ///
    /// Entries holding an unconfirmed optimistic write are left in place.
    async fn invalidate(&self, key: &CacheKey) -> Result<usize>;

    /// Drop every entry in `scope_id` matching `predicate`, optimistic ones excepted
    async fn invalidate_where<F>(&self, scope_id: &str, predicate: F) -> Result<usize>
    where
        F: Fn(&CacheEntry) -> bool;

    async fn stats(&self, scope_id: &str) -> Result<CacheStats>;

    /// Apply an optimistic write; `Value::Null` marks a delete.
    ///
    /// Returns `false` when this write was already recorded.
    async fn apply_optimistic(&self, key: &CacheKey, optimistic_id: &str, data: &Value)
        -> Result<bool>;

    /// Replace an optimistic write with the server's value; `Value::Null` confirms a delete.
    ///
    /// Returns `false` when the write was already reconciled.
    async fn confirm_optimistic(
        &self,
        key: &CacheKey,
        optimistic_id: &str,
        server: &Value,
    ) -> Result<bool>;

    /// Undo an optimistic write, restoring what it replaced.
    ///
    /// Returns `false` when the write was already reconciled.
    async fn rollback_optimistic(&self, key: &CacheKey, optimistic_id: &str) -> Result<bool>;

    /// Keys still carrying an unreconciled write for `optimistic_id`
    async fn optimistic_keys(&self, optimistic_id: &str) -> Result<Vec<CacheKey>>;
}

/// One row of the optimistic write ledger
struct LedgerRow {
    seq: i64,
    optimistic_id: String,
    /// `None` when the key had no entry before the write
    previous: Option<Value>,
}

/// libSQL implementation of `CacheRepository`
pub struct LibSqlCacheRepository<'a> {
    conn: &'a Connection,
    policy: &'a CachePolicy,
}

impl<'a> LibSqlCacheRepository<'a> {
    /// Create a new repository; freshness is judged against `policy`
    pub const fn new(conn: &'a Connection, policy: &'a CachePolicy) -> Self {
        Self { conn, policy }
    }

    fn parse_entry(&self, row: &Row, now: i64) -> Result<CacheEntry> {
        let record_id = rows::text(row, 2)?;
        let key = CacheKey {
            scope_id: rows::text(row, 0)?,
            collection: rows::text(row, 1)?,
            id: (!record_id.is_empty()).then_some(record_id),
        };
        let last_updated = rows::integer(row, 4)?;

        Ok(CacheEntry {
            is_fresh: self.policy.is_fresh(&key.collection, last_updated, now),
            data: rows::json(row, 3)?,
            last_updated,
            optimistic_id: rows::optional_text(row, 5)?,
            key,
        })
    }

    async fn query_entries(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<CacheEntry>> {
        let now = now_ms();
        let mut result = self.conn.query(sql, params).await?;
        let mut entries = Vec::new();
        while let Some(row) = result.next().await? {
            entries.push(self.parse_entry(&row, now)?);
        }
        Ok(entries)
    }

    async fn scope_entries(&self, scope_id: &str) -> Result<Vec<CacheEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM cache_entries WHERE scope_id = ?
             ORDER BY collection ASC, record_id ASC"
        );
        self.query_entries(&sql, [scope_id]).await
    }

    async fn write(&self, key: &CacheKey, data: &Value, optimistic_id: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO cache_entries (scope_id, collection, record_id, data, last_updated, optimistic_id)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (scope_id, collection, record_id) DO UPDATE SET
                    data = excluded.data,
                    last_updated = excluded.last_updated,
                    optimistic_id = excluded.optimistic_id",
                params![
                    key.scope_id.as_str(),
                    key.collection.as_str(),
                    key.id_column(),
                    rows::json_text(data)?,
                    now_ms(),
                    rows::nullable_text(optimistic_id)
                ],
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM cache_entries WHERE scope_id = ? AND collection = ? AND record_id = ?",
                params![key.scope_id.as_str(), key.collection.as_str(), key.id_column()],
            )
            .await?;
        Ok(changed as usize)
    }

    /// Put `value` back under `key`, or drop the entry when there is none
    async fn restore(&self, key: &CacheKey, value: Option<&Value>, marker: Option<&str>) -> Result<()> {
        match value {
            Some(value) => self.write(key, value, marker).await,
            None => self.remove(key).await.map(|_| ()),
        }
    }

    fn parse_ledger(row: &Row) -> Result<LedgerRow> {
        Ok(LedgerRow {
            seq: rows::integer(row, 0)?,
            optimistic_id: rows::text(row, 1)?,
            previous: rows::optional_json(row, 2)?,
        })
    }

    async fn ledger_query(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<LedgerRow>> {
        let mut result = self.conn.query(sql, params).await?;
        match result.next().await? {
            Some(row) => Ok(Some(Self::parse_ledger(&row)?)),
            None => Ok(None),
        }
    }

    async fn ledger_row(&self, key: &CacheKey, optimistic_id: &str) -> Result<Option<LedgerRow>> {
        self.ledger_query(
            "SELECT seq, optimistic_id, previous_data FROM optimistic_writes
             WHERE optimistic_id = ? AND scope_id = ? AND collection = ? AND record_id = ?",
            params![
                optimistic_id,
                key.scope_id.as_str(),
                key.collection.as_str(),
                key.id_column()
            ],
        )
        .await
    }

    /// Closest ledger row stacked above (`newer`) or below `seq` on the same key
    async fn neighbour(&self, key: &CacheKey, seq: i64, newer: bool) -> Result<Option<LedgerRow>> {
        let sql = if newer {
            "SELECT seq, optimistic_id, previous_data FROM optimistic_writes
             WHERE scope_id = ? AND collection = ? AND record_id = ? AND seq > ?
             ORDER BY seq ASC LIMIT 1"
        } else {
            "SELECT seq, optimistic_id, previous_data FROM optimistic_writes
             WHERE scope_id = ? AND collection = ? AND record_id = ? AND seq < ?
             ORDER BY seq DESC LIMIT 1"
        };
        self.ledger_query(
            sql,
            params![
                key.scope_id.as_str(),
                key.collection.as_str(),
                key.id_column(),
                seq
            ],
        )
        .await
    }

    async fn set_previous(&self, seq: i64, previous: Option<&Value>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE optimistic_writes SET previous_data = ? WHERE seq = ?",
                params![rows::nullable_json(previous)?, seq],
            )
            .await?;
        Ok(())
    }

    async fn delete_ledger(&self, seq: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM optimistic_writes WHERE seq = ?", [seq])
            .await?;
        Ok(())
    }

    async fn has_optimistic(&self, key: &CacheKey) -> Result<bool> {
        let mut result = self
            .conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM optimistic_writes
                 WHERE scope_id = ? AND collection = ? AND record_id = ?)",
                params![key.scope_id.as_str(), key.collection.as_str(), key.id_column()],
            )
            .await?;
        match result.next().await? {
            Some(row) => Ok(rows::integer(&row, 0)? != 0),
            None => Ok(false),
        }
    }
}

impl CacheRepository for LibSqlCacheRepository<'_> {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM cache_entries
             WHERE scope_id = ? AND collection = ? AND record_id = ?"
        );
        let entries = self
            .query_entries(
                &sql,
                params![key.scope_id.as_str(), key.collection.as_str(), key.id_column()],
            )
            .await?;
        Ok(entries.into_iter().next())
    }

    async fn list_collection(&self, scope_id: &str, collection: &str) -> Result<Vec<CacheEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM cache_entries
             WHERE scope_id = ? AND collection = ? AND record_id != ''
             ORDER BY record_id ASC"
        );
        self.query_entries(&sql, [scope_id, collection]).await
    }

    async fn put(&self, key: &CacheKey, data: &Value) -> Result<()> {
        let oldest = self
            .ledger_query(
                "SELECT seq, optimistic_id, previous_data FROM optimistic_writes
                 WHERE scope_id = ? AND collection = ? AND record_id = ?
                 ORDER BY seq ASC LIMIT 1",
                params![key.scope_id.as_str(), key.collection.as_str(), key.id_column()],
            )
            .await?;

        match oldest {
            Some(row) => {
                tracing::debug!(key = %key, "Server value queued behind optimistic write");
                self.set_previous(row.seq, Some(data)).await
            }
            None => self.write(key, data, None).await,
        }
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<usize> {
        let changed = if key.id.is_some() {
            if self.has_optimistic(key).await? {
                0
            } else {
                self.remove(key).await?
            }
        } else {
            self.conn
                .execute(
                    "DELETE FROM cache_entries
                     WHERE scope_id = ? AND collection = ? AND optimistic_id IS NULL
                       AND NOT EXISTS (
                           SELECT 1 FROM optimistic_writes w
                           WHERE w.scope_id = cache_entries.scope_id
                             AND w.collection = cache_entries.collection
                             AND w.record_id = cache_entries.record_id
                       )",
                    [key.scope_id.as_str(), key.collection.as_str()],
                )
                .await? as usize
        };

        tracing::debug!(key = %key, removed = changed, "Cache invalidated");
        Ok(changed)
    }

    async fn invalidate_where<F>(&self, scope_id: &str, predicate: F) -> Result<usize>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let mut removed = 0;
        for entry in self.scope_entries(scope_id).await? {
            if entry.is_optimistic() || !predicate(&entry) {
                continue;
            }
            if self.has_optimistic(&entry.key).await? {
                continue;
            }
            removed += self.remove(&entry.key).await?;
        }
        Ok(removed)
    }

    async fn stats(&self, scope_id: &str) -> Result<CacheStats> {
        let mut stats = CacheStats {
            scope_id: scope_id.to_string(),
            ..CacheStats::default()
        };
        let mut collections: BTreeMap<String, CollectionCacheStats> = BTreeMap::new();

        for entry in self.scope_entries(scope_id).await? {
            stats.entries += 1;
            if entry.is_fresh {
                stats.fresh += 1;
            } else {
                stats.stale += 1;
            }
            if entry.is_optimistic() {
                stats.optimistic += 1;
            }

            let collection = collections
                .entry(entry.key.collection.clone())
                .or_insert_with(|| CollectionCacheStats {
                    collection: entry.key.collection.clone(),
                    ..CollectionCacheStats::default()
                });
            collection.entries += 1;
            collection.fresh += usize::from(entry.is_fresh);
            collection.optimistic += usize::from(entry.is_optimistic());
            collection.last_updated = collection.last_updated.max(Some(entry.last_updated));
        }

        stats.collections = collections.into_values().collect();
        Ok(stats)
    }

    async fn apply_optimistic(
        &self,
        key: &CacheKey,
        optimistic_id: &str,
        data: &Value,
    ) -> Result<bool> {
        if self.ledger_row(key, optimistic_id).await?.is_some() {
            return Ok(false);
        }

        let previous = self.get(key).await?.map(|entry| entry.data);
        self.conn
            .execute(
                "INSERT INTO optimistic_writes
                    (optimistic_id, scope_id, collection, record_id, previous_data, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    optimistic_id,
                    key.scope_id.as_str(),
                    key.collection.as_str(),
                    key.id_column(),
                    rows::nullable_json(previous.as_ref())?,
                    now_ms()
                ],
            )
            .await?;
        self.write(key, data, Some(optimistic_id)).await?;

        tracing::debug!(key = %key, optimistic_id, "Optimistic write applied");
        Ok(true)
    }

    async fn confirm_optimistic(
        &self,
        key: &CacheKey,
        optimistic_id: &str,
        server: &Value,
    ) -> Result<bool> {
        let Some(row) = self.ledger_row(key, optimistic_id).await? else {
            return Ok(false);
        };
        let server = (!server.is_null()).then_some(server);

        if let Some(newer) = self.neighbour(key, row.seq, true).await? {
            // A newer write still owns the visible value
            self.set_previous(newer.seq, server).await?;
        } else {
            let older = self.neighbour(key, row.seq, false).await?;
            let marker = older.as_ref().map(|older| older.optimistic_id.as_str());
            self.restore(key, server, marker).await?;
        }
        self.delete_ledger(row.seq).await?;

        tracing::debug!(key = %key, optimistic_id, "Optimistic write confirmed");
        Ok(true)
    }

    async fn rollback_optimistic(&self, key: &CacheKey, optimistic_id: &str) -> Result<bool> {
        let Some(row) = self.ledger_row(key, optimistic_id).await? else {
            return Ok(false);
        };

        if let Some(newer) = self.neighbour(key, row.seq, true).await? {
            self.set_previous(newer.seq, row.previous.as_ref()).await?;
        } else {
            let older = self.neighbour(key, row.seq, false).await?;
            let marker = older.as_ref().map(|older| older.optimistic_id.as_str());
            self.restore(key, row.previous.as_ref(), marker).await?;
        }
        self.delete_ledger(row.seq).await?;

        tracing::debug!(key = %key, optimistic_id, "Optimistic write rolled back");
        Ok(true)
    }

    async fn optimistic_keys(&self, optimistic_id: &str) -> Result<Vec<CacheKey>> {
        let mut result = self
            .conn
            .query(
                "SELECT scope_id, collection, record_id FROM optimistic_writes
                 WHERE optimistic_id = ? ORDER BY seq ASC",
                [optimistic_id],
            )
            .await?;

        let mut keys = Vec::new();
        while let Some(row) = result.next().await? {
            let record_id = rows::text(&row, 2)?;
            keys.push(CacheKey {
                scope_id: rows::text(&row, 0)?,
                collection: rows::text(&row, 1)?,
                id: (!record_id.is_empty()).then_some(record_id),
            });
        }
        Ok(keys)
    }
}
