//! Sync checkpoint repository implementation

use libsql::{params, Connection, Row};

use super::rows;
use crate::error::Result;
use crate::models::SyncCheckpoint;

/// Trait for checkpoint storage operations (async)
#[allow(async_fn_in_trait)]
pub trait CheckpointRepository {
    async fn get(&self, scope_id: &str, table_name: &str) -> Result<Option<SyncCheckpoint>>;

    /// All checkpoints of a scope, ordered by table name
    async fn list(&self, scope_id: &str) -> Result<Vec<SyncCheckpoint>>;

    /// Record `records_synced` (the running tally of the current pass) and
    /// move `last_sync_at` forward to `at`
    ///
    /// `last_sync_at` never moves backwards, even if `at` is older.
    async fn advance(
        &self,
        scope_id: &str,
        table_name: &str,
        records_synced: i64,
        at: i64,
    ) -> Result<SyncCheckpoint>;
}

/// libSQL implementation of `CheckpointRepository`
pub struct LibSqlCheckpointRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlCheckpointRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_checkpoint(row: &Row) -> Result<SyncCheckpoint> {
        Ok(SyncCheckpoint {
            scope_id: rows::text(row, 0)?,
            table_name: rows::text(row, 1)?,
            last_sync_at: rows::integer(row, 2)?,
            records_synced: rows::integer(row, 3)?,
        })
    }
}

impl CheckpointRepository for LibSqlCheckpointRepository<'_> {
    async fn get(&self, scope_id: &str, table_name: &str) -> Result<Option<SyncCheckpoint>> {
        let mut result = self
            .conn
            .query(
                "SELECT scope_id, table_name, last_sync_at, records_synced
                 FROM sync_checkpoints WHERE scope_id = ? AND table_name = ?",
                [scope_id, table_name],
            )
            .await?;

        match result.next().await? {
            Some(row) => Ok(Some(Self::parse_checkpoint(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, scope_id: &str) -> Result<Vec<SyncCheckpoint>> {
        let mut result = self
            .conn
            .query(
                "SELECT scope_id, table_name, last_sync_at, records_synced
                 FROM sync_checkpoints WHERE scope_id = ? ORDER BY table_name ASC",
                [scope_id],
            )
            .await?;

        let mut checkpoints = Vec::new();
        while let Some(row) = result.next().await? {
            checkpoints.push(Self::parse_checkpoint(&row)?);
        }
        Ok(checkpoints)
    }

    async fn advance(
        &self,
        scope_id: &str,
        table_name: &str,
        records_synced: i64,
        at: i64,
    ) -> Result<SyncCheckpoint> {
        self.conn
            .execute(
                "INSERT INTO sync_checkpoints (scope_id, table_name, last_sync_at, records_synced)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (scope_id, table_name) DO UPDATE SET
                    last_sync_at = MAX(last_sync_at, excluded.last_sync_at),
                    records_synced = excluded.records_synced",
                params![scope_id, table_name, at, records_synced.max(0)],
            )
            .await?;

        tracing::debug!(scope = scope_id, table = table_name, records_synced, "Checkpoint advanced");
        self.get(scope_id, table_name).await?.ok_or_else(|| {
            crate::Error::Database(format!("checkpoint {scope_id}/{table_name} vanished"))
        })
    }
}
