//! Conflict store implementation

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use libsql::{params, Connection, Row};

use super::rows;
use crate::error::{Error, Result};
use crate::models::{ConflictResolution, Record, SyncConflict};

const COLUMNS: &str = "id, queue_item_id, scope_id, table_name, record_id, client_data, \
                       server_data, client_stamps, server_stamps, created_at, resolution, \
                       resolved_data, resolved_at, applied_at";

/// Trait for conflict storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ConflictRepository {
    async fn insert(&self, conflict: &SyncConflict) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<SyncConflict>>;

    /// Conflicts without a resolution, oldest first, optionally limited to one scope
    async fn list_unresolved(&self, scope_id: Option<&str>) -> Result<Vec<SyncConflict>>;

    async fn count_unresolved(&self, scope_id: Option<&str>) -> Result<usize>;

    /// Every conflict raised for a queue item
    async fn list_for_item(&self, queue_item_id: &str) -> Result<Vec<SyncConflict>>;

    /// Resolved conflicts whose resolution has not reached the remote store yet
    async fn list_pending_application(&self) -> Result<Vec<SyncConflict>>;

    /// Conflicts for a queue item that still need resolving or applying
    async fn count_open_for_item(&self, queue_item_id: &str) -> Result<usize>;

    /// Record a resolution once. Returns `false` if the conflict was already resolved.
    async fn resolve(
        &self,
        id: &str,
        resolution: ConflictResolution,
        resolved_data: Option<&Record>,
        resolved_at: i64,
    ) -> Result<bool>;

    async fn mark_applied(&self, id: &str, applied_at: i64) -> Result<()>;

    /// Drop every conflict raised for a queue item
    async fn delete_for_item(&self, queue_item_id: &str) -> Result<usize>;
}

/// libSQL implementation of `ConflictRepository`
pub struct LibSqlConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &Row) -> Result<SyncConflict> {
        Ok(SyncConflict {
            id: rows::text(row, 0)?,
            queue_item_id: rows::text(row, 1)?,
            scope_id: rows::text(row, 2)?,
            table_name: rows::text(row, 3)?,
            record_id: rows::text(row, 4)?,
            client_data: rows::json(row, 5)?,
            server_data: rows::json(row, 6)?,
            client_stamps: rows::json(row, 7)?,
            server_stamps: rows::json(row, 8)?,
            created_at: rows::integer(row, 9)?,
            resolution: rows::optional_parsed(row, 10)?,
            resolved_data: rows::optional_json(row, 11)?,
            resolved_at: rows::optional_integer(row, 12)?,
            applied_at: rows::optional_integer(row, 13)?,
        })
    }

    async fn query_conflicts(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<SyncConflict>> {
        let mut result = self.conn.query(sql, params).await?;
        let mut conflicts = Vec::new();
        while let Some(row) = result.next().await? {
            conflicts.push(Self::parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    async fn count(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<usize> {
        let mut result = self.conn.query(sql, params).await?;
        let count = match result.next().await? {
            Some(row) => rows::integer(&row, 0)?,
            None => 0,
        };
        Ok(count as usize)
    }
}

impl ConflictRepository for LibSqlConflictRepository<'_> {
    async fn insert(&self, conflict: &SyncConflict) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_conflicts (
                    id, queue_item_id, scope_id, table_name, record_id, client_data,
                    server_data, client_stamps, server_stamps, created_at, resolution,
                    resolved_data, resolved_at, applied_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    conflict.id.as_str(),
                    conflict.queue_item_id.as_str(),
                    conflict.scope_id.as_str(),
                    conflict.table_name.as_str(),
                    conflict.record_id.as_str(),
                    rows::json_text(&conflict.client_data)?,
                    rows::json_text(&conflict.server_data)?,
                    rows::json_text(&conflict.client_stamps)?,
                    rows::json_text(&conflict.server_stamps)?,
                    conflict.created_at,
                    rows::nullable_text(conflict.resolution.map(ConflictResolution::as_str)),
                    rows::nullable_json(conflict.resolved_data.as_ref())?,
                    rows::nullable_integer(conflict.resolved_at),
                    rows::nullable_integer(conflict.applied_at)
                ],
            )
            .await?;

        tracing::info!(
            conflict = %conflict.id,
            item = %conflict.queue_item_id,
            entity = %conflict.entity_key(),
            "Recorded sync conflict"
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SyncConflict>> {
        let sql = format!("SELECT {COLUMNS} FROM sync_conflicts WHERE id = ?");
        Ok(self.query_conflicts(&sql, [id]).await?.into_iter().next())
    }

    async fn list_unresolved(&self, scope_id: Option<&str>) -> Result<Vec<SyncConflict>> {
        match scope_id {
            Some(scope_id) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM sync_conflicts
                     WHERE resolution IS NULL AND scope_id = ?
                     ORDER BY created_at ASC, id ASC"
                );
                self.query_conflicts(&sql, [scope_id]).await
            }
            None => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM sync_conflicts
                     WHERE resolution IS NULL
                     ORDER BY created_at ASC, id ASC"
                );
                self.query_conflicts(&sql, ()).await
            }
        }
    }

    async fn count_unresolved(&self, scope_id: Option<&str>) -> Result<usize> {
        match scope_id {
            Some(scope_id) => {
                self.count(
                    "SELECT COUNT(*) FROM sync_conflicts WHERE resolution IS NULL AND scope_id = ?",
                    [scope_id],
                )
                .await
            }
            None => {
                self.count(
                    "SELECT COUNT(*) FROM sync_conflicts WHERE resolution IS NULL",
                    (),
                )
                .await
            }
        }
    }

    async fn list_for_item(&self, queue_item_id: &str) -> Result<Vec<SyncConflict>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM sync_conflicts
             WHERE queue_item_id = ?
             ORDER BY created_at ASC, id ASC"
        );
        self.query_conflicts(&sql, [queue_item_id]).await
    }

    async fn list_pending_application(&self) -> Result<Vec<SyncConflict>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM sync_conflicts
             WHERE resolution IS NOT NULL AND applied_at IS NULL
             ORDER BY resolved_at ASC, id ASC"
        );
        self.query_conflicts(&sql, ()).await
    }

    async fn count_open_for_item(&self, queue_item_id: &str) -> Result<usize> {
        self.count(
            "SELECT COUNT(*) FROM sync_conflicts WHERE queue_item_id = ? AND applied_at IS NULL",
            [queue_item_id],
        )
        .await
    }

    async fn resolve(
        &self,
        id: &str,
        resolution: ConflictResolution,
        resolved_data: Option<&Record>,
        resolved_at: i64,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE sync_conflicts
                 SET resolution = ?, resolved_data = ?, resolved_at = ?
                 WHERE id = ? AND resolution IS NULL",
                params![
                    resolution.as_str(),
                    rows::nullable_json(resolved_data)?,
                    resolved_at,
                    id
                ],
            )
            .await?;

        if changed > 0 {
            tracing::info!(conflict = id, resolution = %resolution, "Conflict resolved");
        }
        Ok(changed > 0)
    }

    async fn mark_applied(&self, id: &str, applied_at: i64) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE sync_conflicts SET applied_at = ?
                 WHERE id = ? AND resolution IS NOT NULL AND applied_at IS NULL",
                params![applied_at, id],
            )
            .await?;
        if changed == 0 {
            return Err(Error::NotFound(format!(
                "resolved, unapplied conflict {id}"
            )));
        }
        Ok(())
    }

    async fn delete_for_item(&self, queue_item_id: &str) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM sync_conflicts WHERE queue_item_id = ?",
                [queue_item_id],
            )
            .await?;
        Ok(changed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::FieldStamps;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn conflict(id: &str, item: &str, scope: &str, created_at: i64) -> SyncConflict {
        SyncConflict {
            id: id.to_string(),
            queue_item_id: item.to_string(),
            scope_id: scope.to_string(),
            table_name: "expenses".to_string(),
            record_id: "e-1".to_string(),
            client_data: record(json!({"id": "e-1", "amount": 100})),
            server_data: record(json!({"id": "e-1", "amount": 75})),
            client_stamps: FieldStamps::uniform(200),
            server_stamps: FieldStamps::uniform(150).with_field("amount", 180),
            created_at,
            resolution: None,
            resolved_data: None,
            resolved_at: None,
            applied_at: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get_round_trips_stamps() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());

        let original = conflict("c-1", "q-1", "farm-1", 10);
        repo.insert(&original).await.unwrap();

        let stored = repo.get("c-1").await.unwrap().unwrap();
        assert_eq!(stored, original);
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unresolved_listing_is_scoped() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());

        repo.insert(&conflict("c-2", "q-2", "farm-1", 20)).await.unwrap();
        repo.insert(&conflict("c-1", "q-1", "farm-1", 10)).await.unwrap();
        repo.insert(&conflict("c-3", "q-3", "farm-2", 5)).await.unwrap();

        let farm_one = repo.list_unresolved(Some("farm-1")).await.unwrap();
        let ids = farm_one.iter().map(|c| c.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["c-1", "c-2"]);

        assert_eq!(repo.count_unresolved(Some("farm-2")).await.unwrap(), 1);
        assert_eq!(repo.count_unresolved(None).await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolution_is_set_once() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.insert(&conflict("c-1", "q-1", "farm-1", 10)).await.unwrap();

        assert!(repo
            .resolve("c-1", ConflictResolution::ServerWins, None, 30)
            .await
            .unwrap());
        assert!(!repo
            .resolve("c-1", ConflictResolution::ClientWins, None, 40)
            .await
            .unwrap());
        assert!(!repo
            .resolve("missing", ConflictResolution::ClientWins, None, 40)
            .await
            .unwrap());

        let stored = repo.get("c-1").await.unwrap().unwrap();
        assert_eq!(stored.resolution, Some(ConflictResolution::ServerWins));
        assert_eq!(stored.resolved_at, Some(30));
        assert_eq!(repo.count_unresolved(None).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_application_tracking() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlConflictRepository::new(db.connection());
        repo.insert(&conflict("c-1", "q-1", "farm-1", 10)).await.unwrap();

        // Unapplied conflicts keep the item open, resolved or not
        assert_eq!(repo.count_open_for_item("q-1").await.unwrap(), 1);
        assert!(repo.mark_applied("c-1", 50).await.is_err());

        let merged = record(json!({"id": "e-1", "amount": 90}));
        repo.resolve("c-1", ConflictResolution::Merged, Some(&merged), 30)
            .await
            .unwrap();
        let pending = repo.list_pending_application().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].resolved_data.as_ref(), Some(&merged));

        repo.mark_applied("c-1", 50).await.unwrap();
        assert!(repo.list_pending_application().await.unwrap().is_empty());
        assert_eq!(repo.count_open_for_item("q-1").await.unwrap(), 0);

        assert_eq!(repo.delete_for_item("q-1").await.unwrap(), 1);
        assert!(repo.list_for_item("q-1").await.unwrap().is_empty());
    }
}
