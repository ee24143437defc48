//! Mutation queue repository implementation

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // COUNT(*) is never negative

use libsql::params::{IntoParams, Params};
use libsql::{params, Connection, Row};

use super::rows;
use crate::error::{Error, Result};
use crate::models::{FailureKind, QueueCounts, QueueItem, QueueStatus};
use crate::util::now_ms;

const COLUMNS: &str = "seq, id, optimistic_id, scope_id, payload, created_at, status, \
                       retry_count, last_error, failure_kind, conflict_id, updated_at";

/// Trait for durable mutation queue operations (async)
///
/// Status changes go through the `mark_*` methods, which enforce the queue
/// item state machine.
#[allow(async_fn_in_trait)]
pub trait QueueRepository {
    /// Persist a new pending item, returning it with its sequence number
    async fn insert(&self, item: &QueueItem) -> Result<QueueItem>;

    /// Get an item by its debugging id
    async fn get(&self, id: &str) -> Result<Option<QueueItem>>;

    /// Get an item by its idempotency token
    async fn find_by_optimistic_id(&self, optimistic_id: &str) -> Result<Option<QueueItem>>;

    /// All items in drain order (`created_at`, then insertion)
    async fn list_all(&self) -> Result<Vec<QueueItem>>;

    /// Items with the given status, in drain order
    async fn list_by_status(&self, status: QueueStatus) -> Result<Vec<QueueItem>>;

    async fn count_by_status(&self) -> Result<QueueCounts>;

    async fn mark_processing(&self, id: &str) -> Result<QueueItem>;

    async fn mark_completed(&self, id: &str) -> Result<QueueItem>;

    /// Record a failed attempt, bumping `retry_count`
    async fn mark_failed(&self, id: &str, error: &str, kind: FailureKind) -> Result<QueueItem>;

    async fn mark_awaiting_confirmation(&self, id: &str, conflict_id: &str) -> Result<QueueItem>;

    /// Move a failed item back to pending for another attempt
    async fn requeue(&self, id: &str) -> Result<QueueItem>;

    /// Return items stuck in `processing` to `pending`; returns how many moved
    async fn recover_interrupted(&self) -> Result<usize>;

    /// Remove an item permanently
    async fn delete(&self, id: &str) -> Result<()>;

    /// Delete completed items last touched before `before` (Unix ms)
    async fn purge_completed(&self, before: i64) -> Result<usize>;
}

/// libSQL implementation of `QueueRepository`
pub struct LibSqlQueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlQueueRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a queue item from a database row
    fn parse_item(row: &Row) -> Result<QueueItem> {
        Ok(QueueItem {
            seq: rows::integer(row, 0)?,
            id: rows::text(row, 1)?,
            optimistic_id: rows::text(row, 2)?,
            scope_id: rows::text(row, 3)?,
            mutation: rows::json(row, 4)?,
            created_at: rows::integer(row, 5)?,
            status: rows::parsed(row, 6)?,
            retry_count: rows::integer(row, 7)?,
            last_error: rows::optional_text(row, 8)?,
            failure_kind: rows::optional_parsed(row, 9)?,
            conflict_id: rows::optional_text(row, 10)?,
            updated_at: rows::integer(row, 11)?,
        })
    }

    async fn query_items(&self, sql: &str, params: impl IntoParams) -> Result<Vec<QueueItem>> {
        let mut result = self.conn.query(sql, params).await?;
        let mut items = Vec::new();
        while let Some(row) = result.next().await? {
            items.push(Self::parse_item(&row)?);
        }
        Ok(items)
    }

    /// Load `id`, check the state machine, then update guarded on the old status.
    ///
    /// `extra` is appended to the `SET` clause and binds `values` in order.
    async fn transition(
        &self,
        id: &str,
        to: QueueStatus,
        extra: Option<&str>,
        mut values: Vec<libsql::Value>,
    ) -> Result<QueueItem> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue item {id}")))?;

        if !current.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to,
            });
        }

        let extra = extra.map_or_else(String::new, |clause| format!(", {clause}"));
        let sql = format!(
            "UPDATE queue_items SET status = ?, updated_at = ?{extra} WHERE id = ? AND status = ?"
        );
        let mut params = vec![
            libsql::Value::Text(to.as_str().to_string()),
            libsql::Value::Integer(now_ms()),
        ];
        params.append(&mut values);
        params.push(libsql::Value::Text(id.to_string()));
        params.push(libsql::Value::Text(current.status.as_str().to_string()));

        let changed = self.conn.execute(&sql, Params::Positional(params)).await?;
        if changed == 0 {
            // Another writer moved the item between the read and the update
            return Err(Error::Database(format!(
                "queue item {id} changed status concurrently"
            )));
        }

        tracing::debug!(item = id, from = %current.status, to = %to, "Queue transition");
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("queue item {id}")))
    }
}

impl QueueRepository for LibSqlQueueRepository<'_> {
    async fn insert(&self, item: &QueueItem) -> Result<QueueItem> {
        self.conn
            .execute(
                "INSERT INTO queue_items (
                    id, optimistic_id, scope_id, mutation_type, table_name, payload,
                    created_at, status, retry_count, last_error, failure_kind,
                    conflict_id, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    item.id.as_str(),
                    item.optimistic_id.as_str(),
                    item.scope_id.as_str(),
                    item.mutation.kind(),
                    item.mutation.table(),
                    rows::json_text(&item.mutation)?,
                    item.created_at,
                    item.status.as_str(),
                    item.retry_count,
                    rows::nullable_text(item.last_error.as_deref()),
                    rows::nullable_text(item.failure_kind.map(FailureKind::as_str)),
                    rows::nullable_text(item.conflict_id.as_deref()),
                    item.updated_at
                ],
            )
            .await?;

        self.get(&item.id)
            .await?
            .ok_or_else(|| Error::Database(format!("queue item {} vanished after insert", item.id)))
    }

    async fn get(&self, id: &str) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {COLUMNS} FROM queue_items WHERE id = ?");
        Ok(self.query_items(&sql, [id]).await?.into_iter().next())
    }

    async fn find_by_optimistic_id(&self, optimistic_id: &str) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {COLUMNS} FROM queue_items WHERE optimistic_id = ?");
        Ok(self.query_items(&sql, [optimistic_id]).await?.into_iter().next())
    }

    async fn list_all(&self) -> Result<Vec<QueueItem>> {
        let sql = format!("SELECT {COLUMNS} FROM queue_items ORDER BY created_at ASC, seq ASC");
        self.query_items(&sql, ()).await
    }

    async fn list_by_status(&self, status: QueueStatus) -> Result<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM queue_items WHERE status = ? ORDER BY created_at ASC, seq ASC"
        );
        self.query_items(&sql, [status.as_str()]).await
    }

    async fn count_by_status(&self) -> Result<QueueCounts> {
        let mut result = self
            .conn
            .query("SELECT status, COUNT(*) FROM queue_items GROUP BY status", ())
            .await?;

        let mut counts = QueueCounts::default();
        while let Some(row) = result.next().await? {
            let status: QueueStatus = rows::parsed(&row, 0)?;
            let count = rows::integer(&row, 1)?;
            counts.add(status, count as usize);
        }
        Ok(counts)
    }

    async fn mark_processing(&self, id: &str) -> Result<QueueItem> {
        self.transition(id, QueueStatus::Processing, None, Vec::new())
            .await
    }

    async fn mark_completed(&self, id: &str) -> Result<QueueItem> {
        self.transition(
            id,
            QueueStatus::Completed,
            Some("last_error = NULL, failure_kind = NULL"),
            Vec::new(),
        )
        .await
    }

    async fn mark_failed(&self, id: &str, error: &str, kind: FailureKind) -> Result<QueueItem> {
        self.transition(
            id,
            QueueStatus::Failed,
            Some("retry_count = retry_count + 1, last_error = ?, failure_kind = ?"),
            vec![
                libsql::Value::Text(error.to_string()),
                libsql::Value::Text(kind.as_str().to_string()),
            ],
        )
        .await
    }

    async fn mark_awaiting_confirmation(&self, id: &str, conflict_id: &str) -> Result<QueueItem> {
        self.transition(
            id,
            QueueStatus::AwaitingConfirmation,
            Some("conflict_id = COALESCE(conflict_id, ?)"),
            vec![libsql::Value::Text(conflict_id.to_string())],
        )
        .await
    }

    async fn requeue(&self, id: &str) -> Result<QueueItem> {
        self.transition(id, QueueStatus::Pending, Some("failure_kind = NULL"), Vec::new())
            .await
    }

    async fn recover_interrupted(&self) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "UPDATE queue_items SET status = 'pending', updated_at = ? WHERE status = 'processing'",
                [now_ms()],
            )
            .await?;
        if changed > 0 {
            tracing::warn!("Recovered {changed} queue item(s) interrupted mid-sync");
        }
        Ok(changed as usize)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let changed = self
            .conn
            .execute("DELETE FROM queue_items WHERE id = ?", [id])
            .await?;
        if changed == 0 {
            return Err(Error::NotFound(format!("queue item {id}")));
        }
        Ok(())
    }

    async fn purge_completed(&self, before: i64) -> Result<usize> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM queue_items WHERE status = 'completed' AND updated_at < ?",
                [before],
            )
            .await?;
        Ok(changed as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{Mutation, QueueItemInput};
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn update(id: &str, amount: i64) -> Mutation {
        Mutation::RecordUpdate {
            table: "expenses".into(),
            id: id.into(),
            base: serde_json::Map::new(),
            changes: json!({ "amount": amount }).as_object().cloned().unwrap(),
        }
    }

    fn item(id: &str, created_at: i64) -> QueueItem {
        QueueItemInput::new("farm-1", update("e-1", created_at))
            .with_id(id)
            .with_created_at(created_at)
            .into_item(created_at)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get() {
        let db = setup().await;
        let repo = LibSqlQueueRepository::new(db.connection());

        let stored = repo.insert(&item("q-1", 10)).await.unwrap();
        assert!(stored.seq > 0);
        assert_eq!(stored.status, QueueStatus::Pending);

        let fetched = repo.get("q-1").await.unwrap().unwrap();
        assert_eq!(fetched, stored);

        let by_token = repo
            .find_by_optimistic_id(&stored.optimistic_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_token.id, "q-1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_all_orders_by_created_at_then_insertion() {
        let db = setup().await;
        let repo = LibSqlQueueRepository::new(db.connection());

        repo.insert(&item("late", 30)).await.unwrap();
        repo.insert(&item("early", 10)).await.unwrap();
        repo.insert(&item("tie-a", 20)).await.unwrap();
        repo.insert(&item("tie-b", 20)).await.unwrap();

        let ids = repo
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["early", "tie-a", "tie-b", "late"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_item_bookkeeping() {
        let db = setup().await;
        let repo = LibSqlQueueRepository::new(db.connection());
        repo.insert(&item("q-1", 10)).await.unwrap();

        repo.mark_processing("q-1").await.unwrap();
        let failed = repo
            .mark_failed("q-1", "timeout", FailureKind::Transient)
            .await
            .unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));
        assert_eq!(failed.failure_kind, Some(FailureKind::Transient));

        let requeued = repo.requeue("q-1").await.unwrap();
        assert_eq!(requeued.status, QueueStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.failure_kind, None);

        let failed_items = repo.list_by_status(QueueStatus::Failed).await.unwrap();
        assert!(failed_items.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_transition_is_rejected() {
        let db = setup().await;
        let repo = LibSqlQueueRepository::new(db.connection());
        repo.insert(&item("q-1", 10)).await.unwrap();

        let err = repo.mark_completed("q-1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: QueueStatus::Pending,
                to: QueueStatus::Completed,
                ..
            }
        ));

        repo.mark_processing("q-1").await.unwrap();
        repo.mark_completed("q-1").await.unwrap();
        assert!(repo.mark_processing("q-1").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_awaiting_confirmation_keeps_first_conflict() {
        let db = setup().await;
        let repo = LibSqlQueueRepository::new(db.connection());
        repo.insert(&item("q-1", 10)).await.unwrap();
        repo.mark_processing("q-1").await.unwrap();

        let blocked = repo
            .mark_awaiting_confirmation("q-1", "c-1")
            .await
            .unwrap();
        assert_eq!(blocked.status, QueueStatus::AwaitingConfirmation);
        assert_eq!(blocked.conflict_id.as_deref(), Some("c-1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_counts_and_recovery() {
        let db = setup().await;
        let repo = LibSqlQueueRepository::new(db.connection());
        repo.insert(&item("q-1", 10)).await.unwrap();
        repo.insert(&item("q-2", 20)).await.unwrap();
        repo.mark_processing("q-1").await.unwrap();

        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.outstanding(), 2);

        assert_eq!(repo.recover_interrupted().await.unwrap(), 1);
        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.processing, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_purge_only_removes_old_completed_items() {
        let db = setup().await;
        let repo = LibSqlQueueRepository::new(db.connection());
        repo.insert(&item("done", 10)).await.unwrap();
        repo.insert(&item("open", 20)).await.unwrap();
        repo.mark_processing("done").await.unwrap();
        repo.mark_completed("done").await.unwrap();

        assert_eq!(repo.purge_completed(0).await.unwrap(), 0);
        assert_eq!(repo.purge_completed(i64::MAX).await.unwrap(), 1);
        assert!(repo.get("done").await.unwrap().is_none());
        assert!(repo.get("open").await.unwrap().is_some());
    }
}
