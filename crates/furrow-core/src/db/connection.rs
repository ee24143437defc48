//! Database connection management

use crate::error::Result;
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use std::path::Path;

use super::migrations;

/// Database wrapper for the local libSQL store
///
/// Holds the durable queue, conflict, cache, and checkpoint tables.
pub struct Database {
    // Kept alive for the lifetime of the connection
    _db: LibSqlDatabase,
    conn: Connection,
}

impl Database {
    /// Open a local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        let conn = db.connect()?;

        let database = Self { _db: db, conn };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;

        let database = Self { _db: db, conn };
        database.configure().await?;
        database.migrate().await?;
        Ok(database)
    }

    /// Configure `SQLite` for durability of queued mutations
    async fn configure(&self) -> Result<()> {
        // WAL is unavailable for in-memory databases
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok();
        self.conn.execute("PRAGMA synchronous = FULL;", ()).await.ok();
        self.conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn).await
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Start a write transaction on `conn`.
pub(crate) async fn begin(conn: &Connection) -> Result<()> {
    conn.execute("BEGIN IMMEDIATE TRANSACTION", ()).await?;
    Ok(())
}

/// Commit the open transaction, rolling back if the commit itself fails.
pub(crate) async fn commit(conn: &Connection) -> Result<()> {
    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }
    Ok(())
}

/// Roll back the open transaction; errors are logged, not returned.
pub(crate) async fn rollback(conn: &Connection) {
    if let Err(error) = conn.execute("ROLLBACK", ()).await {
        tracing::warn!("Rollback failed: {error}");
    }
}

/// Commit when `result` is `Ok`, otherwise roll back and pass the error on.
pub(crate) async fn finish<T>(conn: &Connection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            commit(conn).await?;
            Ok(value)
        }
        Err(error) => {
            rollback(conn).await;
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_in_memory() {
        let db = Database::open_in_memory().await.unwrap();
        let mut rows = db.connection().query("SELECT 1", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i32>(0).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_file_creates_database() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("furrow.db");

        drop(Database::open(&path).await.unwrap());
        assert!(path.exists());

        // Reopening an existing file must not re-run migrations destructively
        Database::open(&path).await.unwrap();
    }

    async fn checkpoint_rows(conn: &Connection) -> i64 {
        let mut rows = conn
            .query("SELECT COUNT(*) FROM sync_checkpoints", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get::<i64>(0).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_finish_commits_or_rolls_back() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();
        let insert = "INSERT INTO sync_checkpoints (scope_id, table_name, last_sync_at, records_synced)
                      VALUES ('farm-1', ?, 1, 1)";

        begin(conn).await.unwrap();
        conn.execute(insert, ["expenses"]).await.unwrap();
        finish(conn, Ok(())).await.unwrap();

        begin(conn).await.unwrap();
        conn.execute(insert, ["harvests"]).await.unwrap();
        let failed: Result<()> = Err(crate::Error::InvalidInput("boom".into()));
        assert!(finish(conn, failed).await.is_err());

        assert_eq!(checkpoint_rows(conn).await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rollback_discards_writes() {
        let db = Database::open_in_memory().await.unwrap();
        let conn = db.connection();

        begin(conn).await.unwrap();
        conn.execute(
            "INSERT INTO sync_checkpoints (scope_id, table_name, last_sync_at, records_synced)
             VALUES ('farm-1', 'expenses', 1, 1)",
            (),
        )
        .await
        .unwrap();
        rollback(conn).await;

        let mut rows = conn
            .query("SELECT COUNT(*) FROM sync_checkpoints", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 0);
    }
}
