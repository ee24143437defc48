//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Apply a migration's statements atomically
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version} (latest {CURRENT_VERSION})");
    Ok(())
}

/// Migration to version 1: mutation queue, local cache, checkpoints
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        // Mutation queue
        "CREATE TABLE IF NOT EXISTS queue_items (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            optimistic_id TEXT NOT NULL UNIQUE,
            scope_id TEXT NOT NULL,
            mutation_type TEXT NOT NULL,
            table_name TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            failure_kind TEXT,
            conflict_id TEXT,
            updated_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_queue_items_status ON queue_items(status)",
        "CREATE INDEX IF NOT EXISTS idx_queue_items_order ON queue_items(created_at, seq)",
        // Local cache of last-known-good remote data
        "CREATE TABLE IF NOT EXISTS cache_entries (
            scope_id TEXT NOT NULL,
            collection TEXT NOT NULL,
            record_id TEXT NOT NULL DEFAULT '',
            data TEXT NOT NULL,
            last_updated INTEGER NOT NULL,
            optimistic_id TEXT,
            PRIMARY KEY (scope_id, collection, record_id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_cache_entries_optimistic ON cache_entries(optimistic_id)",
        // Per-table sync progress
        "CREATE TABLE IF NOT EXISTS sync_checkpoints (
            scope_id TEXT NOT NULL,
            table_name TEXT NOT NULL,
            last_sync_at INTEGER NOT NULL,
            records_synced INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (scope_id, table_name)
        )",
    ];

    apply(conn, 1, &statements).await
}

/// Migration to version 2: conflict store and optimistic write ledger
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id TEXT PRIMARY KEY,
            queue_item_id TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            client_data TEXT NOT NULL,
            server_data TEXT NOT NULL,
            client_stamps TEXT NOT NULL,
            server_stamps TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            resolution TEXT,
            resolved_data TEXT,
            resolved_at INTEGER,
            applied_at INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_scope ON sync_conflicts(scope_id, resolution)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_item ON sync_conflicts(queue_item_id)",
        "CREATE TABLE IF NOT EXISTS optimistic_writes (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            optimistic_id TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            collection TEXT NOT NULL,
            record_id TEXT NOT NULL,
            previous_data TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE (optimistic_id, scope_id, collection, record_id)
        )",
        "CREATE INDEX IF NOT EXISTS idx_optimistic_writes_key
            ON optimistic_writes(scope_id, collection, record_id, seq)",
    ];

    apply(conn, 2, &statements).await
}
