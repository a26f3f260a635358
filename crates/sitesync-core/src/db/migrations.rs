//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

use super::store::Collection;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Migration to version 1: one document table per collection
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )?;

    for collection in Collection::ALL {
        let table = collection.table();
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                status TEXT,
                owner_id TEXT,
                updated_at INTEGER NOT NULL DEFAULT 0,
                body TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status);
            CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table}(owner_id);"
        ))?;
    }

    tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    tx.commit()?;

    tracing::info!("Migrated local store to version 1");
    Ok(())
}

/// Migration to version 2: drain-order index on the sync queue
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_sync_queue_status_updated
            ON sync_queue(status, updated_at);
         CREATE INDEX IF NOT EXISTS idx_conflicts_updated
            ON conflicts(updated_at DESC);",
    )?;
    tx.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
    tx.commit()?;

    tracing::info!("Migrated local store to version {CURRENT_VERSION}");
    Ok(())
}
