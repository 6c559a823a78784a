//! Database migrations for rollsync.
//!
//! Each migration is a function that upgrades the schema by one version.
//! Migrations are run automatically when the database is opened.

use rusqlite::Connection;

use crate::error::RollsyncError;

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

/// Get the current schema version from the database.
///
/// Returns 0 if no version has been set (new database).
pub fn get_version(conn: &Connection) -> Result<i32, RollsyncError> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| RollsyncError::Database(format!("Failed to get schema version: {e}")))
}

/// Set the schema version in the database.
fn set_version(conn: &Connection, version: i32) -> Result<(), RollsyncError> {
    conn.execute_batch(&format!("PRAGMA user_version = {version};"))
        .map_err(|e| RollsyncError::Database(format!("Failed to set schema version: {e}")))
}

/// Run all pending migrations.
pub fn run(conn: &Connection) -> Result<(), RollsyncError> {
    let current = get_version(conn)?;

    if current >= CURRENT_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=CURRENT_VERSION {
        run_migration(conn, version)?;
        set_version(conn, version)?;
    }

    Ok(())
}

/// Run a specific migration.
fn run_migration(conn: &Connection, version: i32) -> Result<(), RollsyncError> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(RollsyncError::Database(format!(
            "Unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: Initial schema.
///
/// Creates tables for:
/// - `sync_operations`: durable queue of offline operations
/// - `audit_log`: lightweight record of enqueues and uploads
/// - `cache_metadata`: one row per reference-data category
/// - `cached_entities`: reference records downloaded from the server
fn migrate_v1(conn: &Connection) -> Result<(), RollsyncError> {
    conn.execute_batch(
        r"
        -- Offline operation queue. AUTOINCREMENT keeps ids from being reused.
        CREATE TABLE IF NOT EXISTS sync_operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            scheduled_at TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            last_error TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            synced_at TEXT,
            claimed_at TEXT,
            last_attempt_at TEXT,
            CHECK (attempts >= 0 AND attempts <= max_attempts)
        );

        CREATE INDEX IF NOT EXISTS idx_sync_operations_dequeue
        ON sync_operations(status, priority DESC, created_at ASC);

        CREATE INDEX IF NOT EXISTS idx_sync_operations_type
        ON sync_operations(operation_type, status);

        -- Audit trail
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            operation_type TEXT,
            item_count INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        -- Reference-data cache
        CREATE TABLE IF NOT EXISTS cache_metadata (
            category TEXT PRIMARY KEY,
            record_count INTEGER NOT NULL DEFAULT 0,
            last_updated TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cached_entities (
            category TEXT NOT NULL,
            entity_key TEXT NOT NULL,
            data TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'cached',
            cached_at TEXT NOT NULL,
            PRIMARY KEY (category, entity_key)
        );

        CREATE INDEX IF NOT EXISTS idx_cached_entities_status
        ON cached_entities(sync_status);
        ",
    )
    .map_err(|e| RollsyncError::Database(format!("Migration v1 failed: {e}")))
}
