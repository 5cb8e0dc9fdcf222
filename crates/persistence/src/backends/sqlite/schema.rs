//! SQLite schema definitions and migrations.

use rusqlite::Connection;

use crate::error::StoreResult;

use super::internal;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Initializes or migrates the database schema.
pub fn initialize(conn: &Connection) -> StoreResult<()> {
    let current = schema_version(conn)?;
    if current == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, 1)?;
        migrate(conn, 1)?;
    } else if current < SCHEMA_VERSION {
        migrate(conn, current)?;
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> StoreResult<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| internal(format!("failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();
    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> StoreResult<()> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| internal(format!("failed to clear schema_version: {}", e)))?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )
    .map_err(|e| internal(format!("failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_schema_v1(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS records (
            resource_type TEXT NOT NULL,
            logical_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            row_version INTEGER NOT NULL,
            raw BLOB NOT NULL,
            last_modified TEXT NOT NULL,
            method TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            meta_embedded INTEGER NOT NULL DEFAULT 0,
            search_param_hash TEXT,
            PRIMARY KEY (resource_type, logical_id)
        )",
        [],
    )
    .map_err(|e| internal(format!("failed to create records table: {}", e)))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS record_history (
            resource_type TEXT NOT NULL,
            logical_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            raw BLOB NOT NULL,
            last_modified TEXT NOT NULL,
            method TEXT,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            meta_embedded INTEGER NOT NULL DEFAULT 0,
            search_param_hash TEXT,
            PRIMARY KEY (resource_type, logical_id, version)
        )",
        [],
    )
    .map_err(|e| internal(format!("failed to create record_history table: {}", e)))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS search_index (
            resource_type TEXT NOT NULL,
            logical_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            param_code TEXT NOT NULL,
            param_url TEXT NOT NULL,
            value_kind TEXT NOT NULL,
            value_string TEXT,
            value_token_system TEXT,
            value_token_code TEXT,
            value_reference TEXT,
            value_date TEXT,
            value_number REAL,
            value_quantity_value REAL,
            value_quantity_system TEXT,
            value_quantity_code TEXT,
            value_uri TEXT,
            composite_group INTEGER
        )",
        [],
    )
    .map_err(|e| internal(format!("failed to create search_index table: {}", e)))?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_search_record
         ON search_index (resource_type, logical_id)",
        [],
    )
    .map_err(|e| internal(format!("failed to create search index: {}", e)))?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_search_param
         ON search_index (resource_type, param_code)",
        [],
    )
    .map_err(|e| internal(format!("failed to create param index: {}", e)))?;

    Ok(())
}

fn migrate(conn: &Connection, from: i32) -> StoreResult<()> {
    let mut version = from;
    while version < SCHEMA_VERSION {
        match version {
            1 => migrate_v1_to_v2(conn)?,
            _ => break,
        }
        version += 1;
        set_schema_version(conn, version)?;
    }
    Ok(())
}

/// v2 adds the reindex job table.
fn migrate_v1_to_v2(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS reindex_jobs (
            id TEXT NOT NULL PRIMARY KEY,
            status TEXT NOT NULL,
            etag TEXT NOT NULL,
            heartbeat_at TEXT,
            body BLOB NOT NULL,
            created_at TEXT NOT NULL,
            last_modified TEXT NOT NULL
        )",
        [],
    )
    .map_err(|e| internal(format!("failed to create reindex_jobs table: {}", e)))?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_status ON reindex_jobs (status)",
        [],
    )
    .map_err(|e| internal(format!("failed to create job status index: {}", e)))?;

    Ok(())
}
