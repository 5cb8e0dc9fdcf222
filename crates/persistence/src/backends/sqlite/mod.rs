//! SQLite backend.
//!
//! Relational implementation of the full contract set. Supports file-backed
//! databases (WAL, pooled connections) and in-memory databases for tests.
//! In-memory databases get a single-connection pool: each `:memory:`
//! connection is its own database, so pooling them would split the data.
//!
//! # Schema
//!
//! Four tables: `records` holds the current version per record, guarded by a
//! `row_version` column for conditional replaces; `record_history` holds
//! every retained version; `search_index` holds rows for current non-deleted
//! versions only; `reindex_jobs` holds durable jobs addressed by id.

mod index;
mod jobs;
mod schema;
mod store;

use std::path::Path;
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, StoreError, StoreResult};
use crate::search::ParamExtractor;

/// Configuration for the SQLite backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection acquire timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Enable WAL mode for file databases.
    #[serde(default = "default_true")]
    pub enable_wal: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            enable_wal: true,
        }
    }
}

/// SQLite backend over a pooled connection manager.
pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
    extractor: Arc<ParamExtractor>,
    is_memory: bool,
}

impl SqliteBackend {
    /// Creates an in-memory backend with the schema initialized.
    pub fn in_memory(extractor: Arc<ParamExtractor>) -> StoreResult<Self> {
        let config = SqliteConfig {
            max_connections: 1,
            ..SqliteConfig::default()
        };
        let manager = SqliteConnectionManager::memory();
        let backend = Self::build(manager, config, true, extractor)?;
        backend.init_schema()?;
        Ok(backend)
    }

    /// Opens or creates a file database.
    pub fn open<P: AsRef<Path>>(
        path: P,
        config: SqliteConfig,
        extractor: Arc<ParamExtractor>,
    ) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        let backend = Self::build(manager, config, false, extractor)?;
        backend.init_schema()?;
        Ok(backend)
    }

    fn build(
        manager: SqliteConnectionManager,
        config: SqliteConfig,
        is_memory: bool,
        extractor: Arc<ParamExtractor>,
    ) -> StoreResult<Self> {
        let pool = Pool::builder()
            .max_size(config.max_connections)
            .connection_timeout(std::time::Duration::from_millis(
                config.connection_timeout_ms,
            ))
            .build(manager)
            .map_err(|e| {
                StoreError::Backend(BackendError::Unavailable {
                    backend_name: "sqlite".to_string(),
                    message: e.to_string(),
                })
            })?;

        let backend = Self {
            pool,
            extractor,
            is_memory,
        };
        backend.configure(&config)?;
        Ok(backend)
    }

    fn configure(&self, config: &SqliteConfig) -> StoreResult<()> {
        let conn = self.connection()?;
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
            .map_err(|e| internal(format!("failed to set busy timeout: {}", e)))?;
        if config.enable_wal && !self.is_memory {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| internal(format!("failed to enable WAL: {}", e)))?;
        }
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| internal(format!("failed to enable foreign keys: {}", e)))?;
        Ok(())
    }

    /// Creates or migrates the schema. Idempotent.
    pub fn init_schema(&self) -> StoreResult<()> {
        let conn = self.connection()?;
        schema::initialize(&conn)
    }

    /// Whether this backend is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    pub(crate) fn connection(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|_| {
            StoreError::Backend(BackendError::PoolExhausted {
                backend_name: "sqlite".to_string(),
            })
        })
    }

    pub(crate) fn extractor(&self) -> &ParamExtractor {
        &self.extractor
    }
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("is_memory", &self.is_memory)
            .finish()
    }
}

/// Internal-error constructor shared by the backend modules.
pub(crate) fn internal(message: String) -> StoreError {
    StoreError::Backend(BackendError::Internal {
        backend_name: "sqlite".to_string(),
        message,
        source: None,
    })
}

/// Maps a rusqlite error onto the contract error space.
///
/// Lock contention that outlives the busy timeout surfaces as `RateLimited`;
/// the connection-level timeout has already absorbed transient contention.
pub(crate) fn map_sqlite_err(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
            StoreError::Backend(BackendError::RateLimited {
                backend_name: "sqlite".to_string(),
            })
        }
        _ => internal(err.to_string()),
    }
}

/// Whether an error is a primary-key collision (the blind-insert probe).
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchParameterRegistry;
    use parking_lot::RwLock;

    fn extractor() -> Arc<ParamExtractor> {
        Arc::new(ParamExtractor::new(Arc::new(RwLock::new(
            SearchParameterRegistry::new(),
        ))))
    }

    #[test]
    fn in_memory_backend_initializes() {
        let backend = SqliteBackend::in_memory(extractor()).unwrap();
        assert!(backend.is_memory());
        // Idempotent.
        backend.init_schema().unwrap();
    }

    #[test]
    fn config_defaults() {
        let config = SqliteConfig::default();
        assert_eq!(config.max_connections, 10);
        assert!(config.enable_wal);
    }
}
