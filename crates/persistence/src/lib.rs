//! Lumen Persistence Layer
//!
//! Versioned storage engine for clinical resources, plus the background
//! coordinator that rebuilds their search indexes when the extraction-rule
//! set changes.
//!
//! # Architecture
//!
//! - [`types`] - Record envelope and typed search-index rows
//! - [`error`] - Error hierarchy and caller-visible kinds
//! - [`core`] - Storage contracts: [`VersionedStore`], [`IndexWriter`],
//!   [`JobStore`]
//! - [`search`] - Extraction rules, registry, resolver
//! - [`backends`] - In-memory document store and SQLite implementations
//! - [`reindex`] - Worker, task state machine, throttle oracle
//! - [`config`] - Engine configuration
//!
//! # Versioning model
//!
//! Each record is addressed by `(type, logical_id, version)`. Versions are
//! gap-free integers starting at 1; exactly one version per record is
//! current. Writes are optimistic: an `If-Match` expectation is verified
//! against the current version and the replace itself is conditional on the
//! backend's row guard, so concurrent writers serialize without locks.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//!
//! use lumen_persistence::backends::MemoryBackend;
//! use lumen_persistence::core::{UpsertOptions, VersionedStore};
//! use lumen_persistence::search::{ParamExtractor, SearchParameterRegistry};
//! use lumen_persistence::types::{RecordDraft, RecordKey, RecordMethod, UpsertKind};
//! use parking_lot::RwLock;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(RwLock::new(SearchParameterRegistry::new()));
//! let store = MemoryBackend::new(Arc::new(ParamExtractor::new(registry)));
//!
//! let payload = serde_json::to_vec(&json!({
//!     "resourceType": "Patient",
//!     "name": [{"family": "Smith"}]
//! }))?;
//! let outcome = store
//!     .upsert(
//!         RecordDraft::new("Patient", "p1", payload, RecordMethod::Put),
//!         &UpsertOptions::unconditional(),
//!     )
//!     .await?;
//! assert_eq!(outcome.kind, UpsertKind::Created);
//! assert_eq!(outcome.version, Some(1));
//!
//! let record = store.get(&RecordKey::current("Patient", "p1")).await?;
//! assert_eq!(record.etag(), "W/\"1\"");
//! # Ok(())
//! # }
//! ```
//!
//! # Reindexing
//!
//! Registering a new extraction rule leaves existing records stale: their
//! `search_param_hash` no longer matches the registry's hash for the type.
//! A reindex job replays the rules over every persisted record through the
//! in-place [`IndexWriter`] path (no version bumps, no timestamp changes)
//! and promotes the rules to searchable once completion is proven. Workers
//! coordinate through etag-guarded leases; the progress checkpoint is the
//! heartbeat.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backends;
pub mod config;
pub mod core;
pub mod error;
pub mod reindex;
pub mod search;
pub mod types;

// Re-export commonly used types at crate root
pub use config::EngineConfig;
pub use core::{
    DeleteMode, IndexUpdate, IndexWriter, JobStore, LeasedJob, ReindexJob, ReindexJobId,
    ReindexStatus, ReindexStore, UpsertOptions, VersionedStore,
};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use types::{RecordDraft, RecordKey, StoredRecord, UpsertKind, UpsertOutcome};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
