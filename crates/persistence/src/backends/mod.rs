//! Backend implementations.
//!
//! Two deployment shapes share the contract traits: an in-memory document
//! store and a relational SQLite store. Backend-specific failure codes stay
//! behind the contract error space.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::{SqliteBackend, SqliteConfig};

use chrono::Utc;

use crate::search::ParamExtractor;
use crate::types::{embed_meta, RecordDraft, StoredRecord};

/// Builds the stored form of a draft at a version.
///
/// JSON payloads get `meta.versionId`/`meta.lastUpdated` embedded at write
/// time; other payloads are stored verbatim with `meta_embedded = false` and
/// patched on read. The record is stamped with the current rule-set hash.
pub(crate) fn materialize_draft(
    extractor: &ParamExtractor,
    draft: &RecordDraft,
    version: u64,
) -> StoredRecord {
    let now = Utc::now();
    let (raw, meta_embedded) = if draft.is_deleted {
        (draft.raw.clone(), false)
    } else {
        match embed_meta(&draft.raw, version, now) {
            Some(patched) => (patched, true),
            None => (draft.raw.clone(), false),
        }
    };
    let hash = extractor.param_hash(&draft.resource_type);
    StoredRecord::from_storage(
        draft.resource_type.clone(),
        draft.logical_id.clone(),
        version,
        draft.is_deleted,
        now,
        Some(draft.method),
        raw,
        meta_embedded,
        Some(hash),
    )
}
