//! In-place index rewrite trait.
//!
//! The reindex path writes through [`IndexWriter`] exclusively: it replaces
//! a current record's index rows and rule-set hash without creating a new
//! version, bumping `last_modified`, or touching the payload. The standard
//! upsert is never used for reindex writes.

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{IndexEntry, StoredRecord};

/// A replacement index set for one record.
#[derive(Debug, Clone)]
pub struct IndexUpdate {
    /// Resource type of the target record.
    pub resource_type: String,
    /// Logical id of the target record.
    pub logical_id: String,
    /// The current version the caller extracted against.
    pub expected_version: u64,
    /// Hash of the rule set the entries were produced with.
    pub search_param_hash: String,
    /// The replacement rows.
    pub entries: Vec<IndexEntry>,
}

/// Contract for rewriting search index rows in place.
#[async_trait]
pub trait IndexWriter: Send + Sync {
    /// Replaces one record's index rows and rule-set hash atomically.
    ///
    /// Requires `expected_version` to equal the current version; fails
    /// `PreconditionFailed` on mismatch and `NotFound` when the record is
    /// absent or its current version is a tombstone. On success the record's
    /// `version`, `last_modified`, and payload are unchanged.
    async fn update_index(&self, update: IndexUpdate) -> StoreResult<StoredRecord>;

    /// Applies several index rewrites as one transactional batch.
    ///
    /// All-or-nothing: if any record fails its precondition or is missing,
    /// the whole batch fails and no rows change. Order within a batch is not
    /// observable.
    async fn update_indices_batch(&self, updates: Vec<IndexUpdate>) -> StoreResult<()>;
}
