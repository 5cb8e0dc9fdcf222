//! Versioned record storage trait.
//!
//! [`VersionedStore`] is the contract every backend implements for record
//! CRUD. The read-check-write sequence of an upsert is serializable per
//! `(resource_type, logical_id)`: backends implement it as a blind insert
//! with collision fallback plus a conditional-replace loop keyed on a
//! storage-level row version, never as an application-level lock.

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{RecordDraft, RecordKey, StoredRecord, UpsertOutcome};

/// Options controlling an upsert.
#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    /// Caller-supplied version expectation; `None` means unconditional.
    pub if_match: Option<u64>,
    /// Whether the upsert may create a record that does not exist.
    pub allow_create: bool,
    /// Whether the replaced version is retained as history.
    pub keep_history: bool,
}

impl UpsertOptions {
    /// Unconditional upsert with create allowed and history kept.
    pub fn unconditional() -> Self {
        Self {
            if_match: None,
            allow_create: true,
            keep_history: true,
        }
    }

    /// Sets the version expectation.
    pub fn with_if_match(mut self, version: u64) -> Self {
        self.if_match = Some(version);
        self
    }

    /// Sets whether create is allowed.
    pub fn with_allow_create(mut self, allow: bool) -> Self {
        self.allow_create = allow;
        self
    }

    /// Sets whether history is kept.
    pub fn with_keep_history(mut self, keep: bool) -> Self {
        self.keep_history = keep;
        self
    }
}

/// How a delete removes a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Append a tombstone version; history remains readable.
    Soft,
    /// Remove the current row, all history, and all index rows.
    Hard,
}

/// Contract for versioned record storage.
///
/// # Versioning
///
/// Versions are integers starting at 1, strictly increasing per record with
/// no gaps. At most one version per record is *current*; the rest are
/// history.
///
/// # Optimistic concurrency
///
/// `upsert` implements HTTP If-Match semantics: when `if_match` is present
/// the write succeeds only against exactly that current version. Conflicting
/// writers retry against the backend's conditional primitive, so per-record
/// linearizability holds without locks.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// A human-readable name for this backend.
    fn backend_name(&self) -> &'static str;

    /// Creates or replaces a record.
    ///
    /// * No current row: fails `NotFound` when `if_match` is present (the
    ///   caller's expectation is stale), `MethodNotAllowed` when create is
    ///   not allowed, otherwise inserts at version 1.
    /// * Current row present: a mismatched `if_match` fails
    ///   `PreconditionFailed`. A tombstone draft over a tombstone row is a
    ///   no-op. Otherwise the new version is `current + 1`; the old row is
    ///   retained as history or discarded per `keep_history`, and index rows
    ///   are rewritten for the new version.
    async fn upsert(
        &self,
        draft: RecordDraft,
        options: &UpsertOptions,
    ) -> StoreResult<UpsertOutcome>;

    /// Reads a record.
    ///
    /// An unversioned key returns the current version, or `Gone` when the
    /// current version is a tombstone. A versioned key returns exactly that
    /// history row (tombstones included) or `NotFound` — even when the
    /// current row carries a different version. Payloads with
    /// `meta_embedded == false` are returned with meta patched in.
    async fn get(&self, key: &RecordKey) -> StoreResult<StoredRecord>;

    /// Deletes a record.
    ///
    /// Soft delete appends a tombstone and returns its version; deleting an
    /// absent or already-deleted record is an idempotent no-op returning
    /// `None`. Hard delete removes every version and index row and returns
    /// `None`. A versioned key is rejected with `MethodNotAllowed`.
    async fn delete(&self, key: &RecordKey, mode: DeleteMode) -> StoreResult<Option<u64>>;

    /// Lists all version numbers for a record, ascending.
    ///
    /// Returns an empty list for records that never existed.
    async fn list_versions(
        &self,
        resource_type: &str,
        logical_id: &str,
    ) -> StoreResult<Vec<u64>>;
}

/// One page of a record scan.
#[derive(Debug, Clone)]
pub struct RecordPage {
    /// Records in this page, ordered by logical id.
    pub records: Vec<StoredRecord>,
    /// Cursor for the next page, or `None` when exhausted.
    pub next: Option<String>,
}

/// Paged access to the current versions of a resource type.
///
/// Used by the reindex task; tombstones are excluded (index rows exist only
/// for live current versions).
#[async_trait]
pub trait RecordScan: Send + Sync {
    /// Returns the page of current records after the given cursor.
    async fn page_records(
        &self,
        resource_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<RecordPage>;

    /// Counts current non-deleted records of a type.
    async fn count_records(&self, resource_type: &str) -> StoreResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_options_builder() {
        let options = UpsertOptions::unconditional()
            .with_if_match(3)
            .with_keep_history(false);
        assert_eq!(options.if_match, Some(3));
        assert!(options.allow_create);
        assert!(!options.keep_history);
    }
}
