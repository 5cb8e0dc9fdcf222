//! Core storage contracts.
//!
//! Three trait families make up the engine's surface:
//!
//! - [`VersionedStore`] — record CRUD with optimistic concurrency
//! - [`IndexWriter`] — in-place search-index rewrites for reindexing
//! - [`JobStore`] — durable reindex jobs with lease acquisition
//!
//! Backends implement all three plus [`RecordScan`]; [`ReindexStore`] is the
//! combined bound the reindex task works against.

pub mod index;
pub mod jobs;
pub mod store;

pub use index::{IndexUpdate, IndexWriter};
pub use jobs::{
    Checkpoint, JobEtag, JobStore, LeasedJob, ReindexJob, ReindexJobId, ReindexScope,
    ReindexStatus, ResourceProgress,
};
pub use store::{DeleteMode, RecordPage, RecordScan, UpsertOptions, VersionedStore};

/// Everything the reindex task needs from a backend.
pub trait ReindexStore: VersionedStore + IndexWriter + RecordScan {}

impl<T: VersionedStore + IndexWriter + RecordScan> ReindexStore for T {}
