//! Core types for stored records and their index rows.

pub mod index;
pub mod record;

pub use index::{dedup_entries, IndexEntry, IndexValue, ParamKind};
pub use record::{
    embed_meta, parse_wire_version, RecordDraft, RecordKey, RecordMethod, StoredRecord,
    UpsertKind, UpsertOutcome,
};
