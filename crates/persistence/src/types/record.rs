//! Stored record types.
//!
//! [`StoredRecord`] wraps an opaque clinical payload with the persistence
//! metadata the engine tracks: identity, version, tombstone state,
//! timestamps, the verb that produced the version, and the hash of the
//! extraction-rule set its index rows were built with.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key addressing a record, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    /// Resource type name (e.g. "Patient", "Observation").
    pub resource_type: String,
    /// Logical id, unique within the resource type.
    pub logical_id: String,
    /// Specific version, or `None` for the current version.
    pub version: Option<u64>,
}

impl RecordKey {
    /// Key for the current version of a record.
    pub fn current(resource_type: impl Into<String>, logical_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            logical_id: logical_id.into(),
            version: None,
        }
    }

    /// Key for a specific version of a record.
    pub fn versioned(
        resource_type: impl Into<String>,
        logical_id: impl Into<String>,
        version: u64,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            logical_id: logical_id.into(),
            version: Some(version),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.version {
            Some(v) => write!(f, "{}/{}/_history/{}", self.resource_type, self.logical_id, v),
            None => write!(f, "{}/{}", self.resource_type, self.logical_id),
        }
    }
}

/// HTTP verb that produced a record version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordMethod {
    /// Version created via POST.
    Post,
    /// Version created or replaced via PUT.
    Put,
    /// Version produced by PATCH.
    Patch,
    /// Tombstone version produced by DELETE.
    Delete,
}

impl RecordMethod {
    /// Wire representation of the verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordMethod::Post => "POST",
            RecordMethod::Put => "PUT",
            RecordMethod::Patch => "PATCH",
            RecordMethod::Delete => "DELETE",
        }
    }

    /// Parses the wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "POST" => Some(RecordMethod::Post),
            "PUT" => Some(RecordMethod::Put),
            "PATCH" => Some(RecordMethod::Patch),
            "DELETE" => Some(RecordMethod::Delete),
            _ => None,
        }
    }
}

/// A persisted record version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    resource_type: String,
    logical_id: String,
    version: u64,
    is_deleted: bool,
    last_modified: DateTime<Utc>,
    method: Option<RecordMethod>,
    raw: Vec<u8>,
    meta_embedded: bool,
    search_param_hash: Option<String>,
}

impl StoredRecord {
    /// Reconstructs a record from persisted fields.
    #[allow(clippy::too_many_arguments)]
    pub fn from_storage(
        resource_type: impl Into<String>,
        logical_id: impl Into<String>,
        version: u64,
        is_deleted: bool,
        last_modified: DateTime<Utc>,
        method: Option<RecordMethod>,
        raw: Vec<u8>,
        meta_embedded: bool,
        search_param_hash: Option<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            logical_id: logical_id.into(),
            version,
            is_deleted,
            last_modified,
            method,
            raw,
            meta_embedded,
            search_param_hash,
        }
    }

    /// Resource type name.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Logical id.
    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    /// Version number, starting at 1.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether this version is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    /// When this version was written.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// The verb that produced this version, when known.
    pub fn method(&self) -> Option<RecordMethod> {
        self.method
    }

    /// The raw payload bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Whether the payload is known to carry `meta.versionId` /
    /// `meta.lastUpdated` matching this version.
    pub fn meta_embedded(&self) -> bool {
        self.meta_embedded
    }

    /// Hash of the extraction-rule set the index rows were built with.
    /// `None` on records written by older schemas; treat as stale.
    pub fn search_param_hash(&self) -> Option<&str> {
        self.search_param_hash.as_deref()
    }

    /// Whether this record's index rows predate the given rule-set hash.
    pub fn index_stale(&self, current_hash: &str) -> bool {
        match self.search_param_hash.as_deref() {
            Some(h) if !h.is_empty() => h != current_hash,
            _ => true,
        }
    }

    /// Weak ETag for the current version.
    pub fn etag(&self) -> String {
        format!("W/\"{}\"", self.version)
    }

    /// Key for this record's current version.
    pub fn key(&self) -> RecordKey {
        RecordKey::current(self.resource_type.clone(), self.logical_id.clone())
    }

    /// Payload parsed as JSON, when it is JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.raw).ok()
    }

    /// Restamps the rule-set hash after an in-place index rewrite.
    pub(crate) fn set_search_param_hash(&mut self, hash: Option<String>) {
        self.search_param_hash = hash;
    }

    /// Returns a copy whose payload carries this version's meta fields.
    ///
    /// Used on the read path when `meta_embedded` is false. Payloads that
    /// are not JSON objects are returned unchanged.
    pub fn with_embedded_meta(mut self) -> Self {
        if self.meta_embedded || self.raw.is_empty() {
            return self;
        }
        if let Some(patched) = embed_meta(&self.raw, self.version, self.last_modified) {
            self.raw = patched;
            self.meta_embedded = true;
        }
        self
    }
}

/// Rewrites `meta.versionId` and `meta.lastUpdated` inside a JSON payload.
///
/// Returns `None` when the payload is not a JSON object.
pub fn embed_meta(raw: &[u8], version: u64, last_modified: DateTime<Utc>) -> Option<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(raw).ok()?;
    let obj = value.as_object_mut()?;

    let meta = obj
        .entry("meta".to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(serde_json::Map::new());
    }
    let meta = meta.as_object_mut()?;
    meta.insert("versionId".to_string(), Value::String(version.to_string()));
    meta.insert(
        "lastUpdated".to_string(),
        Value::String(last_modified.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );

    serde_json::to_vec(&value).ok()
}

/// Normalizes a wire version expectation (`W/"3"`, `"3"`, or `3`).
pub fn parse_wire_version(s: &str) -> Option<u64> {
    s.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .parse()
        .ok()
}

/// An incoming record, before the engine assigns a version.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    /// Resource type name.
    pub resource_type: String,
    /// Logical id.
    pub logical_id: String,
    /// Opaque payload bytes.
    pub raw: Vec<u8>,
    /// Verb that produced the write.
    pub method: RecordMethod,
    /// True for tombstone drafts (the delete path only).
    pub is_deleted: bool,
}

impl RecordDraft {
    /// A draft carrying a payload.
    pub fn new(
        resource_type: impl Into<String>,
        logical_id: impl Into<String>,
        raw: Vec<u8>,
        method: RecordMethod,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            logical_id: logical_id.into(),
            raw,
            method,
            is_deleted: false,
        }
    }

    /// A tombstone draft with an empty payload.
    pub fn tombstone(
        resource_type: impl Into<String>,
        logical_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            logical_id: logical_id.into(),
            raw: Vec::new(),
            method: RecordMethod::Delete,
            is_deleted: true,
        }
    }
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    /// A new record was created at version 1.
    Created,
    /// An existing record gained a new version.
    Updated,
    /// Deleted-over-deleted: nothing was written.
    NoOp,
}

/// Result of a successful upsert.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// What happened.
    pub kind: UpsertKind,
    /// The version written, or `None` for a no-op.
    pub version: Option<u64>,
    /// Timestamp of the written version (upsert time for no-ops).
    pub last_modified: DateTime<Utc>,
}

impl UpsertOutcome {
    /// Outcome for a freshly created record.
    pub fn created(version: u64, last_modified: DateTime<Utc>) -> Self {
        Self {
            kind: UpsertKind::Created,
            version: Some(version),
            last_modified,
        }
    }

    /// Outcome for a new version of an existing record.
    pub fn updated(version: u64, last_modified: DateTime<Utc>) -> Self {
        Self {
            kind: UpsertKind::Updated,
            version: Some(version),
            last_modified,
        }
    }

    /// Outcome for a deleted-over-deleted no-op.
    pub fn noop(last_modified: DateTime<Utc>) -> Self {
        Self {
            kind: UpsertKind::NoOp,
            version: None,
            last_modified,
        }
    }
}
