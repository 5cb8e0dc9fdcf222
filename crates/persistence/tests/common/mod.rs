//! Shared helpers for backend integration tests.
//!
//! Every scenario runs against both backends through generic functions; the
//! helpers here build the backends, the shared rule registry, and fixture
//! payloads.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;

use lumen_persistence::backends::{MemoryBackend, SqliteBackend};
use lumen_persistence::search::{
    ParamExtractor, ParamStatus, SearchParameterDefinition, SearchParameterRegistry,
};
use lumen_persistence::types::{ParamKind, RecordDraft, RecordMethod};

pub type SharedRegistry = Arc<RwLock<SearchParameterRegistry>>;

/// A registry preloaded with a searchable Patient name rule and a
/// searchable Observation code rule.
pub fn seeded_registry() -> SharedRegistry {
    let mut registry = SearchParameterRegistry::new();
    registry.register(
        SearchParameterDefinition::new(
            "http://example.org/sp/Patient-family",
            "family",
            ParamKind::String,
            "Patient.name.family",
        )
        .with_base(vec!["Patient"])
        .with_status(ParamStatus::Searchable),
    );
    registry.register(
        SearchParameterDefinition::new(
            "http://example.org/sp/Observation-code",
            "code",
            ParamKind::Token,
            "Observation.code",
        )
        .with_base(vec!["Observation"])
        .with_status(ParamStatus::Searchable),
    );
    Arc::new(RwLock::new(registry))
}

pub fn empty_registry() -> SharedRegistry {
    Arc::new(RwLock::new(SearchParameterRegistry::new()))
}

pub fn memory_backend(registry: &SharedRegistry) -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(Arc::new(ParamExtractor::new(
        Arc::clone(registry),
    ))))
}

pub fn sqlite_backend(registry: &SharedRegistry) -> Arc<SqliteBackend> {
    Arc::new(
        SqliteBackend::in_memory(Arc::new(ParamExtractor::new(Arc::clone(registry))))
            .expect("failed to create sqlite backend"),
    )
}

pub fn patient_draft(id: &str, family: &str) -> RecordDraft {
    let payload = json!({
        "resourceType": "Patient",
        "id": id,
        "name": [{"family": family}]
    });
    RecordDraft::new(
        "Patient",
        id,
        serde_json::to_vec(&payload).expect("serialize fixture"),
        RecordMethod::Put,
    )
}

pub fn observation_draft(id: &str, code: &str) -> RecordDraft {
    let payload = json!({
        "resourceType": "Observation",
        "id": id,
        "status": "final",
        "code": {"coding": [{"system": "http://loinc.org", "code": code}]}
    });
    RecordDraft::new(
        "Observation",
        id,
        serde_json::to_vec(&payload).expect("serialize fixture"),
        RecordMethod::Put,
    )
}
