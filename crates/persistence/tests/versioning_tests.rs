//! History, vread, and in-place index rewrite invariants.

mod common;

use lumen_persistence::core::{
    DeleteMode, IndexUpdate, IndexWriter, RecordScan, UpsertOptions, VersionedStore,
};
use lumen_persistence::error::ErrorKind;
use lumen_persistence::types::{IndexEntry, IndexValue, RecordKey};

use common::{memory_backend, patient_draft, seeded_registry, sqlite_backend};

// ============================================================================
// History traces
// ============================================================================

async fn versions_are_gap_free<S: VersionedStore>(store: &S) {
    for family in ["A", "B", "C", "D"] {
        store
            .upsert(patient_draft("p1", family), &UpsertOptions::unconditional())
            .await
            .unwrap();
    }
    store
        .delete(&RecordKey::current("Patient", "p1"), DeleteMode::Soft)
        .await
        .unwrap();

    let versions = store.list_versions("Patient", "p1").await.unwrap();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn versions_are_gap_free_memory() {
    versions_are_gap_free(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn versions_are_gap_free_sqlite() {
    versions_are_gap_free(&*sqlite_backend(&seeded_registry())).await;
}

// ============================================================================
// Versioned reads
// ============================================================================

async fn vread_returns_exact_rows<S: VersionedStore>(store: &S) {
    store
        .upsert(patient_draft("p1", "First"), &UpsertOptions::unconditional())
        .await
        .unwrap();
    store
        .upsert(patient_draft("p1", "Second"), &UpsertOptions::unconditional())
        .await
        .unwrap();

    let v1 = store
        .get(&RecordKey::versioned("Patient", "p1", 1))
        .await
        .unwrap();
    assert_eq!(v1.version(), 1);
    assert_eq!(v1.json().unwrap()["name"][0]["family"], "First");
    // Each history row carries its own meta.
    assert_eq!(v1.json().unwrap()["meta"]["versionId"], "1");

    let v2 = store
        .get(&RecordKey::versioned("Patient", "p1", 2))
        .await
        .unwrap();
    assert_eq!(v2.json().unwrap()["name"][0]["family"], "Second");
    assert_eq!(v2.json().unwrap()["meta"]["versionId"], "2");

    // A version that never existed is NotFound even though the record does
    // exist at a different version.
    let err = store
        .get(&RecordKey::versioned("Patient", "p1", 9))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn vread_returns_exact_rows_memory() {
    vread_returns_exact_rows(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn vread_returns_exact_rows_sqlite() {
    vread_returns_exact_rows(&*sqlite_backend(&seeded_registry())).await;
}

async fn vread_of_tombstone_version<S: VersionedStore>(store: &S) {
    store
        .upsert(patient_draft("p1", "Smith"), &UpsertOptions::unconditional())
        .await
        .unwrap();
    store
        .delete(&RecordKey::current("Patient", "p1"), DeleteMode::Soft)
        .await
        .unwrap();

    let tombstone = store
        .get(&RecordKey::versioned("Patient", "p1", 2))
        .await
        .unwrap();
    assert!(tombstone.is_deleted());
    assert!(tombstone.raw().is_empty());
}

#[tokio::test]
async fn vread_of_tombstone_version_memory() {
    vread_of_tombstone_version(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn vread_of_tombstone_version_sqlite() {
    vread_of_tombstone_version(&*sqlite_backend(&seeded_registry())).await;
}

// ============================================================================
// keep_history = false
// ============================================================================

async fn history_discarded_when_disabled<S: VersionedStore>(store: &S) {
    let options = UpsertOptions::unconditional().with_keep_history(false);
    store.upsert(patient_draft("p1", "A"), &options).await.unwrap();
    store.upsert(patient_draft("p1", "B"), &options).await.unwrap();
    store.upsert(patient_draft("p1", "C"), &options).await.unwrap();

    // Only the current version remains readable; the numbering still
    // advanced without gaps.
    assert_eq!(store.list_versions("Patient", "p1").await.unwrap(), vec![3]);
    let err = store
        .get(&RecordKey::versioned("Patient", "p1", 2))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn history_discarded_when_disabled_memory() {
    history_discarded_when_disabled(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn history_discarded_when_disabled_sqlite() {
    history_discarded_when_disabled(&*sqlite_backend(&seeded_registry())).await;
}

// ============================================================================
// In-place index rewrites
// ============================================================================

async fn update_index_leaves_record_untouched<S>(store: &S)
where
    S: VersionedStore + IndexWriter,
{
    store
        .upsert(patient_draft("p1", "Smith"), &UpsertOptions::unconditional())
        .await
        .unwrap();
    let before = store
        .get(&RecordKey::current("Patient", "p1"))
        .await
        .unwrap();

    let rewritten = store
        .update_index(IndexUpdate {
            resource_type: "Patient".to_string(),
            logical_id: "p1".to_string(),
            expected_version: before.version(),
            search_param_hash: "rewritten-hash".to_string(),
            entries: vec![IndexEntry::new(
                "family",
                "http://example.org/sp/Patient-family",
                IndexValue::string("Smith"),
            )],
        })
        .await
        .unwrap();
    assert_eq!(rewritten.search_param_hash(), Some("rewritten-hash"));

    let after = store
        .get(&RecordKey::current("Patient", "p1"))
        .await
        .unwrap();
    assert_eq!(after.version(), before.version());
    assert_eq!(after.last_modified(), before.last_modified());
    assert_eq!(after.raw(), before.raw());
    assert_eq!(after.search_param_hash(), Some("rewritten-hash"));
}

#[tokio::test]
async fn update_index_leaves_record_untouched_memory() {
    update_index_leaves_record_untouched(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn update_index_leaves_record_untouched_sqlite() {
    update_index_leaves_record_untouched(&*sqlite_backend(&seeded_registry())).await;
}

async fn update_index_preconditions<S>(store: &S)
where
    S: VersionedStore + IndexWriter,
{
    store
        .upsert(patient_draft("p1", "Smith"), &UpsertOptions::unconditional())
        .await
        .unwrap();

    let stale = IndexUpdate {
        resource_type: "Patient".to_string(),
        logical_id: "p1".to_string(),
        expected_version: 9,
        search_param_hash: "h".to_string(),
        entries: vec![],
    };
    let err = store.update_index(stale).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    let missing = IndexUpdate {
        resource_type: "Patient".to_string(),
        logical_id: "ghost".to_string(),
        expected_version: 1,
        search_param_hash: "h".to_string(),
        entries: vec![],
    };
    let err = store.update_index(missing).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn update_index_preconditions_memory() {
    update_index_preconditions(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn update_index_preconditions_sqlite() {
    update_index_preconditions(&*sqlite_backend(&seeded_registry())).await;
}

async fn batch_is_atomic<S>(store: &S)
where
    S: VersionedStore + IndexWriter,
{
    store
        .upsert(patient_draft("p1", "Smith"), &UpsertOptions::unconditional())
        .await
        .unwrap();
    let good = store
        .get(&RecordKey::current("Patient", "p1"))
        .await
        .unwrap();

    let updates = vec![
        IndexUpdate {
            resource_type: "Patient".to_string(),
            logical_id: "p1".to_string(),
            expected_version: good.version(),
            search_param_hash: "batch-hash".to_string(),
            entries: vec![],
        },
        // Second target fails its precondition, so the first must not land.
        IndexUpdate {
            resource_type: "Patient".to_string(),
            logical_id: "ghost".to_string(),
            expected_version: 1,
            search_param_hash: "batch-hash".to_string(),
            entries: vec![],
        },
    ];
    let err = store.update_indices_batch(updates).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let after = store
        .get(&RecordKey::current("Patient", "p1"))
        .await
        .unwrap();
    assert_ne!(after.search_param_hash(), Some("batch-hash"));
}

#[tokio::test]
async fn batch_is_atomic_memory() {
    batch_is_atomic(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn batch_is_atomic_sqlite() {
    batch_is_atomic(&*sqlite_backend(&seeded_registry())).await;
}

// ============================================================================
// Record paging
// ============================================================================

async fn paging_covers_all_records<S>(store: &S)
where
    S: VersionedStore + RecordScan,
{
    for i in 0..7 {
        store
            .upsert(
                patient_draft(&format!("p{}", i), "Smith"),
                &UpsertOptions::unconditional(),
            )
            .await
            .unwrap();
    }
    assert_eq!(store.count_records("Patient").await.unwrap(), 7);

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = store
            .page_records("Patient", cursor.as_deref(), 3)
            .await
            .unwrap();
        seen.extend(page.records.iter().map(|r| r.logical_id().to_string()));
        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(seen.len(), 7);
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted);
}

#[tokio::test]
async fn paging_covers_all_records_memory() {
    paging_covers_all_records(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn paging_covers_all_records_sqlite() {
    paging_covers_all_records(&*sqlite_backend(&seeded_registry())).await;
}
