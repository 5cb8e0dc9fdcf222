//! In-memory document-store backend.
//!
//! Ordered maps guarded by a single state lock. Every read-check-write runs
//! under one exclusive acquisition, which is this backend's conditional-write
//! primitive: the upsert contract holds without per-record locks. Useful as
//! the document-store deployment shape and for tests.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::core::{
    DeleteMode, IndexUpdate, IndexWriter, JobStore, LeasedJob, RecordPage, RecordScan,
    ReindexJob, ReindexJobId, UpsertOptions, VersionedStore,
};
use crate::core::jobs::JobEtag;
use crate::error::{
    ConcurrencyError, JobError, RecordError, StoreResult,
};
use crate::search::ParamExtractor;
use crate::types::{
    dedup_entries, IndexEntry, RecordDraft, RecordKey, StoredRecord, UpsertOutcome,
};

/// The current row for a record, with the storage-level replace guard.
#[derive(Debug, Clone)]
struct CurrentRow {
    record: StoredRecord,
    row_version: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Current version per record, ordered by (type, id) for paging.
    current: BTreeMap<(String, String), CurrentRow>,
    /// Every retained version, including the current one.
    history: BTreeMap<(String, String, u64), StoredRecord>,
    /// Index rows for current non-deleted versions only.
    index: HashMap<(String, String), Vec<IndexEntry>>,
    /// Reindex jobs.
    jobs: HashMap<String, (ReindexJob, JobEtag)>,
}

/// Document-store backend held entirely in process memory.
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
    extractor: Arc<ParamExtractor>,
}

impl MemoryBackend {
    /// Creates an empty backend indexing through the given extractor.
    pub fn new(extractor: Arc<ParamExtractor>) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            extractor,
        }
    }

    fn materialize(&self, draft: &RecordDraft, version: u64) -> StoredRecord {
        super::materialize_draft(&self.extractor, draft, version)
    }

    /// Writes a version as current, mirrors it into history, and rewrites
    /// index rows. Caller holds the state lock.
    fn commit(
        &self,
        state: &mut MemoryState,
        record: StoredRecord,
        row_version: u64,
    ) {
        let key = (
            record.resource_type().to_string(),
            record.logical_id().to_string(),
        );
        let entries = if record.is_deleted() {
            Vec::new()
        } else {
            self.extractor.extract(record.resource_type(), record.raw())
        };
        if entries.is_empty() {
            state.index.remove(&key);
        } else {
            state.index.insert(key.clone(), entries);
        }
        state.history.insert(
            (key.0.clone(), key.1.clone(), record.version()),
            record.clone(),
        );
        state.current.insert(
            key,
            CurrentRow {
                record,
                row_version,
            },
        );
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryBackend")
            .field("records", &state.current.len())
            .field("jobs", &state.jobs.len())
            .finish()
    }
}

#[async_trait]
impl VersionedStore for MemoryBackend {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(
        &self,
        draft: RecordDraft,
        options: &UpsertOptions,
    ) -> StoreResult<UpsertOutcome> {
        let mut state = self.state.write();
        let key = (draft.resource_type.clone(), draft.logical_id.clone());

        match state.current.get(&key) {
            None => {
                if options.if_match.is_some() {
                    return Err(RecordError::NotFound {
                        resource_type: draft.resource_type,
                        logical_id: draft.logical_id,
                    }
                    .into());
                }
                if !options.allow_create {
                    return Err(RecordError::MethodNotAllowed {
                        reason: format!(
                            "create is not allowed for {}",
                            draft.resource_type
                        ),
                    }
                    .into());
                }
                let record = self.materialize(&draft, 1);
                let last_modified = record.last_modified();
                self.commit(&mut state, record, 1);
                Ok(UpsertOutcome::created(1, last_modified))
            }
            Some(current) => {
                let current_version = current.record.version();
                if let Some(expected) = options.if_match {
                    if expected != current_version {
                        return Err(ConcurrencyError::PreconditionFailed {
                            resource_type: draft.resource_type,
                            logical_id: draft.logical_id,
                            expected,
                            actual: current_version,
                        }
                        .into());
                    }
                }
                if current.record.is_deleted() && draft.is_deleted {
                    return Ok(UpsertOutcome::noop(Utc::now()));
                }

                let row_version = current.row_version + 1;
                let new_version = current_version + 1;
                if !options.keep_history {
                    let from = (key.0.clone(), key.1.clone(), 0);
                    let to = (key.0.clone(), key.1.clone(), u64::MAX);
                    let stale: Vec<_> = state
                        .history
                        .range((Bound::Included(from), Bound::Included(to)))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in stale {
                        state.history.remove(&k);
                    }
                }
                let record = self.materialize(&draft, new_version);
                let last_modified = record.last_modified();
                self.commit(&mut state, record, row_version);
                Ok(UpsertOutcome::updated(new_version, last_modified))
            }
        }
    }

    async fn get(&self, key: &RecordKey) -> StoreResult<StoredRecord> {
        let state = self.state.read();
        match key.version {
            Some(version) => {
                let record = state
                    .history
                    .get(&(key.resource_type.clone(), key.logical_id.clone(), version))
                    .cloned()
                    .ok_or_else(|| RecordError::VersionNotFound {
                        resource_type: key.resource_type.clone(),
                        logical_id: key.logical_id.clone(),
                        version,
                    })?;
                Ok(record.with_embedded_meta())
            }
            None => {
                let row = state
                    .current
                    .get(&(key.resource_type.clone(), key.logical_id.clone()))
                    .ok_or_else(|| RecordError::NotFound {
                        resource_type: key.resource_type.clone(),
                        logical_id: key.logical_id.clone(),
                    })?;
                if row.record.is_deleted() {
                    return Err(RecordError::Gone {
                        resource_type: key.resource_type.clone(),
                        logical_id: key.logical_id.clone(),
                        deleted_at: Some(row.record.last_modified()),
                    }
                    .into());
                }
                Ok(row.record.clone().with_embedded_meta())
            }
        }
    }

    async fn delete(&self, key: &RecordKey, mode: DeleteMode) -> StoreResult<Option<u64>> {
        if key.version.is_some() {
            return Err(RecordError::MethodNotAllowed {
                reason: "cannot delete a specific version".to_string(),
            }
            .into());
        }
        let mut state = self.state.write();
        let map_key = (key.resource_type.clone(), key.logical_id.clone());

        match mode {
            DeleteMode::Soft => {
                let Some(current) = state.current.get(&map_key) else {
                    return Ok(None);
                };
                if current.record.is_deleted() {
                    return Ok(None);
                }
                let new_version = current.record.version() + 1;
                let row_version = current.row_version + 1;
                let draft = RecordDraft::tombstone(&key.resource_type, &key.logical_id);
                let record = self.materialize(&draft, new_version);
                self.commit(&mut state, record, row_version);
                Ok(Some(new_version))
            }
            DeleteMode::Hard => {
                state.current.remove(&map_key);
                state.index.remove(&map_key);
                let from = (map_key.0.clone(), map_key.1.clone(), 0);
                let to = (map_key.0.clone(), map_key.1.clone(), u64::MAX);
                let all: Vec<_> = state
                    .history
                    .range((Bound::Included(from), Bound::Included(to)))
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in all {
                    state.history.remove(&k);
                }
                Ok(None)
            }
        }
    }

    async fn list_versions(
        &self,
        resource_type: &str,
        logical_id: &str,
    ) -> StoreResult<Vec<u64>> {
        let state = self.state.read();
        let from = (resource_type.to_string(), logical_id.to_string(), 0);
        let to = (resource_type.to_string(), logical_id.to_string(), u64::MAX);
        Ok(state
            .history
            .range((Bound::Included(from), Bound::Included(to)))
            .map(|((_, _, version), _)| *version)
            .collect())
    }
}

#[async_trait]
impl RecordScan for MemoryBackend {
    async fn page_records(
        &self,
        resource_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<RecordPage> {
        let state = self.state.read();
        let start = (
            resource_type.to_string(),
            after.map(str::to_string).unwrap_or_default(),
        );
        let mut records = Vec::new();
        let mut next = None;
        for ((rt, id), row) in state
            .current
            .range((Bound::Excluded(start.clone()), Bound::Unbounded))
        {
            if rt != resource_type {
                break;
            }
            if let Some(after) = after {
                if id.as_str() <= after {
                    continue;
                }
            }
            if row.record.is_deleted() {
                continue;
            }
            if records.len() == limit {
                next = records
                    .last()
                    .map(|r: &StoredRecord| r.logical_id().to_string());
                break;
            }
            records.push(row.record.clone());
        }
        Ok(RecordPage { records, next })
    }

    async fn count_records(&self, resource_type: &str) -> StoreResult<u64> {
        let state = self.state.read();
        let start = (resource_type.to_string(), String::new());
        let count = state
            .current
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|((rt, _), _)| rt == resource_type)
            .filter(|(_, row)| !row.record.is_deleted())
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl IndexWriter for MemoryBackend {
    async fn update_index(&self, update: IndexUpdate) -> StoreResult<StoredRecord> {
        let mut state = self.state.write();
        apply_index_update(&mut state, &update)?;
        let key = (update.resource_type, update.logical_id);
        state
            .current
            .get(&key)
            .map(|row| row.record.clone())
            .ok_or_else(|| {
                RecordError::NotFound {
                    resource_type: key.0.clone(),
                    logical_id: key.1.clone(),
                }
                .into()
            })
    }

    async fn update_indices_batch(&self, updates: Vec<IndexUpdate>) -> StoreResult<()> {
        let mut state = self.state.write();
        // Validate the whole batch before touching anything: the batch
        // precondition is all-or-nothing.
        for update in &updates {
            check_index_target(&state, update)?;
        }
        for update in &updates {
            apply_index_update(&mut state, update)?;
        }
        Ok(())
    }
}

fn check_index_target(state: &MemoryState, update: &IndexUpdate) -> StoreResult<()> {
    let key = (update.resource_type.clone(), update.logical_id.clone());
    let row = state.current.get(&key).ok_or_else(|| RecordError::NotFound {
        resource_type: update.resource_type.clone(),
        logical_id: update.logical_id.clone(),
    })?;
    if row.record.is_deleted() {
        return Err(RecordError::NotFound {
            resource_type: update.resource_type.clone(),
            logical_id: update.logical_id.clone(),
        }
        .into());
    }
    if row.record.version() != update.expected_version {
        return Err(ConcurrencyError::PreconditionFailed {
            resource_type: update.resource_type.clone(),
            logical_id: update.logical_id.clone(),
            expected: update.expected_version,
            actual: row.record.version(),
        }
        .into());
    }
    Ok(())
}

fn apply_index_update(state: &mut MemoryState, update: &IndexUpdate) -> StoreResult<()> {
    check_index_target(state, update)?;
    let key = (update.resource_type.clone(), update.logical_id.clone());
    let Some(row) = state.current.get_mut(&key) else {
        return Err(RecordError::NotFound {
            resource_type: update.resource_type.clone(),
            logical_id: update.logical_id.clone(),
        }
        .into());
    };
    row.record
        .set_search_param_hash(Some(update.search_param_hash.clone()));
    row.row_version += 1;
    let entries = dedup_entries(update.entries.clone());
    if entries.is_empty() {
        state.index.remove(&key);
    } else {
        state.index.insert(key, entries);
    }
    Ok(())
}

#[async_trait]
impl JobStore for MemoryBackend {
    async fn create_job(&self, mut job: ReindexJob) -> StoreResult<LeasedJob> {
        let mut state = self.state.write();
        if let Some((active, _)) = state
            .jobs
            .values()
            .find(|(job, _)| !job.status.is_terminal())
        {
            return Err(JobError::ActiveJobExists {
                id: active.id.to_string(),
            }
            .into());
        }
        job.last_modified = Utc::now();
        let etag = JobEtag::mint();
        state
            .jobs
            .insert(job.id.to_string(), (job.clone(), etag.clone()));
        Ok(LeasedJob { job, etag })
    }

    async fn get_job(&self, id: &ReindexJobId) -> StoreResult<LeasedJob> {
        let state = self.state.read();
        state
            .jobs
            .get(id.as_str())
            .map(|(job, etag)| LeasedJob {
                job: job.clone(),
                etag: etag.clone(),
            })
            .ok_or_else(|| {
                JobError::NotFound {
                    id: id.to_string(),
                }
                .into()
            })
    }

    async fn update_job(&self, mut job: ReindexJob, etag: &JobEtag) -> StoreResult<LeasedJob> {
        let mut state = self.state.write();
        let stored = state.jobs.get_mut(job.id.as_str()).ok_or_else(|| {
            JobError::NotFound {
                id: job.id.to_string(),
            }
        })?;
        if stored.0.status.is_terminal() {
            return Err(JobError::TerminalState {
                id: job.id.to_string(),
                status: stored.0.status.to_string(),
            }
            .into());
        }
        if &stored.1 != etag {
            return Err(JobError::EtagMismatch {
                id: job.id.to_string(),
            }
            .into());
        }
        let now = Utc::now();
        job.heartbeat_at = Some(now);
        job.last_modified = now;
        let new_etag = JobEtag::mint();
        *stored = (job.clone(), new_etag.clone());
        Ok(LeasedJob {
            job,
            etag: new_etag,
        })
    }

    async fn acquire_jobs(&self, max: usize, threshold: Duration) -> StoreResult<Vec<LeasedJob>> {
        let mut state = self.state.write();
        let now = Utc::now();
        let mut candidates: Vec<String> = state
            .jobs
            .values()
            .filter(|(job, _)| job.acquirable(threshold, now))
            .map(|(job, _)| job.id.to_string())
            .collect();
        candidates.sort();
        candidates.truncate(max);

        let mut leased = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(stored) = state.jobs.get_mut(&id) else {
                continue;
            };
            stored.0.status = crate::core::ReindexStatus::Running;
            stored.0.heartbeat_at = Some(now);
            stored.0.last_modified = now;
            stored.1 = JobEtag::mint();
            leased.push(LeasedJob {
                job: stored.0.clone(),
                etag: stored.1.clone(),
            });
        }
        Ok(leased)
    }

    async fn check_active(&self) -> StoreResult<Option<ReindexJobId>> {
        let state = self.state.read();
        Ok(state
            .jobs
            .values()
            .find(|(job, _)| !job.status.is_terminal())
            .map(|(job, _)| job.id.clone()))
    }

    async fn purge_job(&self, id: &ReindexJobId) -> StoreResult<()> {
        let mut state = self.state.write();
        state.jobs.remove(id.as_str()).ok_or_else(|| {
            JobError::NotFound {
                id: id.to_string(),
            }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchParameterRegistry;
    use crate::types::RecordMethod;
    use serde_json::json;

    fn backend() -> MemoryBackend {
        let registry = Arc::new(RwLock::new(SearchParameterRegistry::new()));
        MemoryBackend::new(Arc::new(ParamExtractor::new(registry)))
    }

    fn draft(id: &str, body: serde_json::Value) -> RecordDraft {
        RecordDraft::new(
            "Patient",
            id,
            serde_json::to_vec(&body).unwrap(),
            RecordMethod::Put,
        )
    }

    #[tokio::test]
    async fn paging_orders_by_id_and_skips_tombstones() {
        let backend = backend();
        for id in ["c", "a", "b", "d"] {
            backend
                .upsert(draft(id, json!({"resourceType": "Patient"})), &UpsertOptions::unconditional())
                .await
                .unwrap();
        }
        backend
            .delete(&RecordKey::current("Patient", "b"), DeleteMode::Soft)
            .await
            .unwrap();

        let page = backend.page_records("Patient", None, 2).await.unwrap();
        let ids: Vec<_> = page.records.iter().map(|r| r.logical_id()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        let page = backend
            .page_records("Patient", page.next.as_deref(), 2)
            .await
            .unwrap();
        let ids: Vec<_> = page.records.iter().map(|r| r.logical_id()).collect();
        assert_eq!(ids, vec!["d"]);
        assert!(page.next.is_none());

        assert_eq!(backend.count_records("Patient").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn keep_history_false_discards_prior_versions() {
        let backend = backend();
        let options = UpsertOptions::unconditional();
        backend
            .upsert(draft("p1", json!({"v": 1})), &options)
            .await
            .unwrap();
        backend
            .upsert(
                draft("p1", json!({"v": 2})),
                &options.clone().with_keep_history(false),
            )
            .await
            .unwrap();

        assert_eq!(
            backend.list_versions("Patient", "p1").await.unwrap(),
            vec![2]
        );
    }
}
