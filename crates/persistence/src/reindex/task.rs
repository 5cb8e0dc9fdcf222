//! Per-job reindex state machine.
//!
//! The task pages through each targeted resource type, re-extracts index
//! rows for the full materializable rule set, writes them through the index
//! writer, and persists the job after every batch. That persisted update is
//! also the heartbeat: a task that cannot checkpoint cannot hold its lease.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::core::{
    Checkpoint, IndexUpdate, JobStore, LeasedJob, ReindexStore, ReindexStatus, ResourceProgress,
};
use crate::error::{ErrorKind, JobError, StoreError, StoreResult};
use crate::search::{extract_values, SupportResolver};
use crate::types::{RecordKey, StoredRecord};

use super::throttle::ThrottleOracle;

/// Bounded retries for conflicting job updates.
const CHECKPOINT_RETRIES: u32 = 5;

/// Drives one leased job to a terminal state (or hands it back by expiring).
pub struct ReindexTask {
    store: Arc<dyn ReindexStore>,
    jobs: Arc<dyn JobStore>,
    resolver: Arc<dyn SupportResolver>,
    throttle: Arc<dyn ThrottleOracle>,
}

/// Why the task stopped before completing.
enum Stop {
    /// The cancel signal fired; persist `Canceled` unless the worker itself
    /// is terminating.
    Canceled,
    /// The job was taken over or finished elsewhere; exit silently.
    LostLease,
    /// Unrecoverable failure; persist `Failed` with the reason.
    Failed(String),
}

impl ReindexTask {
    /// Creates a task over the engine's collaborators.
    pub fn new(
        store: Arc<dyn ReindexStore>,
        jobs: Arc<dyn JobStore>,
        resolver: Arc<dyn SupportResolver>,
        throttle: Arc<dyn ThrottleOracle>,
    ) -> Self {
        Self {
            store,
            jobs,
            resolver,
            throttle,
        }
    }

    /// Runs the job to a terminal state.
    ///
    /// `cancel` is this job's cancel handle (a child of `shutdown`);
    /// `shutdown` is the worker's own signal. On worker shutdown the job is
    /// left `Running` so another worker can pick it up after lease expiry.
    pub async fn run(
        &self,
        lease: LeasedJob,
        cancel: CancellationToken,
        shutdown: CancellationToken,
    ) {
        let job_id = lease.job.id.clone();
        match self.drive(lease, &cancel).await {
            Ok(()) => {}
            Err((lease, Stop::Canceled)) => {
                if shutdown.is_cancelled() {
                    tracing::info!(%job_id, "worker shutting down; releasing job");
                } else {
                    self.persist_canceled(lease).await;
                }
            }
            Err((_, Stop::LostLease)) => {
                tracing::info!(%job_id, "job lease lost; yielding");
            }
            Err((lease, Stop::Failed(reason))) => {
                tracing::warn!(%job_id, %reason, "reindex job failed");
                self.persist_failed(lease, reason).await;
            }
        }
    }

    async fn drive(&self, mut lease: LeasedJob, cancel: &CancellationToken) -> Result<(), (LeasedJob, Stop)> {
        if lease.job.scope.expected_hashes.is_empty() && lease.job.progress.is_empty() {
            match self.plan_targets(&mut lease.job).await {
                Ok(()) => {}
                Err(e) => return Err((lease, Stop::Failed(e.to_string()))),
            }
            lease = self.checkpoint(lease).await?;
        }

        while let Some(checkpoint) = lease.job.continuation.clone() {
            if cancel.is_cancelled() {
                return Err((lease, Stop::Canceled));
            }

            let plan = self.throttle.plan();
            if !plan.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(plan.delay) => {}
                    _ = cancel.cancelled() => return Err((lease, Stop::Canceled)),
                }
            }

            let page = match self
                .store
                .page_records(
                    &checkpoint.resource_type,
                    checkpoint.after.as_deref(),
                    plan.batch_size,
                )
                .await
            {
                Ok(page) => page,
                Err(e) if e.kind() == ErrorKind::RateLimited => {
                    self.throttle.record_rate_limited();
                    continue;
                }
                Err(e) => return Err((lease, Stop::Failed(e.to_string()))),
            };

            let expected_hash = lease
                .job
                .scope
                .expected_hashes
                .get(&checkpoint.resource_type)
                .cloned()
                .unwrap_or_default();

            let (processed, failed) = match self
                .reindex_page(&checkpoint.resource_type, &expected_hash, &page.records)
                .await
            {
                Ok(counts) => counts,
                Err(Stop::Canceled) => return Err((lease, Stop::Canceled)),
                Err(stop) => return Err((lease, stop)),
            };

            lease
                .job
                .record_processed(&checkpoint.resource_type, processed, failed);
            lease.job.continuation = match page.next {
                Some(after) => Some(Checkpoint {
                    resource_type: checkpoint.resource_type,
                    after: Some(after),
                }),
                None => self.next_type(&lease.job, &checkpoint.resource_type),
            };
            lease = self.checkpoint(lease).await?;
        }

        self.complete(lease).await
    }

    /// Computes the target set on the first scheduling pulse: every type
    /// with rules awaiting promotion, its expected hash, and its fixed
    /// record count.
    async fn plan_targets(&self, job: &mut crate::core::ReindexJob) -> StoreResult<()> {
        let requested: Vec<String> = job.scope.param_urls.clone();
        let mut target_urls = std::collections::BTreeSet::new();

        for resource_type in self.resolver.resource_types() {
            let pending = self.resolver.supported_but_not_searchable(&resource_type);
            let targeted: Vec<_> = pending
                .into_iter()
                .filter(|p| requested.is_empty() || requested.contains(&p.url))
                .collect();
            if targeted.is_empty() {
                continue;
            }
            job.scope
                .expected_hashes
                .insert(resource_type.clone(), self.resolver.hash(&resource_type));
            let total = self.store.count_records(&resource_type).await?;
            job.progress.insert(
                resource_type,
                ResourceProgress {
                    total,
                    processed: 0,
                    failed: 0,
                },
            );
            target_urls.extend(targeted.into_iter().map(|p| p.url.clone()));
        }

        job.scope.param_urls = target_urls.into_iter().collect();
        job.continuation = job
            .scope
            .expected_hashes
            .keys()
            .next()
            .map(|resource_type| Checkpoint {
                resource_type: resource_type.clone(),
                after: None,
            });
        tracing::info!(
            job_id = %job.id,
            types = job.scope.expected_hashes.len(),
            params = job.scope.param_urls.len(),
            total = job.total_records(),
            "planned reindex targets"
        );
        Ok(())
    }

    /// Rewrites one page of records, batch-first with a per-record fallback
    /// when the batch precondition fails. Returns (processed, failed).
    async fn reindex_page(
        &self,
        resource_type: &str,
        expected_hash: &str,
        records: &[StoredRecord],
    ) -> Result<(u64, u64), Stop> {
        if records.is_empty() {
            return Ok((0, 0));
        }
        let params = self.resolver.materializable_parameters(resource_type);
        let updates: Vec<IndexUpdate> = records
            .iter()
            .map(|record| {
                let entries = record
                    .json()
                    .and_then(|payload| {
                        extract_values(&params, resource_type, &payload).ok()
                    })
                    .unwrap_or_default();
                IndexUpdate {
                    resource_type: resource_type.to_string(),
                    logical_id: record.logical_id().to_string(),
                    expected_version: record.version(),
                    search_param_hash: expected_hash.to_string(),
                    entries,
                }
            })
            .collect();

        loop {
            match self.store.update_indices_batch(updates.clone()).await {
                Ok(()) => {
                    self.throttle.record_success();
                    return Ok((updates.len() as u64, 0));
                }
                Err(e) if e.kind() == ErrorKind::RateLimited => {
                    // Feed the oracle and retry the same page at its new pace.
                    self.throttle.record_rate_limited();
                    let delay = self.throttle.plan().delay;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::PreconditionFailed | ErrorKind::NotFound
                    ) =>
                {
                    // A record moved under the batch; settle each one alone.
                    return Ok(self.reindex_individually(resource_type, expected_hash, updates).await);
                }
                Err(e) if e.kind() == ErrorKind::Canceled => return Err(Stop::Canceled),
                Err(e) => return Err(Stop::Failed(e.to_string())),
            }
        }
    }

    /// Per-record fallback: re-reads each record and rewrites against its
    /// fresh version. Records upserted mid-job already carry the current
    /// hash and are counted processed without a write.
    async fn reindex_individually(
        &self,
        resource_type: &str,
        expected_hash: &str,
        updates: Vec<IndexUpdate>,
    ) -> (u64, u64) {
        let params = self.resolver.materializable_parameters(resource_type);
        let mut processed = 0u64;
        let mut failed = 0u64;

        for update in updates {
            let key = RecordKey::current(resource_type, &update.logical_id);
            let fresh = match self.store.get(&key).await {
                Ok(record) => record,
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::Gone) => {
                    // Deleted mid-job; nothing left to index.
                    processed += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "reindex read failed");
                    failed += 1;
                    continue;
                }
            };
            if !fresh.index_stale(expected_hash) {
                processed += 1;
                continue;
            }
            let entries = fresh
                .json()
                .and_then(|payload| extract_values(&params, resource_type, &payload).ok())
                .unwrap_or_default();
            let rewrite = IndexUpdate {
                resource_type: resource_type.to_string(),
                logical_id: update.logical_id.clone(),
                expected_version: fresh.version(),
                search_param_hash: expected_hash.to_string(),
                entries,
            };
            match self.store.update_index(rewrite).await {
                Ok(_) => processed += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "reindex rewrite failed");
                    failed += 1;
                }
            }
        }
        (processed, failed)
    }

    /// Next targeted type after the one just exhausted, in scope order.
    fn next_type(
        &self,
        job: &crate::core::ReindexJob,
        finished: &str,
    ) -> Option<Checkpoint> {
        job.scope
            .expected_hashes
            .range::<str, _>((
                std::ops::Bound::Excluded(finished),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|(resource_type, _)| Checkpoint {
                resource_type: resource_type.clone(),
                after: None,
            })
    }

    /// All types exhausted: a clean run verifies the rule set did not drift,
    /// promotes the targeted rules, and persists `Completed`. Any per-record
    /// failures mark the job `Failed` instead; the rows already written stay
    /// (each is correct in isolation).
    async fn complete(&self, mut lease: LeasedJob) -> Result<(), (LeasedJob, Stop)> {
        let failed = lease.job.failed_records();
        if failed > 0 {
            return Err((
                lease,
                Stop::Failed(format!("{} records could not be reindexed", failed)),
            ));
        }

        let mut drifted = None;
        for (resource_type, expected) in &lease.job.scope.expected_hashes {
            let current = self.resolver.hash(resource_type);
            if &current != expected {
                drifted = Some(resource_type.clone());
                break;
            }
        }
        if let Some(resource_type) = drifted {
            return Err((
                lease,
                Stop::Failed(format!(
                    "search parameter set for {} changed during reindex",
                    resource_type
                )),
            ));
        }

        if let Err(e) = self.resolver.promote(&lease.job.scope.param_urls).await {
            return Err((lease, Stop::Failed(e.to_string())));
        }

        lease.job.status = ReindexStatus::Completed;
        lease.job.continuation = None;
        let job_id = lease.job.id.clone();
        self.checkpoint(lease).await?;
        tracing::info!(%job_id, "reindex job completed");
        Ok(())
    }

    /// Persists the job, retrying stale-etag conflicts a bounded number of
    /// times. A job turned terminal elsewhere surfaces as a lost lease /
    /// cancel so the caller abandons further batches.
    async fn checkpoint(&self, mut lease: LeasedJob) -> Result<LeasedJob, (LeasedJob, Stop)> {
        let mut backoff = std::time::Duration::from_millis(25);
        for attempt in 0..=CHECKPOINT_RETRIES {
            match self.jobs.update_job(lease.job.clone(), &lease.etag).await {
                Ok(updated) => return Ok(updated),
                Err(StoreError::Job(JobError::TerminalState { .. })) => {
                    // Canceled (or otherwise finished) from outside.
                    return Err((lease, Stop::LostLease));
                }
                Err(e) if e.kind() == ErrorKind::PreconditionFailed => {
                    let fresh = match self.jobs.get_job(&lease.job.id).await {
                        Ok(fresh) => fresh,
                        Err(e) => return Err((lease, Stop::Failed(e.to_string()))),
                    };
                    if fresh.job.status.is_terminal() {
                        return Err((lease, Stop::LostLease));
                    }
                    if attempt == CHECKPOINT_RETRIES {
                        return Err((
                            lease,
                            Stop::Failed("job update conflicts exceeded retry bound".to_string()),
                        ));
                    }
                    lease.etag = fresh.etag;
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err((lease, Stop::Failed(e.to_string()))),
            }
        }
        Err((
            lease,
            Stop::Failed("job update conflicts exceeded retry bound".to_string()),
        ))
    }

    /// Best-effort persistence of `Canceled`; the cancel command usually got
    /// there first, in which case the fresh read shows a terminal job.
    async fn persist_canceled(&self, lease: LeasedJob) {
        let id = lease.job.id.clone();
        let mut lease = lease;
        for _ in 0..=CHECKPOINT_RETRIES {
            lease.job.status = ReindexStatus::Canceled;
            lease.job.canceled_at = Some(Utc::now());
            match self.jobs.update_job(lease.job.clone(), &lease.etag).await {
                Ok(_) => {
                    tracing::info!(job_id = %id, "reindex job canceled");
                    return;
                }
                Err(StoreError::Job(JobError::TerminalState { .. })) => return,
                Err(e) if e.kind() == ErrorKind::PreconditionFailed => {
                    match self.jobs.get_job(&id).await {
                        Ok(fresh) if fresh.job.status.is_terminal() => return,
                        Ok(fresh) => lease = fresh,
                        Err(_) => return,
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "failed to persist cancellation");
                    return;
                }
            }
        }
    }

    /// Best-effort persistence of `Failed` with its reason.
    async fn persist_failed(&self, lease: LeasedJob, reason: String) {
        let id = lease.job.id.clone();
        let mut lease = lease;
        for _ in 0..=CHECKPOINT_RETRIES {
            lease.job.status = ReindexStatus::Failed;
            lease.job.failure_reason = Some(reason.clone());
            match self.jobs.update_job(lease.job.clone(), &lease.etag).await {
                Ok(_) => return,
                Err(StoreError::Job(JobError::TerminalState { .. })) => return,
                Err(e) if e.kind() == ErrorKind::PreconditionFailed => {
                    match self.jobs.get_job(&id).await {
                        Ok(fresh) if fresh.job.status.is_terminal() => return,
                        Ok(fresh) => lease = fresh,
                        Err(_) => return,
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "failed to persist failure");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for ReindexTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReindexTask").finish()
    }
}
