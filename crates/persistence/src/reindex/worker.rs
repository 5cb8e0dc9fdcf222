//! Reindex worker loop and the reindex command surface.
//!
//! One worker runs per process. Each iteration reaps finished tasks, leases
//! up to the remaining capacity, and spawns a [`ReindexTask`] per lease with
//! a cancel handle derived from the worker's shutdown signal, so shutting
//! the worker down cancels every in-flight task deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::{JobStore, LeasedJob, ReindexJob, ReindexJobId, ReindexStore, ReindexStatus};
use crate::error::{ErrorKind, JobError, StoreResult};
use crate::search::SupportResolver;

use super::task::ReindexTask;
use super::throttle::{AdaptiveThrottle, ThrottleOracle};

/// Bounded retries for the cancel command's conditional update.
const CANCEL_RETRIES: u32 = 5;

type ActiveMap = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Long-running job worker.
pub struct ReindexWorker {
    jobs: Arc<dyn JobStore>,
    task: Arc<ReindexTask>,
    config: EngineConfig,
    shutdown: CancellationToken,
    active: ActiveMap,
}

impl ReindexWorker {
    /// Creates a worker over the engine's collaborators. Configuration is
    /// injected here; the worker reads no globals.
    pub fn new(
        store: Arc<dyn ReindexStore>,
        jobs: Arc<dyn JobStore>,
        resolver: Arc<dyn SupportResolver>,
        throttle: Arc<dyn ThrottleOracle>,
        config: EngineConfig,
    ) -> Self {
        let task = Arc::new(ReindexTask::new(
            store,
            Arc::clone(&jobs),
            resolver,
            throttle,
        ));
        Self {
            jobs,
            task,
            config,
            shutdown: CancellationToken::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates a worker with the default adaptive throttle, seeded from the
    /// configured batch size. Backend pushback shrinks the batch and grows
    /// the delay from there.
    pub fn with_default_throttle(
        store: Arc<dyn ReindexStore>,
        jobs: Arc<dyn JobStore>,
        resolver: Arc<dyn SupportResolver>,
        config: EngineConfig,
    ) -> Self {
        let throttle = Arc::new(AdaptiveThrottle::with_batch_size(config.reindex_batch_size));
        Self::new(store, jobs, resolver, throttle, config)
    }

    /// A handle for canceling jobs and shutting the worker down.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            jobs: Arc::clone(&self.jobs),
            shutdown: self.shutdown.clone(),
            active: Arc::clone(&self.active),
        }
    }

    /// Runs until the shutdown signal fires, then drains in-flight tasks.
    pub async fn run(self) {
        let mut running: HashMap<String, JoinHandle<()>> = HashMap::new();
        tracing::info!(
            max_concurrent = self.config.max_concurrent_jobs,
            "reindex worker started"
        );

        loop {
            running.retain(|id, handle| {
                if handle.is_finished() {
                    self.active.lock().remove(id);
                    false
                } else {
                    true
                }
            });

            let capacity = self.config.max_concurrent_jobs.saturating_sub(running.len());
            if capacity > 0 {
                match self
                    .jobs
                    .acquire_jobs(capacity, self.config.heartbeat_threshold())
                    .await
                {
                    Ok(leases) => {
                        for lease in leases {
                            self.spawn_task(lease, &mut running);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to acquire reindex jobs");
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        // Drain: child tokens are already cancelled through the shutdown
        // signal; wait for each task to yield.
        tracing::info!(in_flight = running.len(), "reindex worker draining");
        for (_, handle) in running {
            let _ = handle.await;
        }
    }

    fn spawn_task(&self, lease: LeasedJob, running: &mut HashMap<String, JoinHandle<()>>) {
        let id = lease.job.id.to_string();
        let cancel = self.shutdown.child_token();
        self.active.lock().insert(id.clone(), cancel.clone());

        let task = Arc::clone(&self.task);
        let shutdown = self.shutdown.clone();
        tracing::info!(job_id = %id, "spawning reindex task");
        let handle = tokio::spawn(async move {
            task.run(lease, cancel, shutdown).await;
        });
        running.insert(id, handle);
    }
}

impl std::fmt::Debug for ReindexWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReindexWorker")
            .field("active", &self.active.lock().len())
            .finish()
    }
}

/// Cancel/shutdown handle detached from the running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    jobs: Arc<dyn JobStore>,
    shutdown: CancellationToken,
    active: ActiveMap,
}

impl WorkerHandle {
    /// Signals the worker to stop leasing and drain.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancels a job: persists `Canceled` and, when the job is running in
    /// this process, fires its cancel handle.
    pub async fn cancel(&self, id: &ReindexJobId) -> StoreResult<ReindexJob> {
        let job = cancel_reindex(self.jobs.as_ref(), id).await?;
        if let Some(token) = self.active.lock().get(id.as_str()) {
            token.cancel();
        }
        Ok(job)
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").finish()
    }
}

/// Creates a reindex job. An empty scope targets every rule awaiting
/// promotion. Fails `Conflict` when a non-terminal job already exists.
pub async fn create_reindex(
    jobs: &dyn JobStore,
    param_urls: Vec<String>,
) -> StoreResult<LeasedJob> {
    if let Some(id) = jobs.check_active().await? {
        return Err(JobError::ActiveJobExists { id: id.to_string() }.into());
    }
    jobs.create_job(ReindexJob::new(param_urls)).await
}

/// Reads a job descriptor.
pub async fn get_reindex(jobs: &dyn JobStore, id: &ReindexJobId) -> StoreResult<ReindexJob> {
    Ok(jobs.get_job(id).await?.job)
}

/// Cancels a job through its store: conditional update with bounded,
/// exponentially backed-off retries. Fails `RequestNotValid` when the job is
/// already terminal.
pub async fn cancel_reindex(jobs: &dyn JobStore, id: &ReindexJobId) -> StoreResult<ReindexJob> {
    let mut lease = jobs.get_job(id).await?;
    if lease.job.status.is_terminal() {
        return Err(JobError::TerminalState {
            id: id.to_string(),
            status: lease.job.status.to_string(),
        }
        .into());
    }

    let mut backoff = Duration::from_millis(50);
    let mut attempt = 0u32;
    loop {
        lease.job.status = ReindexStatus::Canceled;
        lease.job.canceled_at = Some(chrono::Utc::now());
        match jobs.update_job(lease.job.clone(), &lease.etag).await {
            Ok(updated) => {
                tracing::info!(job_id = %id, "reindex job canceled");
                return Ok(updated.job);
            }
            Err(e) if e.kind() == ErrorKind::PreconditionFailed && attempt < CANCEL_RETRIES => {
                attempt += 1;
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                lease = jobs.get_job(id).await?;
                if lease.job.status.is_terminal() {
                    return Err(JobError::TerminalState {
                        id: id.to_string(),
                        status: lease.job.status.to_string(),
                    }
                    .into());
                }
            }
            Err(e) => return Err(e),
        }
    }
}
