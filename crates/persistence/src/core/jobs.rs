//! Reindex job persistence.
//!
//! Jobs are durable records advanced by workers under an etag-protected
//! lease. The heartbeat doubles as the progress checkpoint: every persisted
//! update stamps `heartbeat_at` and advances the etag, so a worker that
//! cannot make progress also cannot keep its lease. There is no separate
//! heartbeat path.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreResult;

/// Unique identifier for a reindex job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReindexJobId(String);

impl ReindexJobId {
    /// Creates a new random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an existing id.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ReindexJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReindexJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque optimistic-concurrency token for a persisted job.
///
/// Bumped by the store on every update; a stale token fails the replace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEtag(String);

impl JobEtag {
    /// Mints a fresh token.
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps a persisted token.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The token as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Status of a reindex job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReindexStatus {
    /// Created, not yet leased.
    Queued,
    /// Leased by a worker and making progress.
    Running,
    /// Suspended by an operator; not acquirable.
    Paused,
    /// All targets reindexed and rules promoted.
    Completed,
    /// Canceled by request.
    Canceled,
    /// Stopped on an unrecoverable error.
    Failed,
}

impl ReindexStatus {
    /// Whether the job can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReindexStatus::Completed | ReindexStatus::Canceled | ReindexStatus::Failed
        )
    }
}

impl std::fmt::Display for ReindexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReindexStatus::Queued => "queued",
            ReindexStatus::Running => "running",
            ReindexStatus::Paused => "paused",
            ReindexStatus::Completed => "completed",
            ReindexStatus::Canceled => "canceled",
            ReindexStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ReindexStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ReindexStatus::Queued),
            "running" => Ok(ReindexStatus::Running),
            "paused" => Ok(ReindexStatus::Paused),
            "completed" => Ok(ReindexStatus::Completed),
            "canceled" => Ok(ReindexStatus::Canceled),
            "failed" => Ok(ReindexStatus::Failed),
            _ => Err(format!("unknown reindex status: {}", s)),
        }
    }
}

/// The rules a job targets and the per-type hashes completion is proven
/// against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReindexScope {
    /// Canonical URLs of the extraction rules being made searchable.
    pub param_urls: Vec<String>,

    /// Expected rule-set hash per resource type, fixed at job start.
    pub expected_hashes: BTreeMap<String, String>,
}

/// Per-type progress counters. `total` is fixed for the life of the job;
/// `processed` and `failed` only grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProgress {
    /// Records of this type at job start.
    pub total: u64,
    /// Records whose index rows have been rewritten.
    pub processed: u64,
    /// Records that could not be reindexed.
    pub failed: u64,
}

/// Resume point for paging, persisted with the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The resource type currently being paged.
    pub resource_type: String,
    /// Opaque cursor within that type, `None` before the first page.
    pub after: Option<String>,
}

/// A durable reindex job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexJob {
    /// Stable identifier.
    pub id: ReindexJobId,
    /// Current status.
    pub status: ReindexStatus,
    /// Last lease stamp; `None` before the first acquisition.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Targeted rules and expected hashes.
    pub scope: ReindexScope,
    /// Per-type counters.
    pub progress: BTreeMap<String, ResourceProgress>,
    /// Resume point, `None` before targets are computed or after the last
    /// type is exhausted.
    pub continuation: Option<Checkpoint>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last persisted.
    pub last_modified: DateTime<Utc>,
    /// When the job was canceled, if it was.
    pub canceled_at: Option<DateTime<Utc>>,
    /// Reason recorded when the job failed.
    pub failure_reason: Option<String>,
}

impl ReindexJob {
    /// Creates a queued job. An empty `param_urls` scope means "every rule
    /// not yet searchable", resolved when the job first runs.
    pub fn new(param_urls: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ReindexJobId::new(),
            status: ReindexStatus::Queued,
            heartbeat_at: None,
            scope: ReindexScope {
                param_urls,
                expected_hashes: BTreeMap::new(),
            },
            progress: BTreeMap::new(),
            continuation: None,
            created_at: now,
            last_modified: now,
            canceled_at: None,
            failure_reason: None,
        }
    }

    /// Whether the lease on this job has lapsed.
    pub fn lease_expired(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        match self.heartbeat_at {
            Some(beat) => {
                let age = now.signed_duration_since(beat);
                age > chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX)
            }
            None => true,
        }
    }

    /// Whether a worker may claim this job right now.
    pub fn acquirable(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        match self.status {
            ReindexStatus::Queued => true,
            ReindexStatus::Running => self.lease_expired(threshold, now),
            _ => false,
        }
    }

    /// Records processed records for a type. Progress is monotonic: the
    /// counters only move forward.
    pub fn record_processed(&mut self, resource_type: &str, processed: u64, failed: u64) {
        let entry = self.progress.entry(resource_type.to_string()).or_default();
        entry.processed = entry.processed.saturating_add(processed);
        entry.failed = entry.failed.saturating_add(failed);
    }

    /// Sum of `total` across all types.
    pub fn total_records(&self) -> u64 {
        self.progress.values().map(|p| p.total).sum()
    }

    /// Sum of `processed` across all types.
    pub fn processed_records(&self) -> u64 {
        self.progress.values().map(|p| p.processed).sum()
    }

    /// Sum of `failed` across all types.
    pub fn failed_records(&self) -> u64 {
        self.progress.values().map(|p| p.failed).sum()
    }
}

/// A job together with the etag guarding its next update.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    /// The persisted job state.
    pub job: ReindexJob,
    /// Token for the next conditional update.
    pub etag: JobEtag,
}

/// Durable persistence of reindex jobs.
///
/// `acquire_jobs` is the trust anchor for single-leaseholder semantics: it
/// must be a single server-side atomic (a stored procedure, a compare-and-set
/// loop, or a conditional transaction), never a client-side read-then-write.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job. Fails `ActiveJobExists` when any non-terminal job
    /// exists in the deployment.
    async fn create_job(&self, job: ReindexJob) -> StoreResult<LeasedJob>;

    /// Reads a job by id.
    async fn get_job(&self, id: &ReindexJobId) -> StoreResult<LeasedJob>;

    /// Conditionally replaces a job. Fails `EtagMismatch` when the token is
    /// stale and `NotFound` when the job is gone. The stored `heartbeat_at`
    /// and `last_modified` are stamped by the store.
    async fn update_job(&self, job: ReindexJob, etag: &JobEtag) -> StoreResult<LeasedJob>;

    /// Atomically claims up to `max` jobs that are `Queued` or `Running`
    /// with an expired lease. Every returned job has `heartbeat_at` stamped
    /// and its etag advanced before this call returns, so concurrent callers
    /// cannot both claim the same job.
    async fn acquire_jobs(&self, max: usize, threshold: Duration) -> StoreResult<Vec<LeasedJob>>;

    /// Returns the id of the non-terminal job, if one exists.
    async fn check_active(&self) -> StoreResult<Option<ReindexJobId>>;

    /// Administratively removes a job regardless of status.
    async fn purge_job(&self, id: &ReindexJobId) -> StoreResult<()>;
}
