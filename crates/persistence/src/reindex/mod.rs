//! Background reindex coordination.
//!
//! - [`worker`] — per-process poll loop, lease acquisition, command surface
//! - [`task`] — per-job state machine
//! - [`throttle`] — batch pacing driven by backend feedback
//!
//! A job's life: `CreateReindex` persists it `Queued`; a worker leases it,
//! the task computes its targets and pages through each type, checkpointing
//! (and thereby heartbeating) after every batch; when the last page lands
//! and the rule-set hashes still match, the targeted rules are promoted and
//! the job completes. A worker that dies mid-job simply stops heartbeating;
//! after the threshold another worker re-acquires and resumes from the
//! persisted continuation.

pub mod task;
pub mod throttle;
pub mod worker;

pub use task::ReindexTask;
pub use throttle::{AdaptiveThrottle, FixedThrottle, ThrottleOracle, ThrottlePlan};
pub use worker::{cancel_reindex, create_reindex, get_reindex, ReindexWorker, WorkerHandle};
