//! Durable job persistence: single-active-job, etag replace, atomic acquire.

mod common;

use std::sync::Arc;
use std::time::Duration;

use lumen_persistence::core::{JobStore, ReindexJob, ReindexStatus};
use lumen_persistence::error::ErrorKind;

use common::{memory_backend, seeded_registry, sqlite_backend};

const THRESHOLD: Duration = Duration::from_secs(60);

// ============================================================================
// Single active job (J3)
// ============================================================================

async fn only_one_active_job<S: JobStore>(jobs: &S) {
    let first = jobs.create_job(ReindexJob::new(vec![])).await.unwrap();
    assert_eq!(
        jobs.check_active().await.unwrap(),
        Some(first.job.id.clone())
    );

    let err = jobs.create_job(ReindexJob::new(vec![])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Finishing the job frees the slot.
    let mut done = first.job.clone();
    done.status = ReindexStatus::Completed;
    jobs.update_job(done, &first.etag).await.unwrap();
    assert_eq!(jobs.check_active().await.unwrap(), None);
    jobs.create_job(ReindexJob::new(vec![])).await.unwrap();
}

#[tokio::test]
async fn only_one_active_job_memory() {
    only_one_active_job(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn only_one_active_job_sqlite() {
    only_one_active_job(&*sqlite_backend(&seeded_registry())).await;
}

// ============================================================================
// Conditional replace
// ============================================================================

async fn update_requires_fresh_etag<S: JobStore>(jobs: &S) {
    let lease = jobs.create_job(ReindexJob::new(vec![])).await.unwrap();

    let updated = jobs
        .update_job(lease.job.clone(), &lease.etag)
        .await
        .unwrap();
    assert_ne!(updated.etag, lease.etag);
    // Every persisted update doubles as a heartbeat.
    assert!(updated.job.heartbeat_at.is_some());

    // The original etag is now stale.
    let err = jobs
        .update_job(lease.job.clone(), &lease.etag)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[tokio::test]
async fn update_requires_fresh_etag_memory() {
    update_requires_fresh_etag(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn update_requires_fresh_etag_sqlite() {
    update_requires_fresh_etag(&*sqlite_backend(&seeded_registry())).await;
}

async fn terminal_jobs_are_immutable<S: JobStore>(jobs: &S) {
    let lease = jobs.create_job(ReindexJob::new(vec![])).await.unwrap();
    let mut done = lease.job.clone();
    done.status = ReindexStatus::Canceled;
    let done = jobs.update_job(done, &lease.etag).await.unwrap();

    let err = jobs
        .update_job(done.job.clone(), &done.etag)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequestNotValid);
}

#[tokio::test]
async fn terminal_jobs_are_immutable_memory() {
    terminal_jobs_are_immutable(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn terminal_jobs_are_immutable_sqlite() {
    terminal_jobs_are_immutable(&*sqlite_backend(&seeded_registry())).await;
}

// ============================================================================
// Atomic acquire (J1)
// ============================================================================

async fn acquire_stamps_the_claim<S: JobStore>(jobs: &S) {
    let created = jobs.create_job(ReindexJob::new(vec![])).await.unwrap();

    let leases = jobs.acquire_jobs(4, THRESHOLD).await.unwrap();
    assert_eq!(leases.len(), 1);
    let lease = &leases[0];
    assert_eq!(lease.job.id, created.job.id);
    assert_eq!(lease.job.status, ReindexStatus::Running);
    assert!(lease.job.heartbeat_at.is_some());
    assert_ne!(lease.etag, created.etag);

    // A live lease is not reacquirable.
    assert!(jobs.acquire_jobs(4, THRESHOLD).await.unwrap().is_empty());

    // Once the heartbeat lapses, it is.
    assert_eq!(
        jobs.acquire_jobs(4, Duration::ZERO).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn acquire_stamps_the_claim_memory() {
    acquire_stamps_the_claim(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn acquire_stamps_the_claim_sqlite() {
    acquire_stamps_the_claim(&*sqlite_backend(&seeded_registry())).await;
}

async fn concurrent_acquire_yields_one_claim<S>(jobs: Arc<S>)
where
    S: JobStore + 'static,
{
    jobs.create_job(ReindexJob::new(vec![])).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let jobs = Arc::clone(&jobs);
        handles.push(tokio::spawn(async move {
            jobs.acquire_jobs(1, THRESHOLD).await.unwrap().len()
        }));
    }

    let mut claimed = 0;
    for handle in handles {
        claimed += handle.await.unwrap();
    }
    assert_eq!(claimed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_yields_one_claim_memory() {
    concurrent_acquire_yields_one_claim(memory_backend(&seeded_registry())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_yields_one_claim_sqlite() {
    concurrent_acquire_yields_one_claim(sqlite_backend(&seeded_registry())).await;
}

// ============================================================================
// Purge
// ============================================================================

async fn purge_removes_any_status<S: JobStore>(jobs: &S) {
    let lease = jobs.create_job(ReindexJob::new(vec![])).await.unwrap();
    jobs.purge_job(&lease.job.id).await.unwrap();

    let err = jobs.get_job(&lease.job.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = jobs.purge_job(&lease.job.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn purge_removes_any_status_memory() {
    purge_removes_any_status(&*memory_backend(&seeded_registry())).await;
}

#[tokio::test]
async fn purge_removes_any_status_sqlite() {
    purge_removes_any_status(&*sqlite_backend(&seeded_registry())).await;
}
