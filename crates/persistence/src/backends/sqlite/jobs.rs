//! JobStore implementation for SQLite.
//!
//! Every mutation runs inside an immediate transaction, which SQLite
//! serializes against all other writers: the acquire operation is a single
//! server-side atomic, so two processes polling the same database cannot
//! both claim a job.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, TransactionBehavior};

use crate::core::jobs::JobEtag;
use crate::core::{JobStore, LeasedJob, ReindexJob, ReindexJobId, ReindexStatus};
use crate::error::{BackendError, JobError, StoreError, StoreResult};

use super::{map_sqlite_err, SqliteBackend};

fn serialize_job(job: &ReindexJob) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(job).map_err(|e| {
        StoreError::Backend(BackendError::Serialization {
            message: e.to_string(),
        })
    })
}

fn deserialize_job(body: &[u8]) -> StoreResult<ReindexJob> {
    serde_json::from_slice(body).map_err(|e| {
        StoreError::Backend(BackendError::Serialization {
            message: e.to_string(),
        })
    })
}

/// Persists the job row. Caller owns the transaction.
fn write_job(conn: &Connection, job: &ReindexJob, etag: &JobEtag) -> StoreResult<()> {
    let body = serialize_job(job)?;
    conn.execute(
        "UPDATE reindex_jobs SET status = ?1, etag = ?2, heartbeat_at = ?3, body = ?4,
             last_modified = ?5
         WHERE id = ?6",
        params![
            job.status.to_string(),
            etag.as_str(),
            job.heartbeat_at.map(|t| t.to_rfc3339()),
            body,
            job.last_modified.to_rfc3339(),
            job.id.as_str(),
        ],
    )
    .map_err(map_sqlite_err)?;
    Ok(())
}

#[async_trait]
impl JobStore for SqliteBackend {
    async fn create_job(&self, mut job: ReindexJob) -> StoreResult<LeasedJob> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;

        let active: Option<String> = tx
            .query_row(
                "SELECT id FROM reindex_jobs
                 WHERE status NOT IN ('completed', 'canceled', 'failed') LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();
        if let Some(id) = active {
            return Err(JobError::ActiveJobExists { id }.into());
        }

        job.last_modified = Utc::now();
        let etag = JobEtag::mint();
        let body = serialize_job(&job)?;
        tx.execute(
            "INSERT INTO reindex_jobs (id, status, etag, heartbeat_at, body, created_at, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.id.as_str(),
                job.status.to_string(),
                etag.as_str(),
                job.heartbeat_at.map(|t| t.to_rfc3339()),
                body,
                job.created_at.to_rfc3339(),
                job.last_modified.to_rfc3339(),
            ],
        )
        .map_err(map_sqlite_err)?;
        tx.commit().map_err(map_sqlite_err)?;
        tracing::info!(job_id = %job.id, "created reindex job");
        Ok(LeasedJob { job, etag })
    }

    async fn get_job(&self, id: &ReindexJobId) -> StoreResult<LeasedJob> {
        let conn = self.connection()?;
        let result = conn.query_row(
            "SELECT body, etag FROM reindex_jobs WHERE id = ?1",
            params![id.as_str()],
            |row| {
                let body: Vec<u8> = row.get(0)?;
                let etag: String = row.get(1)?;
                Ok((body, etag))
            },
        );
        match result {
            Ok((body, etag)) => Ok(LeasedJob {
                job: deserialize_job(&body)?,
                etag: JobEtag::from_string(etag),
            }),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(JobError::NotFound {
                id: id.to_string(),
            }
            .into()),
            Err(e) => Err(map_sqlite_err(e)),
        }
    }

    async fn update_job(&self, mut job: ReindexJob, etag: &JobEtag) -> StoreResult<LeasedJob> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;

        let stored = tx.query_row(
            "SELECT status, etag FROM reindex_jobs WHERE id = ?1",
            params![job.id.as_str()],
            |row| {
                let status: String = row.get(0)?;
                let etag: String = row.get(1)?;
                Ok((status, etag))
            },
        );
        let (stored_status, stored_etag) = match stored {
            Ok(v) => v,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(JobError::NotFound {
                    id: job.id.to_string(),
                }
                .into());
            }
            Err(e) => return Err(map_sqlite_err(e)),
        };
        let stored_status: ReindexStatus = stored_status
            .parse()
            .map_err(|e: String| JobError::Unrecoverable {
                id: job.id.to_string(),
                reason: e,
            })?;
        if stored_status.is_terminal() {
            return Err(JobError::TerminalState {
                id: job.id.to_string(),
                status: stored_status.to_string(),
            }
            .into());
        }
        if stored_etag != etag.as_str() {
            return Err(JobError::EtagMismatch {
                id: job.id.to_string(),
            }
            .into());
        }

        let now = Utc::now();
        job.heartbeat_at = Some(now);
        job.last_modified = now;
        let new_etag = JobEtag::mint();
        write_job(&tx, &job, &new_etag)?;
        tx.commit().map_err(map_sqlite_err)?;
        Ok(LeasedJob {
            job,
            etag: new_etag,
        })
    }

    async fn acquire_jobs(&self, max: usize, threshold: Duration) -> StoreResult<Vec<LeasedJob>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_err)?;
        let now = Utc::now();

        let mut candidates: Vec<Vec<u8>> = Vec::new();
        {
            let mut stmt = tx
                .prepare(
                    "SELECT body FROM reindex_jobs
                     WHERE status IN ('queued', 'running')
                     ORDER BY created_at ASC",
                )
                .map_err(map_sqlite_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, Vec<u8>>(0))
                .map_err(map_sqlite_err)?;
            for row in rows {
                candidates.push(row.map_err(map_sqlite_err)?);
            }
        }

        let mut leased = Vec::new();
        for body in candidates {
            if leased.len() == max {
                break;
            }
            let mut job = deserialize_job(&body)?;
            if !job.acquirable(threshold, now) {
                continue;
            }
            job.status = ReindexStatus::Running;
            job.heartbeat_at = Some(now);
            job.last_modified = now;
            let etag = JobEtag::mint();
            write_job(&tx, &job, &etag)?;
            tracing::debug!(job_id = %job.id, "acquired reindex job");
            leased.push(LeasedJob { job, etag });
        }
        tx.commit().map_err(map_sqlite_err)?;
        Ok(leased)
    }

    async fn check_active(&self) -> StoreResult<Option<ReindexJobId>> {
        let conn = self.connection()?;
        let result: Option<String> = conn
            .query_row(
                "SELECT id FROM reindex_jobs
                 WHERE status NOT IN ('completed', 'canceled', 'failed') LIMIT 1",
                [],
                |row| row.get(0),
            )
            .ok();
        Ok(result.map(ReindexJobId::from_string))
    }

    async fn purge_job(&self, id: &ReindexJobId) -> StoreResult<()> {
        let conn = self.connection()?;
        let deleted = conn
            .execute(
                "DELETE FROM reindex_jobs WHERE id = ?1",
                params![id.as_str()],
            )
            .map_err(map_sqlite_err)?;
        if deleted == 0 {
            return Err(JobError::NotFound {
                id: id.to_string(),
            }
            .into());
        }
        Ok(())
    }
}
