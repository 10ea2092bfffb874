//! SQLite-backed ingestion job queue
//!
//! Leases are claimed with a single `UPDATE ... WHERE id = (SELECT ...)
//! RETURNING` statement, so two workers can never hold the same job. A worker
//! that dies simply lets its lease run out; the job becomes claimable again
//! until its retry budget is spent.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::{EnqueueResult, IngestJob, JobResult, JobStatus, NewJob, StatusCounts};
use crate::config::QueueConfig;
use crate::error::{Error, Result};

const JOB_COLUMNS: &str = "id, tenant, workspace, source_type, external_id, url, priority, status, \
     attempts, lease_owner, lease_expires_at, last_error, metadata, enqueued_at, updated_at, completed_at";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn duration_ms(lease: Duration) -> Result<i64> {
    if lease.is_zero() {
        return Err(Error::InvalidArgument("lease duration must be positive".to_string()));
    }
    i64::try_from(lease.as_millis())
        .map_err(|_| Error::InvalidArgument(format!("lease duration {:?} is too long", lease)))
}

fn row_to_job(row: &SqliteRow) -> Result<IngestJob> {
    let status: String = row.try_get("status")?;
    let metadata: Option<String> = row.try_get("metadata")?;
    let metadata = metadata.map(|m| serde_json::from_str(&m)).transpose()?;

    Ok(IngestJob {
        id: row.try_get("id")?,
        tenant: row.try_get("tenant")?,
        workspace: row.try_get("workspace")?,
        source_type: row.try_get("source_type")?,
        external_id: row.try_get("external_id")?,
        url: row.try_get("url")?,
        priority: row.try_get("priority")?,
        status: status.parse()?,
        attempts: row.try_get::<i64, _>("attempts")?.max(0) as u32,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get::<Option<i64>, _>("lease_expires_at")?.map(from_ms),
        last_error: row.try_get("last_error")?,
        metadata,
        enqueued_at: from_ms(row.try_get("enqueued_at")?),
        updated_at: from_ms(row.try_get("updated_at")?),
        completed_at: row.try_get::<Option<i64>, _>("completed_at")?.map(from_ms),
    })
}

/// Durable priority queue over `ingest_jobs`
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    max_attempts: u32,
}

impl JobQueue {
    /// Queue with the default retry budget, over an already migrated pool
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_attempts: QueueConfig::default().max_attempts,
        }
    }

    pub fn with_config(pool: SqlitePool, config: &QueueConfig) -> Result<Self> {
        Self::new(pool).with_max_attempts(config.max_attempts)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::InvalidArgument("max_attempts must be at least 1".to_string()));
        }
        self.max_attempts = max_attempts;
        Ok(self)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a job. An existing job with the same identity is left untouched
    /// and its id returned with `inserted = false`.
    pub async fn enqueue(&self, job: &NewJob) -> Result<EnqueueResult> {
        job.validate()?;
        let now = now_ms();
        let metadata = job.metadata.as_ref().map(serde_json::to_string).transpose()?;

        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO ingest_jobs (
                tenant, workspace, source_type, external_id, url, priority,
                status, attempts, metadata, enqueued_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            ON CONFLICT(tenant, workspace, source_type, external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&job.tenant)
        .bind(&job.workspace)
        .bind(&job.source_type)
        .bind(&job.external_id)
        .bind(&job.url)
        .bind(job.priority)
        .bind(&metadata)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        if let Some((job_id,)) = inserted {
            debug!(
                job_id = job_id,
                tenant = %job.tenant,
                workspace = %job.workspace,
                external_id = %job.external_id,
                priority = job.priority,
                "Enqueued job"
            );
            return Ok(EnqueueResult {
                job_id,
                inserted: true,
            });
        }

        let (job_id,): (i64,) = sqlx::query_as(
            r#"
            SELECT id FROM ingest_jobs
            WHERE tenant = ? AND workspace = ? AND source_type = ? AND external_id = ?
            "#,
        )
        .bind(&job.tenant)
        .bind(&job.workspace)
        .bind(&job.source_type)
        .bind(&job.external_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(EnqueueResult {
            job_id,
            inserted: false,
        })
    }

    /// Claim the next eligible job across all tenants
    pub async fn dequeue_lease(&self, worker_id: &str, lease: Duration) -> Result<Option<IngestJob>> {
        self.dequeue_lease_for(worker_id, lease, None, None).await
    }

    /// Claim the next eligible job, optionally restricted to a tenant and workspace.
    ///
    /// Eligible means pending, or running with an expired lease and retry
    /// budget left. Highest priority first, oldest first within a priority.
    pub async fn dequeue_lease_for(
        &self,
        worker_id: &str,
        lease: Duration,
        tenant: Option<&str>,
        workspace: Option<&str>,
    ) -> Result<Option<IngestJob>> {
        if worker_id.trim().is_empty() {
            return Err(Error::InvalidArgument("worker id is empty".to_string()));
        }
        let lease_ms = duration_ms(lease)?;
        let now = now_ms();

        let exhausted = self.fail_exhausted(now).await?;
        if exhausted > 0 {
            warn!(count = exhausted, "Failed expired jobs with no retries left");
        }

        let sql = format!(
            r#"
            UPDATE ingest_jobs
            SET status = 'running',
                lease_owner = ?,
                lease_expires_at = ?,
                attempts = attempts + 1,
                updated_at = ?
            WHERE id = (
                SELECT id FROM ingest_jobs
                WHERE (status = 'pending'
                       OR (status = 'running' AND lease_expires_at <= ? AND attempts < ?))
                  AND (? IS NULL OR tenant = ?)
                  AND (? IS NULL OR workspace = ?)
                ORDER BY priority DESC, id ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now + lease_ms)
            .bind(now)
            .bind(now)
            .bind(self.max_attempts as i64)
            .bind(tenant)
            .bind(tenant)
            .bind(workspace)
            .bind(workspace)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = row_to_job(&row)?;
        debug!(
            job_id = job.id,
            worker_id = %worker_id,
            attempt = job.attempts,
            lease_ms = lease_ms,
            "Leased job"
        );
        Ok(Some(job))
    }

    /// Expired leases whose retry budget is spent become permanent failures
    async fn fail_exhausted(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'failed',
                last_error = COALESCE(last_error, 'lease expired with no retries left'),
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = ?,
                completed_at = ?
            WHERE status = 'running' AND lease_expires_at <= ? AND attempts >= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(self.max_attempts as i64)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(result.rows_affected())
    }

    /// Finish a leased job. Only the current lease holder may complete it.
    ///
    /// Returns the resulting status: `done`, `pending` (retry), or `failed`.
    pub async fn complete(&self, job: &IngestJob, result: JobResult) -> Result<JobStatus> {
        let worker_id = job.lease_owner.as_deref().unwrap_or_default();
        let now = now_ms();

        let row: Option<(String,)> = match &result {
            JobResult::Success => {
                sqlx::query_as::<_, (String,)>(
                    r#"
                    UPDATE ingest_jobs
                    SET status = 'done',
                        lease_owner = NULL,
                        lease_expires_at = NULL,
                        last_error = NULL,
                        updated_at = ?,
                        completed_at = ?
                    WHERE id = ? AND status = 'running' AND lease_owner = ?
                    RETURNING status
                    "#,
                )
                .bind(now)
                .bind(now)
                .bind(job.id)
                .bind(worker_id)
                .fetch_optional(&self.pool)
                .await
            }
            JobResult::Failure(error) => {
                sqlx::query_as::<_, (String,)>(
                    r#"
                    UPDATE ingest_jobs
                    SET status = CASE WHEN attempts < ? THEN 'pending' ELSE 'failed' END,
                        completed_at = CASE WHEN attempts < ? THEN NULL ELSE ? END,
                        lease_owner = NULL,
                        lease_expires_at = NULL,
                        last_error = ?,
                        updated_at = ?
                    WHERE id = ? AND status = 'running' AND lease_owner = ?
                    RETURNING status
                    "#,
                )
                .bind(self.max_attempts as i64)
                .bind(self.max_attempts as i64)
                .bind(now)
                .bind(error)
                .bind(now)
                .bind(job.id)
                .bind(worker_id)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(Error::DatabaseError)?;

        let Some((status,)) = row else {
            return Err(Error::LeaseConflict {
                job_id: job.id,
                worker_id: worker_id.to_string(),
            });
        };
        let status: JobStatus = status.parse()?;

        match status {
            JobStatus::Failed => warn!(
                job_id = job.id,
                attempts = job.attempts,
                "Job failed permanently"
            ),
            JobStatus::Pending => info!(job_id = job.id, attempts = job.attempts, "Job requeued for retry"),
            _ => debug!(job_id = job.id, status = %status, "Completed job"),
        }
        Ok(status)
    }

    /// Push the lease expiry out to `now + lease`. Returns the new expiry.
    pub async fn extend_lease(&self, job: &IngestJob, lease: Duration) -> Result<DateTime<Utc>> {
        let worker_id = job.lease_owner.as_deref().unwrap_or_default();
        let expires_at = now_ms() + duration_ms(lease)?;

        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET lease_expires_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running' AND lease_owner = ?
            "#,
        )
        .bind(expires_at)
        .bind(now_ms())
        .bind(job.id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(Error::LeaseConflict {
                job_id: job.id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(from_ms(expires_at))
    }

    pub async fn get(&self, job_id: i64) -> Result<IngestJob> {
        let sql = format!("SELECT {} FROM ingest_jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::DatabaseError)?
            .ok_or(Error::JobNotFound(job_id))?;
        row_to_job(&row)
    }

    /// Number of pending jobs for a tenant/workspace
    pub async fn backlog_count(&self, tenant: &str, workspace: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM ingest_jobs
            WHERE tenant = ? AND workspace = ? AND status = 'pending'
            "#,
        )
        .bind(tenant)
        .bind(workspace)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(count.max(0) as u64)
    }

    pub async fn status_counts(&self, tenant: &str, workspace: &str) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM ingest_jobs
            WHERE tenant = ? AND workspace = ?
            GROUP BY status
            "#,
        )
        .bind(tenant)
        .bind(workspace)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.add(status.parse()?, count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Jobs in claim order, optionally filtered by status
    pub async fn list(
        &self,
        tenant: &str,
        workspace: &str,
        status: Option<JobStatus>,
        limit: u32,
    ) -> Result<Vec<IngestJob>> {
        let sql = format!(
            r#"
            SELECT {} FROM ingest_jobs
            WHERE tenant = ? AND workspace = ? AND (? IS NULL OR status = ?)
            ORDER BY priority DESC, id ASC
            LIMIT ?
            "#,
            JOB_COLUMNS
        );
        let status = status.map(|s| s.as_str());

        let rows = sqlx::query(&sql)
            .bind(tenant)
            .bind(workspace)
            .bind(status)
            .bind(status)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        rows.iter().map(row_to_job).collect()
    }

    /// Put permanently failed jobs back in the queue with a fresh retry budget
    pub async fn requeue_failed(&self, tenant: &str, workspace: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'pending', attempts = 0, last_error = NULL,
                completed_at = NULL, updated_at = ?
            WHERE tenant = ? AND workspace = ? AND status = 'failed'
            "#,
        )
        .bind(now_ms())
        .bind(tenant)
        .bind(workspace)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        let count = result.rows_affected();
        if count > 0 {
            info!(tenant = %tenant, workspace = %workspace, count = count, "Requeued failed jobs");
        }
        Ok(count)
    }
}
