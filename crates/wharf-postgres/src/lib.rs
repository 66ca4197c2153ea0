//! PostgreSQL implementation of the Wharf job queue's [`JobStore`].
//!
//! - Atomic lease acquisition with `FOR UPDATE SKIP LOCKED`, priority
//!   ordering, FIFO within a priority band
//! - Retry / dead-letter-queue policy driven entirely by conditional
//!   `UPDATE ... WHERE` predicates scoped to the caller's lease
//! - Crash recovery via a lease-expiry scan covering both `LEASED` and
//!   `RUNNING` jobs
//! - Schema managed by `sqlx::migrate!` from `./migrations`
//!
//! ```rust,ignore
//! use wharf_postgres::PgJobStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/wharf").await?;
//! sqlx::migrate!("./migrations").run(&pool).await?;
//! let store = PgJobStore::new(pool);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;
use wharf_core::{
    Job, JobPage, JobStatus, JobStore, Priority, QueueError, QueueStats, Result, SubmitRequest,
    TenantAdmissionPolicy,
};

fn status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Leased => "leased",
        JobStatus::Running => "running",
        JobStatus::Succeeded => "succeeded",
        JobStatus::Failed => "failed",
        JobStatus::Dlq => "dlq",
    }
}

fn status_from_str(s: &str) -> anyhow::Result<JobStatus> {
    Ok(match s {
        "queued" => JobStatus::Queued,
        "leased" => JobStatus::Leased,
        "running" => JobStatus::Running,
        "succeeded" => JobStatus::Succeeded,
        "failed" => JobStatus::Failed,
        "dlq" => JobStatus::Dlq,
        other => anyhow::bail!("unknown job_status '{other}' returned from database"),
    })
}

fn priority_to_str(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "normal",
        Priority::High => "high",
        Priority::Critical => "critical",
    }
}

fn priority_from_str(s: &str) -> anyhow::Result<Priority> {
    Ok(match s {
        "low" => Priority::Low,
        "normal" => Priority::Normal,
        "high" => Priority::High,
        "critical" => Priority::Critical,
        other => anyhow::bail!("unknown job_priority '{other}' returned from database"),
    })
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> anyhow::Result<Job> {
    // `status`/`priority` are native Postgres enum columns; sqlx's `Type<Postgres>`
    // impl for `String` only declares TEXT/VARCHAR/BPCHAR/NAME/UNKNOWN as
    // compatible, so a checked `try_get` would reject the enum's OID even
    // though the wire bytes decode as a plain string. `try_get_unchecked`
    // skips that compatibility check and decodes the bytes directly.
    Ok(Job {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        payload: row.try_get("payload")?,
        status: status_from_str(row.try_get_unchecked::<String, _>("status")?.as_str())?,
        priority: priority_from_str(row.try_get_unchecked::<String, _>("priority")?.as_str())?,
        attempt: row.try_get("attempt")?,
        max_attempts: row.try_get("max_attempts")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        scheduled_at: row.try_get("scheduled_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        last_error: row.try_get("last_error")?,
        result: row.try_get("result")?,
    })
}

/// PostgreSQL-backed [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    default_lease: std::time::Duration,
}

impl PgJobStore {
    /// Lease defaults to 30 seconds, matching `WorkerConfig::default()`.
    /// Use [`Self::with_lease_duration`] to match a non-default worker config.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_lease: std::time::Duration::from_secs(30),
        }
    }

    pub fn with_lease_duration(pool: PgPool, lease_duration: std::time::Duration) -> Self {
        Self {
            pool,
            default_lease: lease_duration,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn infra(err: sqlx::Error) -> QueueError {
        QueueError::Infrastructure(err.into())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn submit(&self, request: SubmitRequest) -> Result<(Job, bool)> {
        if request.idempotency_key.is_empty() || request.idempotency_key.len() > 255 {
            return Err(QueueError::InvalidArgument(
                "idempotency_key must be 1..=255 bytes".to_string(),
            ));
        }
        if request.max_attempts < 1 {
            return Err(QueueError::InvalidArgument(
                "max_attempts must be >= 1".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let scheduled_at = request.scheduled_at.unwrap_or_else(Utc::now);

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, tenant_id, idempotency_key, payload, status, priority,
                attempt, max_attempts, scheduled_at
            )
            VALUES ($1, $2, $3, $4, 'queued', $5::job_priority, 0, $6, $7)
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&request.tenant_id)
        .bind(&request.idempotency_key)
        .bind(&request.payload)
        .bind(priority_to_str(request.priority))
        .bind(request.max_attempts)
        .bind(scheduled_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::infra)?;

        if let Some(row) = row {
            let job = row_to_job(&row).map_err(QueueError::Infrastructure)?;
            tracing::info!(job_id = %job.id, tenant_id = %job.tenant_id, "created new job");
            return Ok((job, true));
        }

        let existing = sqlx::query("SELECT * FROM jobs WHERE tenant_id = $1 AND idempotency_key = $2")
            .bind(&request.tenant_id)
            .bind(&request.idempotency_key)
            .fetch_one(&self.pool)
            .await
            .map_err(Self::infra)?;

        let job = row_to_job(&existing).map_err(QueueError::Infrastructure)?;
        tracing::info!(job_id = %job.id, tenant_id = %job.tenant_id, "returned existing job for idempotency key");
        Ok((job, false))
    }

    async fn get(&self, job_id: Uuid) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::infra)?
            .ok_or(QueueError::NotFound(job_id))?;
        row_to_job(&row).map_err(QueueError::Infrastructure)
    }

    async fn list(
        &self,
        tenant_id: &str,
        status: Option<JobStatus>,
        page: u32,
        page_size: u32,
    ) -> Result<JobPage> {
        let offset = (page.saturating_sub(1) as i64) * page_size as i64;
        let limit = page_size as i64;

        let (total, rows) = if let Some(status) = status {
            let status_str = status_to_str(status);
            let total: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM jobs WHERE tenant_id = $1 AND status = $2::job_status",
            )
            .bind(tenant_id)
            .bind(status_str)
            .fetch_one(&self.pool)
            .await
            .map_err(Self::infra)?;

            let rows = sqlx::query(
                "SELECT * FROM jobs WHERE tenant_id = $1 AND status = $2::job_status \
                 ORDER BY created_at DESC LIMIT $3 OFFSET $4",
            )
            .bind(tenant_id)
            .bind(status_str)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::infra)?;
            (total, rows)
        } else {
            let total: i64 = sqlx::query_scalar("SELECT count(*) FROM jobs WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await
                .map_err(Self::infra)?;

            let rows = sqlx::query(
                "SELECT * FROM jobs WHERE tenant_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            )
            .bind(tenant_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::infra)?;
            (total, rows)
        };

        let jobs = rows
            .iter()
            .map(row_to_job)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(QueueError::Infrastructure)?;

        Ok(JobPage { jobs, total })
    }

    async fn acquire_lease(
        &self,
        worker_id: &str,
        batch_size: i64,
        tenant_filter: Option<&str>,
    ) -> Result<Vec<Job>> {
        let lease_expires_at = Utc::now() + Duration::from_std(self.default_lease).unwrap();

        let rows = if let Some(tenant_id) = tenant_filter {
            sqlx::query(
                r#"
                WITH claimable AS (
                    SELECT id FROM jobs
                    WHERE status = 'queued'
                      AND (scheduled_at IS NULL OR scheduled_at <= now())
                      AND tenant_id = $4
                    ORDER BY
                        CASE priority
                            WHEN 'critical' THEN 100
                            WHEN 'high' THEN 10
                            WHEN 'normal' THEN 5
                            WHEN 'low' THEN 1
                        END DESC,
                        created_at ASC
                    FOR UPDATE SKIP LOCKED
                    LIMIT $3
                )
                UPDATE jobs
                SET status = 'leased', lease_owner = $1, lease_expires_at = $2, updated_at = now()
                WHERE id IN (SELECT id FROM claimable)
                RETURNING *
                "#,
            )
            .bind(worker_id)
            .bind(lease_expires_at)
            .bind(batch_size)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                WITH claimable AS (
                    SELECT id FROM jobs
                    WHERE status = 'queued'
                      AND (scheduled_at IS NULL OR scheduled_at <= now())
                    ORDER BY
                        CASE priority
                            WHEN 'critical' THEN 100
                            WHEN 'high' THEN 10
                            WHEN 'normal' THEN 5
                            WHEN 'low' THEN 1
                        END DESC,
                        created_at ASC
                    FOR UPDATE SKIP LOCKED
                    LIMIT $3
                )
                UPDATE jobs
                SET status = 'leased', lease_owner = $1, lease_expires_at = $2, updated_at = now()
                WHERE id IN (SELECT id FROM claimable)
                RETURNING *
                "#,
            )
            .bind(worker_id)
            .bind(lease_expires_at)
            .bind(batch_size)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(Self::infra)?;

        let jobs = rows
            .iter()
            .map(row_to_job)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(QueueError::Infrastructure)?;

        if !jobs.is_empty() {
            tracing::info!(worker_id, count = jobs.len(), "acquired lease on jobs");
        }
        Ok(jobs)
    }

    async fn start_job(&self, job_id: Uuid, worker_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', attempt = attempt + 1, updated_at = now()
            WHERE id = $1 AND status = 'leased' AND lease_owner = $2
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::infra)?;

        row.as_ref().map(row_to_job).transpose().map_err(QueueError::Infrastructure)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                completed_at = now(),
                updated_at = now(),
                lease_owner = NULL,
                lease_expires_at = NULL,
                result = $3
            WHERE id = $1 AND status = 'running' AND lease_owner = $2
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(result)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::infra)?;

        row.as_ref().map(row_to_job).transpose().map_err(QueueError::Infrastructure)
    }

    async fn fail_job(&self, job_id: Uuid, worker_id: &str, error: &str) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await.map_err(Self::infra)?;

        let current = sqlx::query("SELECT attempt, max_attempts FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Self::infra)?;

        let Some(current) = current else {
            return Ok(None);
        };
        let attempt: i32 = current.try_get("attempt").map_err(Self::infra)?;
        let max_attempts: i32 = current.try_get("max_attempts").map_err(Self::infra)?;
        let exhausted = attempt >= max_attempts;

        let row = if exhausted {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'dlq',
                    last_error = $3,
                    completed_at = now(),
                    updated_at = now(),
                    lease_owner = NULL,
                    lease_expires_at = NULL
                WHERE id = $1 AND status = 'running' AND lease_owner = $2
                RETURNING *
                "#,
            )
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'queued',
                    last_error = $3,
                    updated_at = now(),
                    lease_owner = NULL,
                    lease_expires_at = NULL
                WHERE id = $1 AND status = 'running' AND lease_owner = $2
                RETURNING *
                "#,
            )
        }
        .bind(job_id)
        .bind(worker_id)
        .bind(error)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Self::infra)?;

        tx.commit().await.map_err(Self::infra)?;

        if row.is_some() {
            if exhausted {
                tracing::warn!(job_id = %job_id, attempt, "job moved to dead-letter queue");
            } else {
                tracing::info!(job_id = %job_id, attempt, "job queued for retry");
            }
        }

        row.as_ref().map(row_to_job).transpose().map_err(QueueError::Infrastructure)
    }

    async fn retry_from_dlq(&self, job_id: Uuid, reset_attempts: bool) -> Result<Job> {
        let row = if reset_attempts {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'queued', attempt = 0, completed_at = NULL,
                    last_error = NULL, updated_at = now()
                WHERE id = $1 AND status = 'dlq'
                RETURNING *
                "#,
            )
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'queued', completed_at = NULL,
                    last_error = NULL, updated_at = now()
                WHERE id = $1 AND status = 'dlq'
                RETURNING *
                "#,
            )
        }
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::infra)?;

        match row {
            Some(row) => {
                let job = row_to_job(&row).map_err(QueueError::Infrastructure)?;
                tracing::info!(job_id = %job_id, "job retried from dead-letter queue");
                Ok(job)
            }
            None => {
                let current = self.get(job_id).await?;
                Err(QueueError::Conflict {
                    job_id,
                    current: current.status.to_string(),
                })
            }
        }
    }

    async fn extend_lease(&self, job_id: Uuid, worker_id: &str, extension: Duration) -> Result<bool> {
        let new_expires_at = Utc::now() + extension;

        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = $3, updated_at = now()
            WHERE id = $1 AND lease_owner = $2 AND status IN ('leased', 'running')
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(new_expires_at)
        .execute(&self.pool)
        .await
        .map_err(Self::infra)?
        .rows_affected();

        Ok(affected > 0)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', lease_owner = NULL, lease_expires_at = NULL, updated_at = now()
            WHERE status IN ('leased', 'running') AND lease_expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Self::infra)?
        .rows_affected();

        if affected > 0 {
            tracing::info!(count = affected, "recovered jobs with expired leases");
        }
        Ok(affected)
    }

    async fn active_count(&self, tenant_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM jobs WHERE tenant_id = $1 AND status IN ('leased', 'running')",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Self::infra)?;
        Ok(count)
    }

    async fn stats(&self, tenant_id: Option<&str>) -> Result<QueueStats> {
        let row = if let Some(tenant_id) = tenant_id {
            sqlx::query(
                r#"
                SELECT
                    count(*) FILTER (WHERE status = 'queued') AS queued,
                    count(*) FILTER (WHERE status = 'leased') AS leased,
                    count(*) FILTER (WHERE status = 'running') AS running,
                    count(*) FILTER (WHERE status = 'succeeded') AS succeeded,
                    count(*) FILTER (WHERE status = 'failed') AS failed,
                    count(*) FILTER (WHERE status = 'dlq') AS dlq
                FROM jobs WHERE tenant_id = $1
                "#,
            )
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                SELECT
                    count(*) FILTER (WHERE status = 'queued') AS queued,
                    count(*) FILTER (WHERE status = 'leased') AS leased,
                    count(*) FILTER (WHERE status = 'running') AS running,
                    count(*) FILTER (WHERE status = 'succeeded') AS succeeded,
                    count(*) FILTER (WHERE status = 'failed') AS failed,
                    count(*) FILTER (WHERE status = 'dlq') AS dlq
                FROM jobs
                "#,
            )
            .fetch_one(&self.pool)
            .await
        }
        .map_err(Self::infra)?;

        Ok(QueueStats {
            queued: row.try_get("queued").map_err(Self::infra)?,
            leased: row.try_get("leased").map_err(Self::infra)?,
            running: row.try_get("running").map_err(Self::infra)?,
            succeeded: row.try_get("succeeded").map_err(Self::infra)?,
            failed: row.try_get("failed").map_err(Self::infra)?,
            dlq: row.try_get("dlq").map_err(Self::infra)?,
        })
    }
}

/// Maintenance helpers that aren't part of the `JobStore` seam but are
/// useful operational affordances for a deployment built on this crate.
impl PgJobStore {
    /// Delete `SUCCEEDED` jobs completed before `older_than`. Retention
    /// policy is out of scope for the core; this is a convenience hook
    /// for callers who don't want to hand-write the SQL.
    pub async fn cleanup_succeeded(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM jobs WHERE status = 'succeeded' AND completed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(Self::infra)?
            .rows_affected();
        Ok(affected)
    }
}

/// Default [`TenantAdmissionPolicy`]: a live `COUNT(*)` against the
/// `jobs` table. Advisory — races with concurrent submissions and
/// leasing, by design.
#[derive(Clone)]
pub struct PgTenantAdmission {
    pool: PgPool,
}

impl PgTenantAdmission {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantAdmissionPolicy for PgTenantAdmission {
    async fn has_capacity(&self, tenant_id: &str, max_concurrent: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM jobs WHERE tenant_id = $1 AND status IN ('leased', 'running')",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| QueueError::Infrastructure(e.into()))?;

        Ok(count < max_concurrent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// These exercise the SQL against a real database and are gated
    /// behind `DATABASE_URL` so `cargo test` stays usable offline.
    /// Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.expect("connect to test database");
        sqlx::migrate!("./migrations").run(&pool).await.expect("run migrations");
        Some(pool)
    }

    #[tokio::test]
    #[ignore]
    async fn submit_is_idempotent_on_tenant_and_key() {
        let Some(pool) = test_pool().await else { return };
        let store = PgJobStore::new(pool);
        let req = SubmitRequest::new("acme", "key-1", serde_json::json!({"job_type": "echo"}));

        let (first, created_first) = store.submit(req.clone()).await.unwrap();
        let (second, created_second) = store.submit(req).await.unwrap();

        assert!(created_first);
        assert!(!created_second);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    #[ignore]
    async fn acquire_lease_respects_priority_then_fifo() {
        let Some(pool) = test_pool().await else { return };
        let store = PgJobStore::new(pool);

        store
            .submit(SubmitRequest::new("acme", "low-1", serde_json::json!({})).with_priority(Priority::Low))
            .await
            .unwrap();
        store
            .submit(
                SubmitRequest::new("acme", "crit-1", serde_json::json!({})).with_priority(Priority::Critical),
            )
            .await
            .unwrap();

        let leased = store.acquire_lease("worker-1", 10, None).await.unwrap();
        assert_eq!(leased[0].idempotency_key, "crit-1");
    }

    #[tokio::test]
    #[ignore]
    async fn fail_job_retries_until_attempts_exhausted_then_dlqs() {
        let Some(pool) = test_pool().await else { return };
        let store = PgJobStore::new(pool);
        let (job, _) = store
            .submit(SubmitRequest::new("acme", "flaky", serde_json::json!({})).with_max_attempts(2))
            .await
            .unwrap();

        let leased = store.acquire_lease("worker-1", 1, None).await.unwrap();
        let running = store.start_job(leased[0].id, "worker-1").await.unwrap().unwrap();
        let failed = store.fail_job(running.id, "worker-1", "boom").await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Queued);

        let leased = store.acquire_lease("worker-1", 1, None).await.unwrap();
        let running = store.start_job(leased[0].id, "worker-1").await.unwrap().unwrap();
        let dlqd = store.fail_job(running.id, "worker-1", "boom again").await.unwrap().unwrap();
        assert_eq!(dlqd.status, JobStatus::Dlq);
        assert_eq!(dlqd.id, job.id);
    }

    #[tokio::test]
    #[ignore]
    async fn reclaim_expired_covers_leased_and_running() {
        let Some(pool) = test_pool().await else { return };
        let store = PgJobStore::with_lease_duration(pool, std::time::Duration::from_millis(1));
        store.submit(SubmitRequest::new("acme", "stale", serde_json::json!({}))).await.unwrap();
        let leased = store.acquire_lease("worker-1", 1, None).await.unwrap();
        store.start_job(leased[0].id, "worker-1").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let recovered = store.reclaim_expired(Utc::now()).await.unwrap();
        assert_eq!(recovered, 1);

        let job = store.get(leased[0].id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.lease_owner.is_none());
    }
}
