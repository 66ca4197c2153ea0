//! The [`JobStore`] seam: the one trait both `wharf-postgres` and
//! `wharf-testing` implement, and the only thing the worker loop and
//! reaper depend on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{Job, JobStatus, SubmitRequest};

/// A page of [`Job`]s plus the total count matching the filter, for
/// `newest-first` pagination.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: i64,
}

/// Per-status job counts, as returned by [`JobStore::stats`].
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub queued: i64,
    pub leased: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub dlq: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.queued + self.leased + self.running + self.succeeded + self.failed + self.dlq
    }
}

/// The durable job store: the sole arbiter of job state.
///
/// Every mutating method is expected to be a single atomic operation
/// (one transaction, one conditional UPDATE or one `FOR UPDATE SKIP
/// LOCKED` scan) — implementations must not split a transition across
/// multiple round trips in a way that lets another writer observe a
/// partially-applied state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Idempotent intake. Returns `created = false` and the existing row
    /// on a duplicate `(tenant_id, idempotency_key)` without touching
    /// its payload. Does **not** consult tenant admission itself — this
    /// is the raw store primitive; producers that want the admission
    /// gate call [`submit_with_admission`] instead.
    async fn submit(&self, request: SubmitRequest) -> Result<(Job, bool)>;

    async fn get(&self, job_id: Uuid) -> Result<Job>;

    async fn list(
        &self,
        tenant_id: &str,
        status: Option<JobStatus>,
        page: u32,
        page_size: u32,
    ) -> Result<JobPage>;

    /// Atomically lease up to `batch_size` ready jobs, highest priority
    /// first, FIFO within a priority band. Returns an empty vec rather
    /// than erroring when nothing is ready.
    async fn acquire_lease(
        &self,
        worker_id: &str,
        batch_size: i64,
        tenant_filter: Option<&str>,
    ) -> Result<Vec<Job>>;

    /// `LEASED -> RUNNING`, incrementing `attempt`. Returns `Ok(None)`
    /// (not an error) if the caller no longer owns the lease.
    async fn start_job(&self, job_id: Uuid, worker_id: &str) -> Result<Option<Job>>;

    /// `RUNNING -> SUCCEEDED`. Returns `Ok(None)` if the caller no
    /// longer owns the lease (the job may have been reaped and retried
    /// or completed by someone else already).
    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<Option<Job>>;

    /// `RUNNING -> QUEUED` (retry) or `RUNNING -> DLQ` (attempts
    /// exhausted), decided from the job's own `attempt`/`max_attempts`.
    async fn fail_job(&self, job_id: Uuid, worker_id: &str, error: &str) -> Result<Option<Job>>;

    /// `DLQ -> QUEUED`. Errors with `Conflict` if the job is not
    /// currently in `DLQ`.
    async fn retry_from_dlq(&self, job_id: Uuid, reset_attempts: bool) -> Result<Job>;

    /// Extend the lease on a job currently held by `worker_id`. Returns
    /// `false` (not an error) if the lease was already lost.
    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        extension: chrono::Duration,
    ) -> Result<bool>;

    /// Recover jobs whose lease has expired while `LEASED` or
    /// `RUNNING`, returning them to `QUEUED`. Returns the count
    /// recovered.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Count of jobs currently `LEASED` or `RUNNING` for a tenant.
    async fn active_count(&self, tenant_id: &str) -> Result<i64>;

    async fn stats(&self, tenant_id: Option<&str>) -> Result<QueueStats>;
}

/// Gate consulted by [`JobStore::submit`] before the row is inserted.
///
/// Split out from `JobStore` so the concurrency check can be backed by
/// something other than a live `COUNT(*)` scan (e.g. a cached counter)
/// without touching the submission path itself.
#[async_trait]
pub trait TenantAdmissionPolicy: Send + Sync {
    /// Returns `true` if `tenant_id` has capacity for one more active
    /// job under `max_concurrent`. This is advisory: the check races
    /// with concurrent submissions and leasing, so brief over-subscription
    /// is possible and accepted (see design notes on tenant admission).
    async fn has_capacity(&self, tenant_id: &str, max_concurrent: i64) -> Result<bool>;
}

/// The producer-facing submission path: checks [`TenantAdmissionPolicy`]
/// before delegating to [`JobStore::submit`], failing closed with
/// `TenantAtCapacity` rather than creating the row. Calling
/// `store.submit(..)` directly bypasses this gate entirely — that's
/// intentional (e.g. the reaper and internal retries never need an
/// admission check), so producers must go through this function.
pub async fn submit_with_admission(
    store: &dyn JobStore,
    admission: &dyn TenantAdmissionPolicy,
    max_concurrent: i64,
    request: SubmitRequest,
) -> Result<(Job, bool)> {
    if !admission.has_capacity(&request.tenant_id, max_concurrent).await? {
        return Err(crate::error::QueueError::TenantAtCapacity {
            tenant_id: request.tenant_id,
            max: max_concurrent,
        });
    }
    store.submit(request).await
}
