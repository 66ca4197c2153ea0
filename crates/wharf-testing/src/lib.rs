//! In-memory [`JobStore`] with the same observable semantics as
//! `wharf-postgres`, for worker/reaper tests that shouldn't need a
//! running database.
//!
//! This is not a performance-oriented implementation: every operation
//! locks the whole table. That's fine here — the point is behavioral
//! fidelity to the Postgres store, not throughput.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;
use wharf_core::{
    Job, JobPage, JobStatus, JobStore, Priority, QueueError, QueueStats, Result, SubmitRequest,
    TenantAdmissionPolicy,
};

/// An in-process, in-memory stand-in for `PgJobStore`. Cloning shares
/// the same underlying table (it's an `Arc<Mutex<..>>` internally).
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
    default_lease: std::time::Duration,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            default_lease: std::time::Duration::from_secs(30),
        }
    }

    pub fn with_lease_duration(lease_duration: std::time::Duration) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            default_lease: lease_duration,
        }
    }

    /// Test helper: snapshot a job directly, bypassing the trait.
    pub async fn peek(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.lock().await.get(&job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn submit(&self, request: SubmitRequest) -> Result<(Job, bool)> {
        if request.idempotency_key.is_empty() || request.idempotency_key.len() > 255 {
            return Err(QueueError::InvalidArgument(
                "idempotency_key must be 1..=255 bytes".to_string(),
            ));
        }
        if request.max_attempts < 1 {
            return Err(QueueError::InvalidArgument("max_attempts must be >= 1".to_string()));
        }

        let mut jobs = self.jobs.lock().await;

        if let Some(existing) = jobs
            .values()
            .find(|j| j.tenant_id == request.tenant_id && j.idempotency_key == request.idempotency_key)
        {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            idempotency_key: request.idempotency_key,
            payload: request.payload,
            status: JobStatus::Queued,
            priority: request.priority,
            attempt: 0,
            max_attempts: request.max_attempts,
            lease_owner: None,
            lease_expires_at: None,
            scheduled_at: Some(request.scheduled_at.unwrap_or(now)),
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_error: None,
            result: None,
        };
        jobs.insert(job.id, job.clone());
        Ok((job, true))
    }

    async fn get(&self, job_id: Uuid) -> Result<Job> {
        self.jobs.lock().await.get(&job_id).cloned().ok_or(QueueError::NotFound(job_id))
    }

    async fn list(&self, tenant_id: &str, status: Option<JobStatus>, page: u32, page_size: u32) -> Result<JobPage> {
        let jobs = self.jobs.lock().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && status.map(|s| j.status == s).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as i64;
        let offset = (page.saturating_sub(1) as usize) * page_size as usize;
        let page_jobs = matching.into_iter().skip(offset).take(page_size as usize).collect();

        Ok(JobPage { jobs: page_jobs, total })
    }

    async fn acquire_lease(&self, worker_id: &str, batch_size: i64, tenant_filter: Option<&str>) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();

        let mut candidates: Vec<Uuid> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Queued
                    && j.scheduled_at.map(|s| s <= now).unwrap_or(true)
                    && tenant_filter.map(|t| j.tenant_id == t).unwrap_or(true)
            })
            .map(|j| j.id)
            .collect();

        candidates.sort_by(|a, b| {
            let ja = &jobs[a];
            let jb = &jobs[b];
            jb.priority.weight().cmp(&ja.priority.weight()).then(ja.created_at.cmp(&jb.created_at))
        });
        candidates.truncate(batch_size.max(0) as usize);

        let lease_expires_at = now + Duration::from_std(self.default_lease).unwrap();
        let mut leased = Vec::with_capacity(candidates.len());
        for id in candidates {
            let job = jobs.get_mut(&id).expect("candidate id came from this map");
            job.status = JobStatus::Leased;
            job.lease_owner = Some(worker_id.to_string());
            job.lease_expires_at = Some(lease_expires_at);
            job.updated_at = now;
            leased.push(job.clone());
        }
        Ok(leased)
    }

    async fn start_job(&self, job_id: Uuid, worker_id: &str) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&job_id) else { return Ok(None) };
        if job.status != JobStatus::Leased || job.lease_owner.as_deref() != Some(worker_id) {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.attempt += 1;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, job_id: Uuid, worker_id: &str, result: Option<serde_json::Value>) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&job_id) else { return Ok(None) };
        if job.status != JobStatus::Running || job.lease_owner.as_deref() != Some(worker_id) {
            return Ok(None);
        }
        let now = Utc::now();
        job.status = JobStatus::Succeeded;
        job.completed_at = Some(now);
        job.updated_at = now;
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.result = result;
        Ok(Some(job.clone()))
    }

    async fn fail_job(&self, job_id: Uuid, worker_id: &str, error: &str) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&job_id) else { return Ok(None) };
        if job.status != JobStatus::Running || job.lease_owner.as_deref() != Some(worker_id) {
            return Ok(None);
        }
        let now = Utc::now();
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        job.lease_owner = None;
        job.lease_expires_at = None;
        if job.attempt >= job.max_attempts {
            job.status = JobStatus::Dlq;
            job.completed_at = Some(now);
        } else {
            job.status = JobStatus::Queued;
        }
        Ok(Some(job.clone()))
    }

    async fn retry_from_dlq(&self, job_id: Uuid, reset_attempts: bool) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        if job.status != JobStatus::Dlq {
            return Err(QueueError::Conflict { job_id, current: job.status.to_string() });
        }
        job.status = JobStatus::Queued;
        job.completed_at = None;
        job.last_error = None;
        job.updated_at = Utc::now();
        if reset_attempts {
            job.attempt = 0;
        }
        Ok(job.clone())
    }

    async fn extend_lease(&self, job_id: Uuid, worker_id: &str, extension: Duration) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&job_id) else { return Ok(false) };
        if job.lease_owner.as_deref() != Some(worker_id) || !job.status.holds_lease() {
            return Ok(false);
        }
        job.lease_expires_at = Some(Utc::now() + extension);
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let mut count = 0u64;
        for job in jobs.values_mut() {
            if job.status.holds_lease() && job.lease_expires_at.map(|e| e < now).unwrap_or(false) {
                job.status = JobStatus::Queued;
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn active_count(&self, tenant_id: &str) -> Result<i64> {
        let jobs = self.jobs.lock().await;
        Ok(jobs.values().filter(|j| j.tenant_id == tenant_id && j.status.holds_lease()).count() as i64)
    }

    async fn stats(&self, tenant_id: Option<&str>) -> Result<QueueStats> {
        let jobs = self.jobs.lock().await;
        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|j| tenant_id.map(|t| j.tenant_id == t).unwrap_or(true)) {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Leased => stats.leased += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Dlq => stats.dlq += 1,
            }
        }
        Ok(stats)
    }
}

/// In-memory [`TenantAdmissionPolicy`] matching `PgTenantAdmission`'s
/// semantics: a live count against the same backing map.
#[derive(Clone)]
pub struct MemoryTenantAdmission {
    store: MemoryJobStore,
}

impl MemoryTenantAdmission {
    pub fn new(store: MemoryJobStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TenantAdmissionPolicy for MemoryTenantAdmission {
    async fn has_capacity(&self, tenant_id: &str, max_concurrent: i64) -> Result<bool> {
        Ok(self.store.active_count(tenant_id).await? < max_concurrent)
    }
}

/// Always-admit policy for tests that don't care about the concurrency
/// cap at all.
pub struct UnlimitedAdmission;

#[async_trait]
impl TenantAdmissionPolicy for UnlimitedAdmission {
    async fn has_capacity(&self, _tenant_id: &str, _max_concurrent: i64) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_is_idempotent() {
        let store = MemoryJobStore::new();
        let req = SubmitRequest::new("acme", "key-1", serde_json::json!({}));
        let (first, created_first) = store.submit(req.clone()).await.unwrap();
        let (second, created_second) = store.submit(req).await.unwrap();
        assert!(created_first);
        assert!(!created_second);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn acquire_lease_orders_by_priority_then_fifo() {
        let store = MemoryJobStore::new();
        store.submit(SubmitRequest::new("acme", "a", serde_json::json!({})).with_priority(Priority::Low)).await.unwrap();
        store.submit(SubmitRequest::new("acme", "b", serde_json::json!({})).with_priority(Priority::Critical)).await.unwrap();
        store.submit(SubmitRequest::new("acme", "c", serde_json::json!({})).with_priority(Priority::Normal)).await.unwrap();

        let leased = store.acquire_lease("w1", 10, None).await.unwrap();
        let order: Vec<&str> = leased.iter().map(|j| j.idempotency_key.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn full_lifecycle_success() {
        let store = MemoryJobStore::new();
        let (job, _) = store.submit(SubmitRequest::new("acme", "k", serde_json::json!({}))).await.unwrap();
        let leased = store.acquire_lease("w1", 1, None).await.unwrap();
        assert_eq!(leased[0].id, job.id);
        let running = store.start_job(job.id, "w1").await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.attempt, 1);
        let done = store.complete_job(job.id, "w1", Some(serde_json::json!({"ok": true}))).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn fail_job_retries_then_dlqs() {
        let store = MemoryJobStore::new();
        let (job, _) = store.submit(SubmitRequest::new("acme", "k", serde_json::json!({})).with_max_attempts(2)).await.unwrap();

        store.acquire_lease("w1", 1, None).await.unwrap();
        store.start_job(job.id, "w1").await.unwrap();
        let retried = store.fail_job(job.id, "w1", "boom").await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Queued);

        store.acquire_lease("w1", 1, None).await.unwrap();
        store.start_job(job.id, "w1").await.unwrap();
        let dlqd = store.fail_job(job.id, "w1", "boom again").await.unwrap().unwrap();
        assert_eq!(dlqd.status, JobStatus::Dlq);
    }

    #[tokio::test]
    async fn reclaim_expired_covers_leased_and_running() {
        let store = MemoryJobStore::with_lease_duration(std::time::Duration::from_millis(1));
        let (job, _) = store.submit(SubmitRequest::new("acme", "k", serde_json::json!({}))).await.unwrap();
        store.acquire_lease("w1", 1, None).await.unwrap();
        store.start_job(job.id, "w1").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let recovered = store.reclaim_expired(Utc::now()).await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn extend_lease_fails_for_wrong_owner() {
        let store = MemoryJobStore::new();
        let (job, _) = store.submit(SubmitRequest::new("acme", "k", serde_json::json!({}))).await.unwrap();
        store.acquire_lease("w1", 1, None).await.unwrap();
        let ok = store.extend_lease(job.id, "w2", Duration::seconds(30)).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn submit_rejects_idempotency_key_over_255_bytes() {
        let store = MemoryJobStore::new();
        let key = "k".repeat(256);
        let err = store
            .submit(SubmitRequest::new("acme", key, serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn submit_with_admission_denies_at_tenant_cap() {
        let store = MemoryJobStore::new();
        let admission = MemoryTenantAdmission::new(store.clone());

        for i in 0..2 {
            let (job, _) = wharf_core::submit_with_admission(
                &store,
                &admission,
                2,
                SubmitRequest::new("t1", format!("job-{i}"), serde_json::json!({})),
            )
            .await
            .unwrap();
            store.acquire_lease("w1", 1, None).await.unwrap();
            let _ = job;
        }

        let denied = wharf_core::submit_with_admission(
            &store,
            &admission,
            2,
            SubmitRequest::new("t1", "job-2", serde_json::json!({})),
        )
        .await;
        assert!(matches!(denied, Err(QueueError::TenantAtCapacity { .. })));

        // Bypassing admission and submitting straight to the store still succeeds.
        let (direct, created) = store
            .submit(SubmitRequest::new("t1", "job-2", serde_json::json!({})))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(direct.idempotency_key, "job-2");
    }
}
