//! Poll-execute-heartbeat worker loop.
//!
//! A `Worker` owns no job state itself — every transition it drives is a
//! conditional write against the [`JobStore`] scoped to its own
//! `worker_id`. Crashing a worker mid-job is always safe: the lease
//! simply expires and the reaper returns the job to `QUEUED`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashSet;
use futures::FutureExt;
use uuid::Uuid;
use wharf_core::{EventBus, HandlerRegistry, Job, JobContext, JobEvent, JobStore, WorkerConfig};

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Executes jobs claimed from a [`JobStore`], dispatching each to its
/// registered [`wharf_core::JobHandler`] and extending leases on
/// in-flight jobs on a fixed heartbeat.
pub struct Worker {
    worker_id: String,
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    events: EventBus,
    config: WorkerConfig,
    running: Arc<AtomicBool>,
    in_flight: Arc<DashSet<Uuid>>,
}

impl Worker {
    /// `worker_id` should be stable and unique per process — the
    /// default convention (hostname + pid) is left to the caller since
    /// this crate has no opinion on deployment topology.
    pub fn new(
        worker_id: impl Into<String>,
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        events: EventBus,
        config: WorkerConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            store,
            registry: Arc::new(registry),
            events,
            config,
            running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(DashSet::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// A clonable handle that lets another task call [`Self::stop`]
    /// while `run` is in progress.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            running: self.running.clone(),
        }
    }

    /// Runs the poll loop until [`WorkerHandle::stop`] is called,
    /// draining in-flight jobs before returning.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(worker_id = %self.worker_id, batch_size = self.config.batch_size, "worker starting");

        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            self.worker_id.clone(),
            self.store.clone(),
            self.in_flight.clone(),
            self.running.clone(),
            self.config.heartbeat_interval,
            self.config.lease_duration,
        ));

        while self.running.load(Ordering::SeqCst) {
            let processed = self.poll_and_execute().await;
            if processed == 0 {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        // Spin until every job we claimed has reported back through
        // complete_job/fail_job and removed itself from in_flight.
        while !self.in_flight.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        heartbeat.abort();
        let _ = heartbeat.await;

        tracing::info!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn poll_and_execute(&self) -> usize {
        let jobs = match self.store.acquire_lease(&self.worker_id, self.config.batch_size, None).await {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::error!(worker_id = %self.worker_id, error = %err, "error acquiring lease");
                return 0;
            }
        };

        if jobs.is_empty() {
            return 0;
        }

        tracing::info!(worker_id = %self.worker_id, count = jobs.len(), "acquired jobs");

        let mut tasks = Vec::with_capacity(jobs.len());
        for job in jobs {
            let job_id = job.id;
            self.in_flight.insert(job_id);
            let store = self.store.clone();
            let registry = self.registry.clone();
            let events = self.events.clone();
            let in_flight = self.in_flight.clone();
            let worker_id = self.worker_id.clone();
            tasks.push(tokio::spawn(async move {
                Self::execute_job(worker_id, store, registry, events, job).await;
                in_flight.remove(&job_id);
            }));
        }

        let count = tasks.len();
        for task in tasks {
            let _ = task.await;
        }
        count
    }

    async fn execute_job(
        worker_id: String,
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        events: EventBus,
        job: Job,
    ) {
        let job_id = job.id;
        let started_at = Instant::now();

        let running = match store.start_job(job_id, &worker_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "could not start job, lease likely expired");
                return;
            }
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "error starting job");
                return;
            }
        };

        events.publish(JobEvent::started(job_id, running.tenant_id.clone(), &worker_id, running.attempt));

        let job_type = wharf_core::payload_job_type(&running.payload).unwrap_or("");
        let handler = registry.get(job_type);

        let ctx = JobContext {
            job_id,
            tenant_id: running.tenant_id.clone(),
            attempt: running.attempt,
            max_attempts: running.max_attempts,
            payload: running.payload.clone(),
            lease_owner: worker_id.clone(),
            lease_expires_at: running.lease_expires_at,
        };

        let result = match handler {
            Some(handler) => match std::panic::AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => wharf_core::JobResult::failure(format!("handler panicked: {}", panic_message(&panic))),
            },
            None => wharf_core::JobResult::failure(format!("no handler registered for job_type '{job_type}'")),
        };

        let duration = started_at.elapsed();

        if result.success {
            match store.complete_job(job_id, &worker_id, result.output.clone()).await {
                Ok(Some(_)) => {
                    tracing::info!(job_id = %job_id, ?duration, "job completed");
                    events.publish(JobEvent::completed(job_id, running.tenant_id.clone(), result.output.as_ref()));
                }
                Ok(None) => tracing::warn!(job_id = %job_id, "lease lost before completion could be recorded"),
                Err(err) => tracing::error!(job_id = %job_id, error = %err, "error completing job"),
            }
        } else {
            let error = result.error.clone().unwrap_or_else(|| "unknown error".to_string());
            match store.fail_job(job_id, &worker_id, &error).await {
                Ok(Some(updated)) => {
                    let will_retry = updated.status == wharf_core::JobStatus::Queued;
                    tracing::warn!(job_id = %job_id, %error, will_retry, "job failed");
                    events.publish(JobEvent::failed(job_id, running.tenant_id.clone(), &error, running.attempt, will_retry));
                    if !will_retry {
                        events.publish(JobEvent::dlq(job_id, running.tenant_id.clone(), &error, updated.attempt));
                    }
                }
                Ok(None) => tracing::warn!(job_id = %job_id, "lease lost before failure could be recorded"),
                Err(err) => tracing::error!(job_id = %job_id, error = %err, "error recording job failure"),
            }
        }
    }

    async fn heartbeat_loop(
        worker_id: String,
        store: Arc<dyn JobStore>,
        in_flight: Arc<DashSet<Uuid>>,
        running: Arc<AtomicBool>,
        interval: std::time::Duration,
        lease_duration: std::time::Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let extension = chrono::Duration::from_std(lease_duration).unwrap_or(chrono::Duration::seconds(30));

        loop {
            ticker.tick().await;
            if !running.load(Ordering::SeqCst) && in_flight.is_empty() {
                return;
            }

            for job_id in in_flight.iter().map(|e| *e).collect::<Vec<_>>() {
                match store.extend_lease(job_id, &worker_id, extension).await {
                    Ok(true) => tracing::debug!(job_id = %job_id, "extended lease"),
                    Ok(false) => tracing::warn!(job_id = %job_id, "lease already lost, could not extend"),
                    Err(err) => tracing::error!(job_id = %job_id, error = %err, "error extending lease"),
                }
            }
        }
    }
}

/// A clonable stop switch for a running [`Worker`].
#[derive(Clone)]
pub struct WorkerHandle {
    running: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
