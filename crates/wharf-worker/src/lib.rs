//! Worker loop and lease reaper that drive a [`wharf_core::JobStore`].
//!
//! Neither type holds any state that matters after a crash: a killed
//! worker leaves its in-flight jobs leased until they expire, and the
//! reaper is what turns that expiry into a requeue. Run one or more
//! `Worker`s and exactly one (or a few, for availability) `Reaper`
//! alongside your `JobStore` of choice.

mod reaper;
mod worker;

pub use reaper::{Reaper, ReaperHandle};
pub use worker::{Worker, WorkerHandle};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wharf_core::{
        EventBus, HandlerRegistry, JobContext, JobHandler, JobResult, JobStatus, ReaperConfig,
        SubmitRequest, WorkerConfig,
    };
    use wharf_testing::MemoryJobStore;

    struct EchoHandler;

    #[wharf_core::async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(&self, ctx: JobContext) -> JobResult {
            JobResult::ok(ctx.payload)
        }
    }

    struct PanickingHandler;

    #[wharf_core::async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, _ctx: JobContext) -> JobResult {
            panic!("handler blew up");
        }
    }

    struct AlwaysFailHandler;

    #[wharf_core::async_trait]
    impl JobHandler for AlwaysFailHandler {
        async fn handle(&self, _ctx: JobContext) -> JobResult {
            JobResult::failure("handler always fails")
        }
    }

    fn fast_worker_config() -> WorkerConfig {
        WorkerConfig {
            lease_duration: std::time::Duration::from_secs(5),
            poll_interval: std::time::Duration::from_millis(10),
            batch_size: 10,
            heartbeat_interval: std::time::Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn worker_executes_echo_job_to_completion() {
        let store: Arc<dyn wharf_core::JobStore> = Arc::new(MemoryJobStore::new());
        let (job, _) = store
            .submit(SubmitRequest::new("acme", "k1", serde_json::json!({"job_type": "echo", "n": 1})))
            .await
            .unwrap();

        let registry = HandlerRegistry::new().register("echo", EchoHandler);
        let worker = Worker::new("w1", store.clone(), registry, EventBus::new(), fast_worker_config());
        let handle = worker.handle();

        let run = tokio::spawn(async move { worker.run().await });
        // Give the poll loop a couple of ticks to claim and finish the job.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        handle.stop();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), run).await;

        let finished = store.get(job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn worker_routes_failures_through_fail_job() {
        let store: Arc<dyn wharf_core::JobStore> = Arc::new(MemoryJobStore::new());
        let (job, _) = store
            .submit(
                SubmitRequest::new("acme", "k1", serde_json::json!({"job_type": "boom"})).with_max_attempts(1),
            )
            .await
            .unwrap();

        let registry = HandlerRegistry::new().register("boom", AlwaysFailHandler);
        let worker = Worker::new("w1", store.clone(), registry, EventBus::new(), fast_worker_config());
        let handle = worker.handle();

        let run = tokio::spawn(async move { worker.run().await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        handle.stop();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), run).await;

        let finished = store.get(job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Dlq);
        assert_eq!(finished.last_error.as_deref(), Some("handler always fails"));
    }

    #[tokio::test]
    async fn worker_converts_handler_panic_into_failure() {
        let store: Arc<dyn wharf_core::JobStore> = Arc::new(MemoryJobStore::new());
        let (job, _) = store
            .submit(
                SubmitRequest::new("acme", "k1", serde_json::json!({"job_type": "explode"})).with_max_attempts(1),
            )
            .await
            .unwrap();

        let registry = HandlerRegistry::new().register("explode", PanickingHandler);
        let worker = Worker::new("w1", store.clone(), registry, EventBus::new(), fast_worker_config());
        let handle = worker.handle();

        let run = tokio::spawn(async move { worker.run().await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        handle.stop();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), run).await;

        let finished = store.get(job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Dlq);
        assert!(finished.last_error.as_deref().unwrap().contains("handler panicked"));
    }

    #[tokio::test]
    async fn reaper_recovers_expired_lease_left_by_dead_worker() {
        let store = Arc::new(MemoryJobStore::with_lease_duration(std::time::Duration::from_millis(1)));
        let dyn_store: Arc<dyn wharf_core::JobStore> = store.clone();
        let (job, _) = dyn_store
            .submit(SubmitRequest::new("acme", "k1", serde_json::json!({})))
            .await
            .unwrap();
        dyn_store.acquire_lease("dead-worker", 1, None).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let reaper = Reaper::new(dyn_store.clone(), ReaperConfig { reaper_interval: std::time::Duration::from_millis(10) });
        let recovered = reaper.run_once().await.unwrap();

        assert_eq!(recovered, 1);
        assert_eq!(dyn_store.get(job.id).await.unwrap().status, JobStatus::Queued);
    }
}
