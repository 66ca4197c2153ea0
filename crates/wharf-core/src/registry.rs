//! Handler registry: `job_type -> handler`, built once at process
//! startup. No decorators, no runtime reflection — see the design
//! notes on re-architecting the source's decorator-registered map.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::job::{JobContext, JobResult};

/// Executes one job type. Implementations must be idempotent: under
/// at-least-once delivery, `handle` may run more than once for the
/// same `job_id`/`attempt` pair.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> JobResult;
}

/// A process-wide map from `job_type` to the handler that runs it,
/// looked up by the worker loop on every claimed job.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `job_type`. Registering the same type
    /// twice replaces the earlier handler — this is a startup-time
    /// wiring step, not a runtime hot-swap mechanism.
    pub fn register(mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Extracts `job_type` from a payload shaped `{"job_type": "...", ...}`,
/// the convention every example handler and demo binary follows. The
/// core does not enforce this shape — it is a convention the registry
/// lookup in the worker loop relies on, not a schema the store validates.
pub fn payload_job_type(payload: &serde_json::Value) -> Option<&str> {
    payload.get("job_type").and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(&self, ctx: JobContext) -> JobResult {
            JobResult::ok(ctx.payload)
        }
    }

    #[tokio::test]
    async fn registers_and_looks_up_by_job_type() {
        let registry = HandlerRegistry::new().register("echo", EchoHandler);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.job_types(), vec!["echo"]);
    }

    #[test]
    fn extracts_job_type_from_payload() {
        let payload = serde_json::json!({"job_type": "echo", "data": {}});
        assert_eq!(payload_job_type(&payload), Some("echo"));
        assert_eq!(payload_job_type(&serde_json::json!({})), None);
    }
}
