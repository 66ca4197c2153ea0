//! Fire-and-forget lifecycle event bus.
//!
//! At-most-once delivery: slow or absent subscribers miss events and
//! that must never affect job-state correctness — the database row
//! remains the only source of truth. There is no happens-before
//! relationship between an event and subsequent reads; a subscriber
//! that needs consistency must re-query the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::JobStatus;

/// The channel capacity for the underlying `tokio::sync::broadcast`
/// channel. A subscriber that falls this far behind observes a
/// `Lagged` error on its next `recv` rather than unbounded memory growth.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Started,
    Completed,
    Failed,
    Dlq,
    Retried,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Created => "job.created",
            EventType::Started => "job.started",
            EventType::Completed => "job.completed",
            EventType::Failed => "job.failed",
            EventType::Dlq => "job.dlq",
            EventType::Retried => "job.retried",
        };
        f.write_str(s)
    }
}

/// A lifecycle event emitted on the bus. Mirrors the wire shape
/// external subscribers (e.g. a WebSocket fan-out, out of scope here)
/// consume: `{ event_type, job_id, tenant_id, status, timestamp, data? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub event_type: EventType,
    pub job_id: Uuid,
    pub tenant_id: String,
    pub status: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub data: Option<serde_json::Value>,
}

impl JobEvent {
    pub fn created(job_id: Uuid, tenant_id: impl Into<String>, payload: &serde_json::Value) -> Self {
        Self {
            event_type: EventType::Created,
            job_id,
            tenant_id: tenant_id.into(),
            status: JobStatus::Queued,
            timestamp: Utc::now(),
            data: Some(serde_json::json!({ "payload": payload })),
        }
    }

    pub fn started(job_id: Uuid, tenant_id: impl Into<String>, worker_id: &str, attempt: i32) -> Self {
        Self {
            event_type: EventType::Started,
            job_id,
            tenant_id: tenant_id.into(),
            status: JobStatus::Running,
            timestamp: Utc::now(),
            data: Some(serde_json::json!({ "worker_id": worker_id, "attempt": attempt })),
        }
    }

    pub fn completed(job_id: Uuid, tenant_id: impl Into<String>, result: Option<&serde_json::Value>) -> Self {
        Self {
            event_type: EventType::Completed,
            job_id,
            tenant_id: tenant_id.into(),
            status: JobStatus::Succeeded,
            timestamp: Utc::now(),
            data: result.map(|r| serde_json::json!({ "result": r })),
        }
    }

    pub fn failed(job_id: Uuid, tenant_id: impl Into<String>, error: &str, attempt: i32, will_retry: bool) -> Self {
        Self {
            event_type: EventType::Failed,
            job_id,
            tenant_id: tenant_id.into(),
            status: if will_retry { JobStatus::Queued } else { JobStatus::Failed },
            timestamp: Utc::now(),
            data: Some(serde_json::json!({ "error": error, "attempt": attempt, "will_retry": will_retry })),
        }
    }

    pub fn dlq(job_id: Uuid, tenant_id: impl Into<String>, error: &str, attempts: i32) -> Self {
        Self {
            event_type: EventType::Dlq,
            job_id,
            tenant_id: tenant_id.into(),
            status: JobStatus::Dlq,
            timestamp: Utc::now(),
            data: Some(serde_json::json!({ "error": error, "total_attempts": attempts })),
        }
    }

    pub fn retried(job_id: Uuid, tenant_id: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Retried,
            job_id,
            tenant_id: tenant_id.into(),
            status: JobStatus::Queued,
            timestamp: Utc::now(),
            data: None,
        }
    }
}

/// Broadcast handle for lifecycle events. Cheap to clone; every clone
/// shares the same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Best-effort: if there are no subscribers this
    /// is a no-op, never an error.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events. Filter by `tenant_id` client-side —
    /// the bus does not partition channels per tenant.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let bus = EventBus::new();
        bus.publish(JobEvent::created(Uuid::new_v4(), "t1", &serde_json::json!({})));
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let job_id = Uuid::new_v4();
        bus.publish(JobEvent::completed(job_id, "t1", None));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id, job_id);
        assert_eq!(event.event_type, EventType::Completed);
    }

    #[tokio::test]
    async fn lagged_subscriber_observes_lag_not_a_panic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for _ in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish(JobEvent::retried(Uuid::new_v4(), "t1"));
        }

        let first = rx.recv().await;
        assert!(matches!(first, Err(broadcast::error::RecvError::Lagged(_))));
    }
}
