//! The `Job` aggregate and the types that make up its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of a job in the lifecycle state machine.
///
/// Legal transitions are enumerated in the crate-level docs; every
/// transition is expressed by the store as a single conditional UPDATE.
/// `Failed` is a reserved variant: no transition in this core ever
/// produces it, terminal failure is always [`JobStatus::Dlq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Leased,
    Running,
    Succeeded,
    Failed,
    Dlq,
}

impl JobStatus {
    /// Statuses under which a job is considered "active" and counted
    /// against a tenant's concurrency cap.
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Leased, JobStatus::Running];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Dlq)
    }

    pub fn holds_lease(self) -> bool {
        matches!(self, JobStatus::Leased | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Leased => "leased",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Dlq => "dlq",
        };
        f.write_str(s)
    }
}

/// Scheduling weight. Higher priorities are leased first; within a
/// priority band, jobs are leased FIFO by `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Numeric weight baked into the lease scan's `ORDER BY`.
    pub fn weight(self) -> i32 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 5,
            Priority::High => 10,
            Priority::Critical => 100,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Authoritative record of a unit of work.
///
/// The store owns this row; workers and the reaper mutate it only
/// through the conditional transitions on [`crate::JobStore`]. Never
/// hold a `Job` across a transaction boundary as if it were current —
/// re-fetch after any operation that might have raced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: Priority,
    pub attempt: i32,
    pub max_attempts: i32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl Job {
    pub fn is_retryable(&self) -> bool {
        self.attempt < self.max_attempts
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expires_at {
            Some(expires) => now > expires,
            None => true,
        }
    }
}

/// Parameters accepted by [`crate::JobStore::submit`].
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub tenant_id: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl SubmitRequest {
    pub fn new(tenant_id: impl Into<String>, idempotency_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            idempotency_key: idempotency_key.into(),
            payload,
            max_attempts: 3,
            priority: Priority::Normal,
            scheduled_at: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }
}

/// Context handed to a [`crate::JobHandler`] for a single execution attempt.
///
/// Handlers must be idempotent: under at-least-once delivery the same
/// `job_id` at the same `attempt` may in rare crash-recovery windows be
/// observed by two different workers in flight at once.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub payload: serde_json::Value,
    pub lease_owner: String,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl JobContext {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn remaining_attempts(&self) -> i32 {
        (self.max_attempts - self.attempt).max(0)
    }
}

/// Outcome of a single handler invocation.
#[derive(Debug, Clone, Default)]
pub struct JobResult {
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl JobResult {
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}
