//! # Wharf
//!
//! Core of a durable, multi-tenant distributed job queue backed by a
//! relational database. Wharf accepts jobs from many producers,
//! distributes them to a fleet of stateless workers, guarantees
//! at-least-once execution, tolerates worker crashes, and enforces
//! per-tenant fairness through priority ordering and concurrency caps.
//!
//! ## Architecture
//!
//! ```text
//! Producer
//!     │ submit()
//!     ▼
//! JobStore (Postgres) ───────────────────────────────┐
//!     │         ▲                                    │
//!     │ acquire_lease()                               │ reclaim_expired()
//!     ▼         │                                    │
//! Worker Loop ──┘                                 Reaper
//!     │
//!     ├─► start_job() → RUNNING
//!     ├─► HandlerRegistry.get(job_type) → JobHandler::handle()
//!     └─► complete_job() / fail_job() → SUCCEEDED | QUEUED | DLQ
//!
//! EventBus.publish() ──► subscribers (out of scope: WebSocket fan-out, etc.)
//! ```
//!
//! ## Key invariants
//!
//! 1. `(tenant_id, idempotency_key)` is globally unique — submission is idempotent.
//! 2. A job in `LEASED` or `RUNNING` always has a lease owner and expiry; every
//!    other status always has neither.
//! 3. A worker can only advance a job it currently owns the lease on — every
//!    transition after leasing is a conditional UPDATE scoped to `lease_owner`.
//! 4. The database row is the only synchronization point; no in-process mutable
//!    global state mediates correctness.
//! 5. Delivery is at-least-once, never exactly-once — handlers must be idempotent.
//!
//! ## What this crate is not
//!
//! Wharf's core is **not**:
//! - An HTTP/WebSocket server (out of scope; build one against [`JobStore`])
//! - An authentication or rate-limiting layer
//! - A scheduler for cross-job ordering beyond priority + FIFO
//!
//! Wharf's core **is**:
//! > the coordination substrate between producers, the durable job
//! > store, worker leasing, and crash recovery.

mod bus;
mod config;
mod error;
mod job;
mod registry;
mod store;

pub use bus::{EventBus, EventType, JobEvent};
pub use config::{AdmissionConfig, ReaperConfig, WorkerConfig};
pub use error::{Categorizable, ErrorCategory, QueueError, Result};
pub use job::{Job, JobContext, JobResult, JobStatus, Priority, SubmitRequest};
pub use registry::{payload_job_type, HandlerRegistry, JobHandler};
pub use store::{submit_with_admission, JobPage, JobStore, QueueStats, TenantAdmissionPolicy};

// Re-export commonly used external types so downstream crates don't
// need to depend on `async-trait` directly just to implement `JobStore`.
pub use async_trait::async_trait;
