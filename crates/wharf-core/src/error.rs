//! Error taxonomy for the core. Worker-internal variants ([`QueueError::LeaseLost`],
//! [`QueueError::HandlerFailure`]) are handled locally and never surfaced to producers.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("tenant does not own job {0}")]
    Forbidden(Uuid),

    #[error("illegal transition on job {job_id}: expected different status, found {current}")]
    Conflict { job_id: Uuid, current: String },

    #[error("tenant {tenant_id} is at its concurrency cap ({max})")]
    TenantAtCapacity { tenant_id: String, max: i64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("lease on job {0} was lost before the operation committed")]
    LeaseLost(Uuid),

    #[error("handler failed for job {job_id}: {message}")]
    HandlerFailure { job_id: Uuid, message: String },

    #[error("infrastructure error: {0}")]
    Infrastructure(#[from] anyhow::Error),
}

/// Coarse bucket a [`QueueError`] falls into, useful for mapping to a
/// transport-layer status code without the core depending on one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    Forbidden,
    Conflict,
    RateLimited,
    InvalidArgument,
    Internal,
}

pub trait Categorizable {
    fn category(&self) -> ErrorCategory;
}

impl Categorizable for QueueError {
    fn category(&self) -> ErrorCategory {
        match self {
            QueueError::NotFound(_) => ErrorCategory::NotFound,
            QueueError::Forbidden(_) => ErrorCategory::Forbidden,
            QueueError::Conflict { .. } => ErrorCategory::Conflict,
            QueueError::TenantAtCapacity { .. } => ErrorCategory::RateLimited,
            QueueError::InvalidArgument(_) => ErrorCategory::InvalidArgument,
            // Worker-internal variants never escape to a producer-facing
            // boundary, but categorize them rather than panic if they do.
            QueueError::LeaseLost(_) | QueueError::HandlerFailure { .. } => ErrorCategory::Internal,
            QueueError::Infrastructure(_) => ErrorCategory::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
