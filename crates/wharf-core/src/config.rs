//! Environment-driven configuration with typed defaults.
//!
//! No global settings singleton: callers load a config struct once at
//! startup and pass it to the collaborators that need it (worker,
//! reaper, admission policy) as an explicit dependency.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be valid: {e}")),
        Err(_) => Ok(default),
    }
}

/// Configuration for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub heartbeat_interval: Duration,
}

impl WorkerConfig {
    /// Load from `WHARF_WORKER_*` environment variables, falling back
    /// to the documented defaults (30s lease, 1s poll, batch 10, 10s
    /// heartbeat).
    pub fn from_env() -> Result<Self> {
        let lease_duration_seconds: u64 = env_or("WHARF_WORKER_LEASE_DURATION_SECONDS", 30)
            .context("WHARF_WORKER_LEASE_DURATION_SECONDS")?;
        let poll_interval_seconds: f64 = env_or("WHARF_WORKER_POLL_INTERVAL_SECONDS", 1.0)
            .context("WHARF_WORKER_POLL_INTERVAL_SECONDS")?;
        let batch_size: i64 = env_or("WHARF_WORKER_BATCH_SIZE", 10)
            .context("WHARF_WORKER_BATCH_SIZE")?;
        let heartbeat_interval_seconds: f64 = env_or("WHARF_WORKER_HEARTBEAT_INTERVAL_SECONDS", 10.0)
            .context("WHARF_WORKER_HEARTBEAT_INTERVAL_SECONDS")?;

        let config = Self {
            lease_duration: Duration::from_secs(lease_duration_seconds),
            poll_interval: Duration::from_secs_f64(poll_interval_seconds),
            batch_size,
            heartbeat_interval: Duration::from_secs_f64(heartbeat_interval_seconds),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.heartbeat_interval < self.lease_duration,
            "heartbeat_interval ({:?}) must be strictly less than lease_duration ({:?})",
            self.heartbeat_interval,
            self.lease_duration,
        );
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration for the lease reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub reaper_interval: Duration,
}

impl ReaperConfig {
    pub fn from_env() -> Result<Self> {
        let reaper_interval_seconds: u64 = env_or("WHARF_REAPER_INTERVAL_SECONDS", 10)
            .context("WHARF_REAPER_INTERVAL_SECONDS")?;
        Ok(Self {
            reaper_interval: Duration::from_secs(reaper_interval_seconds),
        })
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(10),
        }
    }
}

/// Tenant admission defaults applied by producers that don't specify
/// their own `max_attempts` / concurrency cap.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub default_max_concurrent_jobs: i64,
    pub default_max_attempts: i32,
}

impl AdmissionConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            default_max_concurrent_jobs: env_or("WHARF_ADMISSION_DEFAULT_MAX_CONCURRENT_JOBS", 10)
                .context("WHARF_ADMISSION_DEFAULT_MAX_CONCURRENT_JOBS")?,
            default_max_attempts: env_or("WHARF_ADMISSION_DEFAULT_MAX_ATTEMPTS", 3)
                .context("WHARF_ADMISSION_DEFAULT_MAX_ATTEMPTS")?,
        })
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent_jobs: 10,
            default_max_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_heartbeat_invariant() {
        WorkerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_heartbeat_not_less_than_lease() {
        let config = WorkerConfig {
            lease_duration: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            heartbeat_interval: Duration::from_secs(10),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let config = WorkerConfig {
            batch_size: 0,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
