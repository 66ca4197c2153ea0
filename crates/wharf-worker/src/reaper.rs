//! Periodic lease reaper.
//!
//! Recovers jobs whose worker crashed or was killed mid-lease: any job
//! still `LEASED` or `RUNNING` past its `lease_expires_at` is returned
//! to `QUEUED` for another worker to pick up. This is what turns "a
//! worker crashed" into "at-least-once delivery" instead of "job lost".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use wharf_core::{JobStore, ReaperConfig};

pub struct Reaper {
    store: Arc<dyn JobStore>,
    config: ReaperConfig,
    running: Arc<AtomicBool>,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, config: ReaperConfig) -> Self {
        Self {
            store,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> ReaperHandle {
        ReaperHandle {
            running: self.running.clone(),
        }
    }

    /// Runs the reclaim loop on `config.reaper_interval` until
    /// [`ReaperHandle::stop`] is called.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(interval = ?self.config.reaper_interval, "reaper starting");

        while self.running.load(Ordering::SeqCst) {
            match self.run_once().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "recovered expired leases"),
                Err(err) => tracing::error!(error = %err, "error recovering expired leases"),
            }
            tokio::time::sleep(self.config.reaper_interval).await;
        }

        tracing::info!("reaper stopped");
    }

    /// Runs a single reclaim pass. Exposed for cron-style invocation or
    /// tests that don't want to drive the sleep loop.
    pub async fn run_once(&self) -> wharf_core::Result<u64> {
        self.store.reclaim_expired(Utc::now()).await
    }
}

#[derive(Clone)]
pub struct ReaperHandle {
    running: Arc<AtomicBool>,
}

impl ReaperHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
