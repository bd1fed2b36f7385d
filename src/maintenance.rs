//! Periodic housekeeping: fail stuck runs, then apply retention.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::reaper::{RetentionReaper, StuckRunReaper};

pub struct Maintenance {
    stuck: Arc<StuckRunReaper>,
    retention: Arc<RetentionReaper>,
}

impl Maintenance {
    pub fn new(stuck: Arc<StuckRunReaper>, retention: Arc<RetentionReaper>) -> Self {
        Self { stuck, retention }
    }

    /// One pass of both reapers. Errors are logged; a failing reaper never stops the other.
    pub async fn sweep_once(&self) {
        match self.stuck.sweep().await {
            Ok(0) => {}
            Ok(n) => info!("Maintenance failed {} stuck backup runs", n),
            Err(e) => warn!("Stuck-run sweep failed: {}", e),
        }
        if let Err(e) = self.retention.sweep().await {
            warn!("Retention sweep failed: {}", e);
        }
    }

    /// Sweeps every `interval` until `cancel` fires. The first sweep runs immediately.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.sweep_once().await,
                }
            }
            info!("Maintenance loop stopped");
        })
    }
}
