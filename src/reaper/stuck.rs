use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::Result;
use crate::store::BackupStore;

pub const STUCK_RUN_MESSAGE: &str =
    "Backup timed out: the worker stopped before the run finished";

#[derive(Debug, Clone, Copy)]
pub struct StuckTimeouts {
    /// Measured from `started_at`.
    pub running: Duration,
    /// Measured from `created_at`; the run was never picked up.
    pub pending: Duration,
}

impl Default for StuckTimeouts {
    fn default() -> Self {
        StuckTimeouts {
            running: Duration::minutes(120),
            pending: Duration::minutes(30),
        }
    }
}

/// Fails runs left behind by a crashed or restarted worker.
pub struct StuckRunReaper {
    store: Arc<dyn BackupStore>,
    timeouts: StuckTimeouts,
}

impl StuckRunReaper {
    pub fn new(store: Arc<dyn BackupStore>, timeouts: StuckTimeouts) -> Self {
        Self { store, timeouts }
    }

    /// Returns how many runs were failed by this sweep.
    pub async fn sweep(&self) -> Result<usize> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let stuck = self
            .store
            .stuck_runs(now - self.timeouts.running, now - self.timeouts.pending)
            .await?;
        let mut failed = 0;
        for run in stuck {
            if self.store.fail_stuck_run(run.id, STUCK_RUN_MESSAGE).await? {
                warn!(
                    "Marked stuck {} run {} (created {}) as failed",
                    run.status, run.id, run.created_at
                );
                failed += 1;
            }
        }
        if failed > 0 {
            info!("Stuck-run sweep failed {} runs", failed);
        }
        Ok(failed)
    }
}
