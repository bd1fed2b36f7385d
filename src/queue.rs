//! In-process backup job queue.
//!
//! One worker drains the queue, so at most one backup runs at a time. A job that
//! fails is retried a bounded number of times with a growing pause.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::{AppError, Result};
use crate::models::{Actor, RunCause};

/// What gets enqueued. Without a run id the orchestrator creates the run itself
/// against whatever destinations are active when the job executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    pub existing_run_id: Option<Uuid>,
    pub cause: RunCause,
    pub actor: Option<Actor>,
}

impl BackupJob {
    pub fn scheduled() -> Self {
        BackupJob {
            existing_run_id: None,
            cause: RunCause::Scheduled,
            actor: None,
        }
    }

    pub fn for_run(run_id: Uuid, cause: RunCause, actor: Option<Actor>) -> Self {
        BackupJob {
            existing_run_id: Some(run_id),
            cause,
            actor,
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &BackupJob) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<BackupJob>,
}

impl JobQueue {
    /// Spawns the single worker and returns the handle used to enqueue jobs. The
    /// worker exits once every `JobQueue` clone has been dropped.
    pub fn start(handler: Arc<dyn JobHandler>, policy: RetryPolicy) -> (JobQueue, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(receiver, handler, policy));
        (JobQueue { sender }, worker)
    }

    pub fn enqueue(&self, job: BackupJob) -> Result<()> {
        self.sender
            .send(job)
            .map_err(|_| AppError::Cancelled("backup worker has stopped".to_string()))
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<BackupJob>,
    handler: Arc<dyn JobHandler>,
    policy: RetryPolicy,
) {
    info!("Backup worker started");
    while let Some(job) = receiver.recv().await {
        process_with_retry(handler.as_ref(), &job, policy).await;
    }
    info!("Backup worker stopped");
}

/// Runs `job` until it succeeds or the attempts run out. Returns whether it succeeded.
pub async fn process_with_retry(handler: &dyn JobHandler, job: &BackupJob, policy: RetryPolicy) -> bool {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match handler.handle(job).await {
            Ok(()) => return true,
            Err(e) if attempt < attempts => {
                let pause = policy.backoff * attempt;
                warn!(
                    attempt,
                    "Backup job {:?} failed: {:#}. Retrying in {:?}",
                    job.existing_run_id,
                    e,
                    pause
                );
                tokio::time::sleep(pause).await;
            }
            Err(e) => {
                error!(
                    attempt,
                    "Backup job {:?} failed permanently: {:#}", job.existing_run_id, e
                );
            }
        }
    }
    false
}
