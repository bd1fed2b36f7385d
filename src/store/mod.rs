//! Persistence for destinations, runs and uploads.
//!
//! Status changes are guarded in the store itself (`WHERE status = ...`), so two
//! writers racing on one row can only move it forward.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{
    Actor, BackupDestination, BackupRun, BackupUpload, NewDestination, RunCause, RunOutcome,
};

pub use postgres::PgBackupStore;

/// Exclusive right to execute a backup run, across every process sharing the
/// catalog. Released when dropped.
pub struct RunLease {
    _guard: Box<dyn Send>,
}

impl RunLease {
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    /// `None` while another run holds the lease.
    async fn try_acquire_run_lease(&self) -> Result<Option<RunLease>>;

    async fn create_destination(&self, new: NewDestination) -> Result<BackupDestination>;

    async fn list_destinations(&self) -> Result<Vec<BackupDestination>>;

    async fn active_destinations(&self) -> Result<Vec<BackupDestination>>;

    async fn get_destination(&self, id: Uuid) -> Result<Option<BackupDestination>>;

    /// Returns false if no such destination exists.
    async fn set_destination_active(&self, id: Uuid, active: bool) -> Result<bool>;

    async fn update_destination_credentials(
        &self,
        id: Uuid,
        credentials: serde_json::Value,
    ) -> Result<bool>;

    /// Creates a pending run and one pending upload per destination, atomically.
    async fn create_run(
        &self,
        cause: RunCause,
        actor: Option<&Actor>,
        destinations: &[BackupDestination],
    ) -> Result<(BackupRun, Vec<BackupUpload>)>;

    async fn get_run(&self, id: Uuid) -> Result<Option<BackupRun>>;

    /// Newest first.
    async fn list_runs(&self, limit: i64) -> Result<Vec<BackupRun>>;

    async fn uploads_for_run(&self, run_id: Uuid) -> Result<Vec<BackupUpload>>;

    /// `pending -> running`. Returns false if the run was not pending.
    async fn mark_run_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<bool>;

    /// `running -> outcome.status`. Returns false if the run was not running.
    async fn finish_run(&self, id: Uuid, outcome: &RunOutcome) -> Result<bool>;

    /// `running -> failed`; leaves any other status untouched.
    async fn fail_run_if_running(&self, id: Uuid, error: &str) -> Result<bool>;

    async fn mark_upload_uploading(&self, id: Uuid) -> Result<()>;

    async fn mark_upload_completed(&self, id: Uuid, remote_key: &str) -> Result<()>;

    async fn mark_upload_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// Completed runs created at or before `cutoff`, each with its uploads.
    async fn expired_runs(&self, cutoff: DateTime<Utc>)
    -> Result<Vec<(BackupRun, Vec<BackupUpload>)>>;

    /// Deletes the run; its uploads go with it.
    async fn delete_run(&self, id: Uuid) -> Result<()>;

    /// Runs `running` since before `running_before`, or `pending` since before `pending_before`.
    async fn stuck_runs(
        &self,
        running_before: DateTime<Utc>,
        pending_before: DateTime<Utc>,
    ) -> Result<Vec<BackupRun>>;

    /// Fails every non-terminal upload of the run, then the run itself (if still
    /// pending or running), in one transaction.
    async fn fail_stuck_run(&self, id: Uuid, message: &str) -> Result<bool>;
}
