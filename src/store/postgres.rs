// vaultline/src/store/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Executor, PgPool, Row};
use std::collections::HashMap;
use uuid::Uuid;

use super::{BackupStore, RunLease};
use crate::errors::Result;
use crate::models::{
    Actor, BackupDestination, BackupRun, BackupUpload, NewDestination, RunCause, RunOutcome,
    RunStatus, UploadStatus,
};

const MIGRATION_0001: &str = include_str!("../../migrations/0001_backup.sql");

const RUN_COLUMNS: &str = "id, cause, actor_id, actor_name, status, file_name, file_size, \
     manifest, error, created_at, started_at, completed_at";
const UPLOAD_COLUMNS: &str = "id, run_id, destination_id, destination_name, status, \
     remote_key, error, started_at, completed_at";
/// Advisory lock key held for the duration of one backup run.
const BACKUP_RUN_LOCK_KEY: i64 = 0x7661_756c_746c_696e;
const DESTINATION_COLUMNS: &str =
    "id, name, provider, credentials, is_active, created_at, updated_at";

#[derive(Clone)]
pub struct PgBackupStore {
    pool: PgPool,
}

impl PgBackupStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the catalog tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        // A bare &str goes over the simple protocol, which allows several statements.
        self.pool.execute(MIGRATION_0001).await?;
        Ok(())
    }

    fn destination_from_row(row: &PgRow) -> Result<BackupDestination> {
        let provider: String = row.try_get("provider")?;
        Ok(BackupDestination {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            provider: provider.parse()?,
            credentials: row.try_get("credentials")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn run_from_row(row: &PgRow) -> Result<BackupRun> {
        let cause: String = row.try_get("cause")?;
        let status: String = row.try_get("status")?;
        Ok(BackupRun {
            id: row.try_get("id")?,
            cause: cause.parse()?,
            actor_id: row.try_get("actor_id")?,
            actor_name: row.try_get("actor_name")?,
            status: status.parse()?,
            file_name: row.try_get("file_name")?,
            file_size: row.try_get("file_size")?,
            manifest: row.try_get("manifest")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn upload_from_row(row: &PgRow) -> Result<BackupUpload> {
        let status: String = row.try_get("status")?;
        Ok(BackupUpload {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            destination_id: row.try_get("destination_id")?,
            destination_name: row.try_get("destination_name")?,
            status: status.parse()?,
            remote_key: row.try_get("remote_key")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    async fn set_upload_state(
        &self,
        id: Uuid,
        status: UploadStatus,
        remote_key: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        let (started_at, completed_at) = if status.is_terminal() {
            (None, Some(now))
        } else {
            (Some(now), None)
        };
        sqlx::query(
            "UPDATE backup_uploads
             SET status = $2,
                 remote_key = COALESCE($3, remote_key),
                 error = $4,
                 started_at = COALESCE(started_at, $5),
                 completed_at = COALESCE($6, completed_at)
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(remote_key)
        .bind(error)
        .bind(started_at)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BackupStore for PgBackupStore {
    async fn try_acquire_run_lease(&self) -> Result<Option<RunLease>> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(BACKUP_RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            return Ok(None);
        }
        // Session-level lock: the connection leaves the pool and closing it releases the lock.
        Ok(Some(RunLease::new(conn.detach())))
    }

    async fn create_destination(&self, new: NewDestination) -> Result<BackupDestination> {
        let row = sqlx::query(&format!(
            "INSERT INTO backup_destinations (id, name, provider, credentials, is_active)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {DESTINATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(new.provider.as_str())
        .bind(&new.credentials)
        .bind(new.is_active)
        .fetch_one(&self.pool)
        .await?;
        Self::destination_from_row(&row)
    }

    async fn list_destinations(&self) -> Result<Vec<BackupDestination>> {
        let rows = sqlx::query(&format!(
            "SELECT {DESTINATION_COLUMNS} FROM backup_destinations ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::destination_from_row).collect()
    }

    async fn active_destinations(&self) -> Result<Vec<BackupDestination>> {
        let rows = sqlx::query(&format!(
            "SELECT {DESTINATION_COLUMNS} FROM backup_destinations
             WHERE is_active = TRUE ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::destination_from_row).collect()
    }

    async fn get_destination(&self, id: Uuid) -> Result<Option<BackupDestination>> {
        let row = sqlx::query(&format!(
            "SELECT {DESTINATION_COLUMNS} FROM backup_destinations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::destination_from_row).transpose()
    }

    async fn set_destination_active(&self, id: Uuid, active: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backup_destinations SET is_active = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(active)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_destination_credentials(
        &self,
        id: Uuid,
        credentials: serde_json::Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backup_destinations SET credentials = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(&credentials)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_run(
        &self,
        cause: RunCause,
        actor: Option<&Actor>,
        destinations: &[BackupDestination],
    ) -> Result<(BackupRun, Vec<BackupUpload>)> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "INSERT INTO backup_runs (id, cause, actor_id, actor_name, status)
             VALUES ($1, $2, $3, $4, 'pending')
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(cause.as_str())
        .bind(actor.map(|a| a.id))
        .bind(actor.map(|a| a.name.as_str()))
        .fetch_one(&mut *tx)
        .await?;
        let run = Self::run_from_row(&row)?;

        let mut uploads = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let row = sqlx::query(&format!(
                "INSERT INTO backup_uploads (id, run_id, destination_id, destination_name, status)
                 VALUES ($1, $2, $3, $4, 'pending')
                 RETURNING {UPLOAD_COLUMNS}"
            ))
            .bind(Uuid::new_v4())
            .bind(run.id)
            .bind(destination.id)
            .bind(&destination.name)
            .fetch_one(&mut *tx)
            .await?;
            uploads.push(Self::upload_from_row(&row)?);
        }

        tx.commit().await?;
        Ok((run, uploads))
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<BackupRun>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM backup_runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<BackupRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM backup_runs ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::run_from_row).collect()
    }

    async fn uploads_for_run(&self, run_id: Uuid) -> Result<Vec<BackupUpload>> {
        let rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM backup_uploads WHERE run_id = $1 ORDER BY destination_name"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::upload_from_row).collect()
    }

    async fn mark_run_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backup_runs SET status = 'running', started_at = $2
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn finish_run(&self, id: Uuid, outcome: &RunOutcome) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backup_runs
             SET status = $2, file_name = $3, file_size = $4, manifest = $5,
                 error = $6, completed_at = $7
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(&outcome.file_name)
        .bind(outcome.file_size)
        .bind(&outcome.manifest)
        .bind(outcome.error.as_deref())
        .bind(outcome.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_run_if_running(&self, id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backup_runs SET status = 'failed', error = $2, completed_at = now()
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_upload_uploading(&self, id: Uuid) -> Result<()> {
        self.set_upload_state(id, UploadStatus::Uploading, None, None)
            .await
    }

    async fn mark_upload_completed(&self, id: Uuid, remote_key: &str) -> Result<()> {
        self.set_upload_state(id, UploadStatus::Completed, Some(remote_key), None)
            .await
    }

    async fn mark_upload_failed(&self, id: Uuid, error: &str) -> Result<()> {
        self.set_upload_state(id, UploadStatus::Failed, None, Some(error))
            .await
    }

    async fn expired_runs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(BackupRun, Vec<BackupUpload>)>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM backup_runs
             WHERE status = 'completed' AND created_at <= $1
             ORDER BY created_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        let runs: Vec<BackupRun> = rows.iter().map(Self::run_from_row).collect::<Result<_>>()?;
        if runs.is_empty() {
            return Ok(Vec::new());
        }

        let run_ids: Vec<Uuid> = runs.iter().map(|r| r.id).collect();
        let upload_rows = sqlx::query(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM backup_uploads WHERE run_id = ANY($1)"
        ))
        .bind(&run_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_run: HashMap<Uuid, Vec<BackupUpload>> = HashMap::new();
        for row in &upload_rows {
            let upload = Self::upload_from_row(row)?;
            by_run.entry(upload.run_id).or_default().push(upload);
        }

        Ok(runs
            .into_iter()
            .map(|run| {
                let uploads = by_run.remove(&run.id).unwrap_or_default();
                (run, uploads)
            })
            .collect())
    }

    async fn delete_run(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM backup_runs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stuck_runs(
        &self,
        running_before: DateTime<Utc>,
        pending_before: DateTime<Utc>,
    ) -> Result<Vec<BackupRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM backup_runs
             WHERE (status = 'running' AND COALESCE(started_at, created_at) < $1)
                OR (status = 'pending' AND created_at < $2)
             ORDER BY created_at"
        ))
        .bind(running_before)
        .bind(pending_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::run_from_row).collect()
    }

    async fn fail_stuck_run(&self, id: Uuid, message: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE backup_uploads SET status = 'failed', error = $2, completed_at = now()
             WHERE run_id = $1 AND status IN ('pending', 'uploading')",
        )
        .bind(id)
        .bind(message)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "UPDATE backup_runs SET status = 'failed', error = $2, completed_at = now()
             WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(id)
        .bind(message)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
