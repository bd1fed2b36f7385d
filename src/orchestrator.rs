//! One backup run from start to finish.
//!
//! The archive is built exactly once; every destination receives the same bytes
//! concurrently and the run's final status is derived from how many copies landed.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveBuilder, CreatedArchive};
use crate::audit::{AuditEntry, AuditSink, spawn_audit};
use crate::errors::{AppError, Result};
use crate::models::{Actor, BackupRun, BackupUpload, RunCause, RunOutcome, RunStatus, UploadStatus};
use crate::queue::{BackupJob, JobHandler, JobQueue};
use crate::reaper::RetentionReaper;
use crate::storage::{ProviderResolver, backup_key};
use crate::store::{BackupStore, RunLease};

#[derive(Debug, Clone)]
struct UploadResult {
    destination_name: String,
    status: UploadStatus,
    error: Option<String>,
}

pub struct Orchestrator {
    store: Arc<dyn BackupStore>,
    providers: Arc<dyn ProviderResolver>,
    archiver: Arc<ArchiveBuilder>,
    audit: Arc<dyn AuditSink>,
    retention: Arc<RetentionReaper>,
    temp_root: PathBuf,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn BackupStore>,
        providers: Arc<dyn ProviderResolver>,
        archiver: Arc<ArchiveBuilder>,
        audit: Arc<dyn AuditSink>,
        retention: Arc<RetentionReaper>,
        temp_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            providers,
            archiver,
            audit,
            retention,
            temp_root: temp_root.into(),
        }
    }

    /// Creates a pending run against the active destinations and enqueues it.
    pub async fn request_manual_backup(&self, actor: Option<Actor>, queue: &JobQueue) -> Result<BackupRun> {
        let run = self.create_manual_run(actor.as_ref()).await?;
        queue.enqueue(BackupJob::for_run(run.id, RunCause::Manual, actor))?;
        info!("Queued manual backup run {}", run.id);
        Ok(run)
    }

    /// Fails with a configuration error when no destination is active.
    pub async fn create_manual_run(&self, actor: Option<&Actor>) -> Result<BackupRun> {
        let destinations = self.store.active_destinations().await?;
        if destinations.is_empty() {
            return Err(AppError::Config(
                "No active backup destination is configured".to_string(),
            ));
        }
        let (run, _) = self
            .store
            .create_run(RunCause::Manual, actor, &destinations)
            .await?;
        Ok(run)
    }

    /// Creates a manual run and executes it in the calling task, for use without a
    /// queue worker. Fails with `Busy` before creating anything if another run holds
    /// the lease.
    pub async fn run_manual_now(&self, actor: Option<Actor>) -> anyhow::Result<Option<BackupRun>> {
        let lease = self.acquire_lease().await?;
        let run = self.create_manual_run(actor.as_ref()).await?;
        self.run_leased(&BackupJob::for_run(run.id, RunCause::Manual, actor), lease)
            .await
    }

    pub async fn list_runs(&self, limit: i64) -> Result<Vec<BackupRun>> {
        self.store.list_runs(limit).await
    }

    pub async fn run_details(&self, id: Uuid) -> Result<Option<(BackupRun, Vec<BackupUpload>)>> {
        match self.store.get_run(id).await? {
            Some(run) => {
                let uploads = self.store.uploads_for_run(id).await?;
                Ok(Some((run, uploads)))
            }
            None => Ok(None),
        }
    }

    /// Executes one job. Returns the finished run, or `None` when there was nothing to do.
    /// Only one run executes at a time across all processes; a second caller gets `Busy`.
    pub async fn run(&self, job: &BackupJob) -> anyhow::Result<Option<BackupRun>> {
        let lease = self.acquire_lease().await?;
        self.run_leased(job, lease).await
    }

    async fn acquire_lease(&self) -> Result<RunLease> {
        self.store.try_acquire_run_lease().await?.ok_or_else(|| {
            AppError::Busy("another backup run is already in progress".to_string())
        })
    }

    async fn run_leased(&self, job: &BackupJob, _lease: RunLease) -> anyhow::Result<Option<BackupRun>> {
        let run = match job.existing_run_id {
            Some(id) => {
                let run = self
                    .store
                    .get_run(id)
                    .await?
                    .ok_or_else(|| anyhow!("Backup run {} does not exist", id))?;
                if run.status != RunStatus::Pending {
                    info!(
                        "Backup run {} is already {}, nothing to do",
                        run.id, run.status
                    );
                    return Ok(None);
                }
                run
            }
            None => {
                let destinations = self.store.active_destinations().await?;
                if destinations.is_empty() {
                    info!("No active backup destinations, skipping {} backup", job.cause.as_str());
                    return Ok(None);
                }
                let (run, _) = self
                    .store
                    .create_run(job.cause, job.actor.as_ref(), &destinations)
                    .await?;
                run
            }
        };

        if !self.store.mark_run_running(run.id, Utc::now()).await? {
            info!("Backup run {} was claimed elsewhere", run.id);
            return Ok(None);
        }
        info!("Starting backup run {} ({})", run.id, run.cause.as_str());

        let outcome = match self.execute(&run).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = format!("{e:#}");
                error!("Backup run {} failed: {}", run.id, message);
                if let Err(mark_err) = self.store.fail_run_if_running(run.id, &message).await {
                    error!("Could not mark run {} failed: {}", run.id, mark_err);
                }
                return Err(e);
            }
        };

        match self.store.finish_run(run.id, &outcome).await {
            Ok(true) => {}
            Ok(false) => warn!("Backup run {} left the running state before it finished", run.id),
            Err(e) => {
                error!("Could not record the outcome of backup run {}: {}", run.id, e);
                let message = format!(
                    "Could not record the run outcome ({}); uploads may have completed: {}",
                    outcome.status, e
                );
                if let Err(mark_err) = self.store.fail_run_if_running(run.id, &message).await {
                    error!("Could not mark run {} failed: {}", run.id, mark_err);
                }
                return Err(anyhow::Error::new(e).context(format!(
                    "Failed to record the outcome of backup run {}",
                    run.id
                )));
            }
        }
        info!(
            "Backup run {} finished: {} ({} bytes)",
            run.id, outcome.status, outcome.file_size
        );

        match self.retention.sweep().await {
            Ok(report) if report.runs_deleted > 0 => {
                info!("Retention removed {} expired runs", report.runs_deleted)
            }
            Ok(_) => {}
            Err(e) => warn!("Retention sweep after run {} failed: {}", run.id, e),
        }

        Ok(self.store.get_run(run.id).await?)
    }

    async fn execute(&self, run: &BackupRun) -> anyhow::Result<RunOutcome> {
        let uploads = self.store.uploads_for_run(run.id).await?;
        tokio::fs::create_dir_all(&self.temp_root)
            .await
            .with_context(|| format!("Failed to create {}", self.temp_root.display()))?;
        let workdir = tempfile::Builder::new()
            .prefix(&format!("backup-run-{}-", run.id))
            .tempdir_in(&self.temp_root)
            .context("Failed to allocate backup working directory")?;

        let archive = self.archiver.create(workdir.path()).await?;
        let results = self.fan_out(&archive, uploads).await;

        let status = RunStatus::from_uploads(results.iter().map(|r| r.status));
        let errors: Vec<String> = results
            .iter()
            .filter_map(|r| {
                r.error
                    .as_ref()
                    .map(|e| format!("{}: {}", r.destination_name, e))
            })
            .collect();
        let succeeded = results
            .iter()
            .filter(|r| r.status == UploadStatus::Completed)
            .count();

        spawn_audit(
            self.audit.clone(),
            AuditEntry {
                action: format!("backup.{}", status),
                actor: run.actor_id.map(|id| Actor {
                    id,
                    name: run.actor_name.clone().unwrap_or_default(),
                }),
                details: json!({
                    "run_id": run.id,
                    "cause": run.cause,
                    "file_name": archive.file_name,
                    "size_bytes": archive.size,
                    "succeeded": succeeded,
                    "total": results.len(),
                    "success_ratio": format!("{}/{}", succeeded, results.len()),
                }),
            },
        );

        Ok(RunOutcome {
            status,
            file_name: archive.file_name.clone(),
            file_size: i64::try_from(archive.size).unwrap_or(i64::MAX),
            manifest: archive.manifest.to_json(),
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            completed_at: Utc::now(),
        })
    }

    async fn fan_out(&self, archive: &CreatedArchive, uploads: Vec<BackupUpload>) -> Vec<UploadResult> {
        let key = backup_key(&archive.file_name);
        let mut tasks = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let label = (upload.id, upload.destination_name.clone());
            let task = tokio::spawn(upload_one(
                self.store.clone(),
                self.providers.clone(),
                upload,
                archive.path.clone(),
                key.clone(),
            ));
            tasks.push((label, task));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for ((upload_id, destination_name), task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(join_err) => {
                    let message = format!("upload task aborted: {join_err}");
                    if let Err(e) = self.store.mark_upload_failed(upload_id, &message).await {
                        warn!("Could not record failure of upload {}: {}", upload_id, e);
                    }
                    UploadResult {
                        destination_name,
                        status: UploadStatus::Failed,
                        error: Some(message),
                    }
                }
            };
            results.push(result);
        }
        results
    }
}

async fn upload_one(
    store: Arc<dyn BackupStore>,
    providers: Arc<dyn ProviderResolver>,
    upload: BackupUpload,
    archive_path: PathBuf,
    key: String,
) -> UploadResult {
    if let Err(e) = store.mark_upload_uploading(upload.id).await {
        warn!("Could not mark upload {} as uploading: {}", upload.id, e);
    }

    match ship(store.as_ref(), providers.as_ref(), &upload, &archive_path, &key).await {
        Ok(()) => {
            info!("Uploaded {} to '{}'", key, upload.destination_name);
            if let Err(e) = store.mark_upload_completed(upload.id, &key).await {
                error!("Could not record completed upload {}: {}", upload.id, e);
            }
            UploadResult {
                destination_name: upload.destination_name,
                status: UploadStatus::Completed,
                error: None,
            }
        }
        Err(e) => {
            let message = e.to_string();
            warn!("Upload to '{}' failed: {}", upload.destination_name, message);
            if let Err(e) = store.mark_upload_failed(upload.id, &message).await {
                error!("Could not record failed upload {}: {}", upload.id, e);
            }
            UploadResult {
                destination_name: upload.destination_name,
                status: UploadStatus::Failed,
                error: Some(message),
            }
        }
    }
}

async fn ship(
    store: &dyn BackupStore,
    providers: &dyn ProviderResolver,
    upload: &BackupUpload,
    archive_path: &Path,
    key: &str,
) -> Result<()> {
    let destination = store
        .get_destination(upload.destination_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("backup destination {}", upload.destination_id)))?;
    let provider = providers.resolve(&destination).await?;
    provider.upload(key, archive_path).await
}

#[async_trait]
impl JobHandler for Orchestrator {
    async fn handle(&self, job: &BackupJob) -> anyhow::Result<()> {
        self.run(job).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::DatabaseDumper;
    use crate::storage::{ProviderKind, StorageProvider};
    use crate::testing::{
        FailingDumper, FakeDumper, MemoryProvider, MemorySettings, MemoryStore, RecordingAudit,
        StaticProviders,
    };
    use crate::queue::RetryPolicy;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<BackupJob>);

    #[async_trait]
    impl JobHandler for Forward {
        async fn handle(&self, job: &BackupJob) -> anyhow::Result<()> {
            let _ = self.0.send(job.clone());
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        providers: Arc<StaticProviders>,
        audit: Arc<RecordingAudit>,
        orchestrator: Orchestrator,
        temp: TempDir,
    }

    fn harness_with(dumper: Arc<dyn DatabaseDumper>) -> anyhow::Result<Harness> {
        let temp = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::default());
        let providers = Arc::new(StaticProviders::default());
        let audit = Arc::new(RecordingAudit::default());
        let settings = Arc::new(MemorySettings::default());
        let archiver = Arc::new(ArchiveBuilder::new(
            dumper,
            temp.path().join("uploads"),
            temp.path().join(".env"),
            "2.0.0",
        ));
        let retention = Arc::new(RetentionReaper::new(
            store.clone(),
            settings,
            providers.clone(),
        ));
        let orchestrator = Orchestrator::new(
            store.clone(),
            providers.clone(),
            archiver,
            audit.clone(),
            retention,
            temp.path().join("work"),
        );
        Ok(Harness {
            store,
            providers,
            audit,
            orchestrator,
            temp,
        })
    }

    fn harness() -> anyhow::Result<Harness> {
        harness_with(Arc::new(FakeDumper::new("app_db", "CREATE TABLE t (id int);\n")))
    }

    impl Harness {
        async fn destination(&self, name: &str, provider: Arc<dyn StorageProvider>) {
            let dest = self.store.add_destination(name, ProviderKind::S3).await;
            self.providers.insert(dest.id, provider);
        }

        fn work_dir_is_empty(&self) -> anyhow::Result<bool> {
            let work = self.temp.path().join("work");
            Ok(!work.exists() || std::fs::read_dir(work)?.next().is_none())
        }
    }

    fn actor() -> Actor {
        Actor {
            id: Uuid::new_v4(),
            name: "ops".to_string(),
        }
    }

    #[tokio::test]
    async fn test_manual_run_with_one_failing_destination_is_partial() -> anyhow::Result<()> {
        let h = harness()?;
        let healthy = Arc::new(MemoryProvider::default());
        let broken = Arc::new(MemoryProvider::failing());
        h.destination("healthy", healthy.clone()).await;
        h.destination("broken", broken.clone()).await;

        let created = h.orchestrator.create_manual_run(Some(&actor())).await?;
        assert_eq!(h.store.uploads_for_run(created.id).await?.len(), 2);

        let job = BackupJob::for_run(created.id, RunCause::Manual, Some(actor()));
        let run = h.orchestrator.run(&job).await?.expect("run executed");

        assert_eq!(run.status, RunStatus::Partial);
        assert!(run.file_size.unwrap_or_default() > 0);
        assert!(run.manifest.is_some());
        let error = run.error.unwrap_or_default();
        assert!(error.starts_with("broken: "), "unexpected error text: {error}");

        let uploads = h.store.uploads_for_run(run.id).await?;
        let completed: Vec<_> = uploads.iter().filter(|u| u.status == UploadStatus::Completed).collect();
        let failed: Vec<_> = uploads.iter().filter(|u| u.status == UploadStatus::Failed).collect();
        assert_eq!(completed.len(), 1);
        assert_eq!(failed.len(), 1);
        assert_eq!(completed[0].destination_name, "healthy");
        assert!(failed[0].error.as_deref().is_some_and(|e| !e.is_empty()));

        let file_name = run.file_name.expect("file name recorded");
        assert_eq!(healthy.keys(), vec![backup_key(&file_name)]);
        assert!(broken.keys().is_empty());
        assert!(h.work_dir_is_empty()?);
        Ok(())
    }

    #[tokio::test]
    async fn test_status_follows_upload_outcomes() -> anyhow::Result<()> {
        for failing in 0..=3usize {
            let h = harness()?;
            for i in 0..3 {
                let provider = if i < failing {
                    MemoryProvider::failing()
                } else {
                    MemoryProvider::default()
                };
                h.destination(&format!("dest-{i}"), Arc::new(provider)).await;
            }

            let run = h
                .orchestrator
                .run(&BackupJob::scheduled())
                .await?
                .expect("run executed");

            let expected = match failing {
                0 => RunStatus::Completed,
                3 => RunStatus::Failed,
                _ => RunStatus::Partial,
            };
            assert_eq!(run.status, expected, "{failing} failing destinations");
            assert_eq!(run.cause, RunCause::Scheduled);
            assert!(run.actor_id.is_none());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_no_active_destination() -> anyhow::Result<()> {
        let h = harness()?;
        assert!(h.orchestrator.run(&BackupJob::scheduled()).await?.is_none());
        assert_eq!(h.store.run_count().await, 0);

        let manual = h.orchestrator.create_manual_run(None).await;
        assert!(matches!(manual, Err(AppError::Config(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_non_pending_run_id_is_a_no_op() -> anyhow::Result<()> {
        let h = harness()?;
        let provider = Arc::new(MemoryProvider::default());
        h.destination("primary", provider.clone()).await;

        let created = h.orchestrator.create_manual_run(None).await?;
        let job = BackupJob::for_run(created.id, RunCause::Manual, None);
        let first = h.orchestrator.run(&job).await?.expect("first delivery runs");
        assert_eq!(first.status, RunStatus::Completed);

        assert!(h.orchestrator.run(&job).await?.is_none());
        assert_eq!(provider.upload_calls(), 1);
        assert_eq!(
            h.store.get_run(created.id).await?.map(|r| r.status),
            Some(RunStatus::Completed)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_dump_failure_fails_the_run() -> anyhow::Result<()> {
        let h = harness_with(Arc::new(FailingDumper))?;
        let provider = Arc::new(MemoryProvider::default());
        h.destination("primary", provider.clone()).await;

        let created = h.orchestrator.create_manual_run(None).await?;
        let job = BackupJob::for_run(created.id, RunCause::Manual, None);
        assert!(h.orchestrator.run(&job).await.is_err());

        let run = h.store.get_run(created.id).await?.expect("run kept");
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap_or_default().contains("pg_dump"));
        assert_eq!(provider.upload_calls(), 0);
        assert!(h.work_dir_is_empty()?);
        Ok(())
    }

    #[tokio::test]
    async fn test_audit_entry_summarises_the_run() -> anyhow::Result<()> {
        let h = harness()?;
        h.destination("primary", Arc::new(MemoryProvider::default())).await;
        h.destination("broken", Arc::new(MemoryProvider::failing())).await;

        h.orchestrator.run(&BackupJob::scheduled()).await?;
        tokio::task::yield_now().await;

        let mut entries = Vec::new();
        for _ in 0..50 {
            entries = h.audit.entries().await;
            if !entries.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "backup.partial");
        assert_eq!(entries[0].details["success_ratio"], "1/2");
        Ok(())
    }

    #[tokio::test]
    async fn test_request_manual_backup_creates_run_and_enqueues_it() -> anyhow::Result<()> {
        let h = harness()?;
        h.destination("primary", Arc::new(MemoryProvider::default())).await;
        h.destination("offsite", Arc::new(MemoryProvider::default())).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (queue, _worker) = JobQueue::start(Arc::new(Forward(tx)), RetryPolicy::default());

        let who = actor();
        let run = h.orchestrator.request_manual_backup(Some(who.clone()), &queue).await?;

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.cause, RunCause::Manual);
        assert_eq!(run.actor_id, Some(who.id));
        let uploads = h.store.uploads_for_run(run.id).await?;
        assert_eq!(uploads.len(), 2);
        assert!(uploads.iter().all(|u| u.status == UploadStatus::Pending));

        let job = rx.recv().await.expect("job forwarded");
        assert_eq!(job, BackupJob::for_run(run.id, RunCause::Manual, Some(who)));
        Ok(())
    }

    #[tokio::test]
    async fn test_request_manual_backup_without_destination_is_config_error() -> anyhow::Result<()> {
        let h = harness()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (queue, _worker) = JobQueue::start(Arc::new(Forward(tx)), RetryPolicy::default());

        let result = h.orchestrator.request_manual_backup(None, &queue).await;

        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(h.store.run_count().await, 0);
        drop(queue);
        assert!(rx.recv().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_only_one_run_holds_the_lease() -> anyhow::Result<()> {
        let h = harness()?;
        let provider = Arc::new(MemoryProvider::default());
        h.destination("primary", provider.clone()).await;

        let held = h.store.try_acquire_run_lease().await?.expect("lease is free");
        let busy = h.orchestrator.run(&BackupJob::scheduled()).await;
        assert!(matches!(
            busy.as_ref().map_err(|e| e.downcast_ref::<AppError>()),
            Err(Some(AppError::Busy(_)))
        ));
        let busy_manual = h.orchestrator.run_manual_now(None).await;
        assert!(busy_manual.is_err());
        assert_eq!(h.store.run_count().await, 0);
        assert_eq!(provider.upload_calls(), 0);

        drop(held);
        let run = h.orchestrator.run_manual_now(Some(actor())).await?.expect("run executed");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.cause, RunCause::Manual);
        assert!(h.store.try_acquire_run_lease().await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_unrecorded_outcome_fails_the_run_instead_of_leaving_it_running() -> anyhow::Result<()> {
        let h = harness()?;
        let provider = Arc::new(MemoryProvider::default());
        h.destination("primary", provider.clone()).await;
        let created = h.orchestrator.create_manual_run(None).await?;
        h.store.fail_finish_run();

        let result = h
            .orchestrator
            .run(&BackupJob::for_run(created.id, RunCause::Manual, None))
            .await;

        assert!(result.is_err());
        let run = h.store.get_run(created.id).await?.expect("run kept");
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap_or_default().contains("uploads may have completed"));
        assert_eq!(provider.keys().len(), 1);
        Ok(())
    }
}
