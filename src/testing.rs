//! In-memory stand-ins for the database, the cloud backends and `pg_dump`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::archive::DatabaseDumper;
use crate::audit::{AuditEntry, AuditSink};
use crate::errors::{AppError, Result};
use crate::models::{
    Actor, BackupDestination, BackupRun, BackupUpload, NewDestination, RunCause, RunOutcome,
    RunStatus, UploadStatus,
};
use crate::settings::SettingsProvider;
use crate::storage::{
    BackupObject, ProviderKind, ProviderResolver, StorageProvider, backup_key, sort_newest_first,
};
use crate::store::{BackupStore, RunLease};

#[derive(Default)]
struct StoreState {
    destinations: Vec<BackupDestination>,
    runs: Vec<BackupRun>,
    uploads: Vec<BackupUpload>,
}

/// [`BackupStore`] with the same forward-only status guards as the Postgres store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    leased: Arc<AtomicBool>,
    fail_finish: AtomicBool,
}

struct MemoryLease(Arc<AtomicBool>);

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MemoryStore {
    pub async fn add_destination(&self, name: &str, provider: ProviderKind) -> BackupDestination {
        let now = Utc::now();
        let destination = BackupDestination {
            id: Uuid::new_v4(),
            name: name.to_string(),
            provider,
            credentials: serde_json::json!({}),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().await.destinations.push(destination.clone());
        destination
    }

    /// Seeds a run with explicit timestamps and one upload per `(destination, status)`.
    pub async fn seed_run(
        &self,
        status: RunStatus,
        created_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
        file_name: Option<&str>,
        uploads: &[(&BackupDestination, UploadStatus)],
    ) -> BackupRun {
        let run = BackupRun {
            id: Uuid::new_v4(),
            cause: RunCause::Scheduled,
            actor_id: None,
            actor_name: None,
            status,
            file_name: file_name.map(str::to_string),
            file_size: None,
            manifest: None,
            error: None,
            created_at,
            started_at,
            completed_at: None,
        };
        let mut state = self.state.lock().await;
        for (destination, upload_status) in uploads {
            state.uploads.push(BackupUpload {
                id: Uuid::new_v4(),
                run_id: run.id,
                destination_id: destination.id,
                destination_name: destination.name.clone(),
                status: *upload_status,
                remote_key: (*upload_status == UploadStatus::Completed)
                    .then(|| file_name.map(backup_key))
                    .flatten(),
                error: None,
                started_at,
                completed_at: None,
            });
        }
        state.runs.push(run.clone());
        run
    }

    /// Makes every later `finish_run` fail, as a lost database connection would.
    pub fn fail_finish_run(&self) {
        self.fail_finish.store(true, Ordering::SeqCst);
    }

    pub async fn run_count(&self) -> usize {
        self.state.lock().await.runs.len()
    }

    pub async fn upload_count(&self) -> usize {
        self.state.lock().await.uploads.len()
    }
}

#[async_trait]
impl BackupStore for MemoryStore {
    async fn try_acquire_run_lease(&self) -> Result<Option<RunLease>> {
        if self.leased.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(RunLease::new(MemoryLease(self.leased.clone()))))
    }

    async fn create_destination(&self, new: NewDestination) -> Result<BackupDestination> {
        let mut state = self.state.lock().await;
        if state.destinations.iter().any(|d| d.name == new.name) {
            return Err(AppError::InvalidInput(format!(
                "destination '{}' already exists",
                new.name
            )));
        }
        let now = Utc::now();
        let destination = BackupDestination {
            id: Uuid::new_v4(),
            name: new.name,
            provider: new.provider,
            credentials: new.credentials,
            is_active: new.is_active,
            created_at: now,
            updated_at: now,
        };
        state.destinations.push(destination.clone());
        Ok(destination)
    }

    async fn list_destinations(&self) -> Result<Vec<BackupDestination>> {
        Ok(self.state.lock().await.destinations.clone())
    }

    async fn active_destinations(&self) -> Result<Vec<BackupDestination>> {
        let state = self.state.lock().await;
        Ok(state.destinations.iter().filter(|d| d.is_active).cloned().collect())
    }

    async fn get_destination(&self, id: Uuid) -> Result<Option<BackupDestination>> {
        let state = self.state.lock().await;
        Ok(state.destinations.iter().find(|d| d.id == id).cloned())
    }

    async fn set_destination_active(&self, id: Uuid, active: bool) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.destinations.iter_mut().find(|d| d.id == id) {
            Some(d) => {
                d.is_active = active;
                d.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn update_destination_credentials(
        &self,
        id: Uuid,
        credentials: serde_json::Value,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.destinations.iter_mut().find(|d| d.id == id) {
            Some(d) => {
                d.credentials = credentials;
                d.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn create_run(
        &self,
        cause: RunCause,
        actor: Option<&Actor>,
        destinations: &[BackupDestination],
    ) -> Result<(BackupRun, Vec<BackupUpload>)> {
        let run = BackupRun {
            id: Uuid::new_v4(),
            cause,
            actor_id: actor.map(|a| a.id),
            actor_name: actor.map(|a| a.name.clone()),
            status: RunStatus::Pending,
            file_name: None,
            file_size: None,
            manifest: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let uploads: Vec<BackupUpload> = destinations
            .iter()
            .map(|d| BackupUpload {
                id: Uuid::new_v4(),
                run_id: run.id,
                destination_id: d.id,
                destination_name: d.name.clone(),
                status: UploadStatus::Pending,
                remote_key: None,
                error: None,
                started_at: None,
                completed_at: None,
            })
            .collect();
        let mut state = self.state.lock().await;
        state.runs.push(run.clone());
        state.uploads.extend(uploads.iter().cloned());
        Ok((run, uploads))
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<BackupRun>> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<BackupRun>> {
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn uploads_for_run(&self, run_id: Uuid) -> Result<Vec<BackupUpload>> {
        let state = self.state.lock().await;
        Ok(state.uploads.iter().filter(|u| u.run_id == run_id).cloned().collect())
    }

    async fn mark_run_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.runs.iter_mut().find(|r| r.id == id) {
            Some(run) if run.status == RunStatus::Pending => {
                run.status = RunStatus::Running;
                run.started_at = Some(started_at);
                true
            }
            _ => false,
        })
    }

    async fn finish_run(&self, id: Uuid, outcome: &RunOutcome) -> Result<bool> {
        if self.fail_finish.load(Ordering::SeqCst) {
            return Err(AppError::Storage("connection reset while saving run".to_string()));
        }
        let mut state = self.state.lock().await;
        Ok(match state.runs.iter_mut().find(|r| r.id == id) {
            Some(run) if run.status == RunStatus::Running => {
                run.status = outcome.status;
                run.file_name = Some(outcome.file_name.clone());
                run.file_size = Some(outcome.file_size);
                run.manifest = Some(outcome.manifest.clone());
                run.error = outcome.error.clone();
                run.completed_at = Some(outcome.completed_at);
                true
            }
            _ => false,
        })
    }

    async fn fail_run_if_running(&self, id: Uuid, error: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.runs.iter_mut().find(|r| r.id == id) {
            Some(run) if run.status == RunStatus::Running => {
                run.status = RunStatus::Failed;
                run.error = Some(error.to_string());
                run.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        })
    }

    async fn mark_upload_uploading(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(upload) = state.uploads.iter_mut().find(|u| u.id == id) {
            if upload.status == UploadStatus::Pending {
                upload.status = UploadStatus::Uploading;
                upload.started_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn mark_upload_completed(&self, id: Uuid, remote_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(upload) = state.uploads.iter_mut().find(|u| u.id == id) {
            if !upload.status.is_terminal() {
                upload.status = UploadStatus::Completed;
                upload.remote_key = Some(remote_key.to_string());
                upload.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn mark_upload_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(upload) = state.uploads.iter_mut().find(|u| u.id == id) {
            if !upload.status.is_terminal() {
                upload.status = UploadStatus::Failed;
                upload.error = Some(error.to_string());
                upload.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn expired_runs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(BackupRun, Vec<BackupUpload>)>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Completed && r.created_at <= cutoff)
            .map(|r| {
                let uploads = state.uploads.iter().filter(|u| u.run_id == r.id).cloned().collect();
                (r.clone(), uploads)
            })
            .collect())
    }

    async fn delete_run(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        state.runs.retain(|r| r.id != id);
        state.uploads.retain(|u| u.run_id != id);
        Ok(())
    }

    async fn stuck_runs(
        &self,
        running_before: DateTime<Utc>,
        pending_before: DateTime<Utc>,
    ) -> Result<Vec<BackupRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| match r.status {
                RunStatus::Running => r.started_at.unwrap_or(r.created_at) < running_before,
                RunStatus::Pending => r.created_at < pending_before,
                _ => false,
            })
            .cloned()
            .collect())
    }

    async fn fail_stuck_run(&self, id: Uuid, message: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let failed = match state.runs.iter_mut().find(|r| r.id == id) {
            Some(run) if !run.status.is_terminal() => {
                run.status = RunStatus::Failed;
                run.error = Some(message.to_string());
                run.completed_at = Some(now);
                true
            }
            _ => false,
        };
        if failed {
            for upload in state.uploads.iter_mut().filter(|u| u.run_id == id) {
                if !upload.status.is_terminal() {
                    upload.status = UploadStatus::Failed;
                    upload.error = Some(message.to_string());
                    upload.completed_at = Some(now);
                }
            }
        }
        Ok(failed)
    }
}

#[derive(Default)]
pub struct MemorySettings {
    values: StdMutex<HashMap<String, String>>,
}

#[async_trait]
impl SettingsProvider for MemorySettings {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().map_err(|_| AppError::Storage("poisoned".into()))?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().map_err(|_| AppError::Storage("poisoned".into()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Object store kept in a map. Uploads and deletes can be made to fail.
#[derive(Default)]
pub struct MemoryProvider {
    objects: StdMutex<BTreeMap<String, Vec<u8>>>,
    fail_uploads: AtomicBool,
    fail_deletes: AtomicBool,
    uploads: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryProvider {
    pub fn failing() -> Self {
        let provider = Self::default();
        provider.fail_uploads.store(true, Ordering::SeqCst);
        provider
    }

    pub fn failing_deletes() -> Self {
        let provider = Self::default();
        provider.fail_deletes.store(true, Ordering::SeqCst);
        provider
    }

    pub fn put(&self, key: &str, bytes: &[u8]) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.to_string(), bytes.to_vec());
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn upload_calls(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn objects(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.objects.lock().map_err(|_| AppError::Storage("poisoned".into()))
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn upload(&self, key: &str, local_path: &Path) -> Result<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(AppError::Storage("bucket unreachable".to_string()));
        }
        let bytes = tokio::fs::read(local_path).await?;
        self.objects()?.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn download(&self, key: &str, dest_path: &Path) -> Result<()> {
        let bytes = self
            .objects()?
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::NotFound(key.to_string()))?;
        tokio::fs::write(dest_path, bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(AppError::Storage("delete refused".to_string()));
        }
        self.objects()?.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BackupObject>> {
        let mut objects: Vec<BackupObject> = self
            .objects()?
            .iter()
            .map(|(key, bytes)| BackupObject {
                key: key.clone(),
                size: bytes.len() as u64,
                last_modified: None,
            })
            .collect();
        sort_newest_first(&mut objects);
        Ok(objects)
    }

    async fn test_connection(&self) -> Result<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(AppError::Storage("bucket unreachable".to_string()));
        }
        Ok(())
    }
}

/// Maps destination ids to fixed providers.
#[derive(Default)]
pub struct StaticProviders {
    providers: StdMutex<HashMap<Uuid, Arc<dyn StorageProvider>>>,
}

impl StaticProviders {
    pub fn insert(&self, destination_id: Uuid, provider: Arc<dyn StorageProvider>) {
        if let Ok(mut providers) = self.providers.lock() {
            providers.insert(destination_id, provider);
        }
    }
}

#[async_trait]
impl ProviderResolver for StaticProviders {
    async fn resolve(&self, destination: &BackupDestination) -> Result<Arc<dyn StorageProvider>> {
        let providers = self.providers.lock().map_err(|_| AppError::Storage("poisoned".into()))?;
        providers.get(&destination.id).cloned().ok_or_else(|| {
            AppError::Config(format!("no provider for destination '{}'", destination.name))
        })
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAudit {
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}

pub struct FakeDumper {
    name: String,
    sql: String,
}

impl FakeDumper {
    pub fn new(name: &str, sql: &str) -> Self {
        Self {
            name: name.to_string(),
            sql: sql.to_string(),
        }
    }
}

#[async_trait]
impl DatabaseDumper for FakeDumper {
    fn database_name(&self) -> String {
        self.name.clone()
    }

    async fn dump_to(&self, dest: &Path) -> Result<()> {
        tokio::fs::write(dest, &self.sql).await?;
        Ok(())
    }
}

pub struct FailingDumper;

#[async_trait]
impl DatabaseDumper for FailingDumper {
    fn database_name(&self) -> String {
        "app_db".to_string()
    }

    async fn dump_to(&self, _dest: &Path) -> Result<()> {
        Err(AppError::Command {
            stdout: String::new(),
            stderr: "pg_dump exited with exit status: 1: connection refused".to_string(),
        })
    }
}
