use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::{AppError, Result};
use crate::models::{BackupRun, BackupUpload, UploadStatus};
use crate::settings::{self, SettingsProvider};
use crate::storage::{ProviderResolver, backup_key};
use crate::store::BackupStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub retention_days: i64,
    pub runs_deleted: usize,
    pub remote_deleted: usize,
    pub remote_failures: usize,
}

/// Prunes completed runs past the retention window, together with every remote copy they
/// produced. Partial and failed runs are kept.
pub struct RetentionReaper {
    store: Arc<dyn BackupStore>,
    settings: Arc<dyn SettingsProvider>,
    providers: Arc<dyn ProviderResolver>,
}

impl RetentionReaper {
    pub fn new(
        store: Arc<dyn BackupStore>,
        settings: Arc<dyn SettingsProvider>,
        providers: Arc<dyn ProviderResolver>,
    ) -> Self {
        Self {
            store,
            settings,
            providers,
        }
    }

    pub async fn sweep(&self) -> Result<RetentionReport> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let retention_days = settings::retention_days(self.settings.as_ref()).await?;
        let cutoff = now - Duration::days(retention_days);
        let expired = self.store.expired_runs(cutoff).await?;
        let mut report = RetentionReport {
            retention_days,
            ..Default::default()
        };
        if expired.is_empty() {
            debug!("No runs older than {} days", retention_days);
            return Ok(report);
        }

        for (run, uploads) in expired {
            for upload in uploads.iter().filter(|u| u.status == UploadStatus::Completed) {
                match self.delete_remote_copy(&run, upload).await {
                    Ok(()) => report.remote_deleted += 1,
                    Err(e) => {
                        warn!(
                            "Could not delete backup of run {} from '{}': {}",
                            run.id, upload.destination_name, e
                        );
                        report.remote_failures += 1;
                    }
                }
            }
            self.store.delete_run(run.id).await?;
            report.runs_deleted += 1;
        }

        info!(
            "Retention sweep ({} days): removed {} runs, {} remote copies deleted, {} failed",
            report.retention_days, report.runs_deleted, report.remote_deleted, report.remote_failures
        );
        Ok(report)
    }

    async fn delete_remote_copy(&self, run: &BackupRun, upload: &BackupUpload) -> Result<()> {
        let key = upload
            .remote_key
            .clone()
            .or_else(|| run.file_name.as_deref().map(backup_key))
            .ok_or_else(|| AppError::NotFound(format!("remote key for upload {}", upload.id)))?;
        let destination = self
            .store
            .get_destination(upload.destination_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("backup destination {}", upload.destination_id))
            })?;
        let provider = self.providers.resolve(&destination).await?;
        provider.delete(&key).await
    }
}
