//! The recurring backup trigger.
//!
//! There is at most one trigger, named [`SCHEDULED_BACKUP_TRIGGER`]. Changing the
//! cadence cancels the installed trigger before the new one is spawned, both under
//! the same lock, so two triggers never coexist.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::errors::{AppError, Result};
use crate::queue::{BackupJob, JobQueue};
use crate::settings::{self, SCHEDULE_KEY, SettingsProvider};

pub const SCHEDULED_BACKUP_TRIGGER: &str = "scheduled-backup";

const FIRE_HOUR_UTC: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Manual,
    Daily,
    Weekly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Manual => "manual",
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
        }
    }

    /// Next fire time strictly after `after`: 02:00 UTC every day, or every Sunday.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let fire_time = NaiveTime::from_hms_opt(FIRE_HOUR_UTC, 0, 0)?;
        let today = after.date_naive().and_time(fire_time).and_utc();
        match self {
            Cadence::Manual => None,
            Cadence::Daily => Some(if today > after {
                today
            } else {
                today + Duration::days(1)
            }),
            Cadence::Weekly => {
                let days_to_sunday = (7 - after.weekday().num_days_from_sunday()) % 7;
                let candidate = today + Duration::days(i64::from(days_to_sunday));
                Some(if candidate > after {
                    candidate
                } else {
                    candidate + Duration::days(7)
                })
            }
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" | "" => Ok(Cadence::Manual),
            "daily" => Ok(Cadence::Daily),
            "weekly" => Ok(Cadence::Weekly),
            other => Err(AppError::InvalidInput(format!(
                "unknown backup schedule '{other}'"
            ))),
        }
    }
}

struct InstalledTrigger {
    cadence: Cadence,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    queue: JobQueue,
    settings: Arc<dyn SettingsProvider>,
    trigger: Mutex<Option<InstalledTrigger>>,
}

impl Scheduler {
    pub fn new(queue: JobQueue, settings: Arc<dyn SettingsProvider>) -> Self {
        Self {
            queue,
            settings,
            trigger: Mutex::new(None),
        }
    }

    /// Installs the trigger matching the stored cadence.
    pub async fn sync_from_settings(&self) -> Result<Cadence> {
        let cadence = settings::schedule_cadence(self.settings.as_ref()).await?;
        self.apply(cadence).await;
        Ok(cadence)
    }

    /// Persists a new cadence and replaces the trigger.
    pub async fn update_cadence(&self, cadence: Cadence) -> Result<()> {
        self.settings.set(SCHEDULE_KEY, cadence.as_str()).await?;
        self.apply(cadence).await;
        Ok(())
    }

    pub async fn apply(&self, cadence: Cadence) {
        let mut slot = self.trigger.lock().await;
        if let Some(previous) = slot.take() {
            previous.cancel.cancel();
            info!(
                trigger = SCHEDULED_BACKUP_TRIGGER,
                "Removed {} backup trigger", previous.cadence
            );
        }
        if cadence == Cadence::Manual {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(fire_on_schedule(
            cadence,
            self.queue.clone(),
            cancel.clone(),
        ));
        info!(
            trigger = SCHEDULED_BACKUP_TRIGGER,
            "Installed {} backup trigger", cadence
        );
        *slot = Some(InstalledTrigger {
            cadence,
            cancel,
            handle,
        });
    }

    /// Cadence of the installed trigger, if any.
    pub async fn active_cadence(&self) -> Option<Cadence> {
        self.trigger.lock().await.as_ref().map(|t| t.cadence)
    }

    /// Removes the trigger and waits for its task to exit.
    pub async fn shutdown(&self) {
        let installed = self.trigger.lock().await.take();
        if let Some(installed) = installed {
            installed.cancel.cancel();
            let _ = installed.handle.await;
        }
    }
}

async fn fire_on_schedule(cadence: Cadence, queue: JobQueue, cancel: CancellationToken) {
    let mut last_fire: Option<DateTime<Utc>> = None;
    loop {
        let from = match last_fire {
            Some(previous) => previous.max(Utc::now()),
            None => Utc::now(),
        };
        let Some(next) = cadence.next_fire_after(from) else {
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        info!(trigger = SCHEDULED_BACKUP_TRIGGER, "Next {} backup at {}", cadence, next);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = queue.enqueue(BackupJob::scheduled()) {
            error!(trigger = SCHEDULED_BACKUP_TRIGGER, "Could not enqueue scheduled backup: {}", e);
            return;
        }
        last_fire = Some(next);
    }
}
