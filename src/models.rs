//! Catalog records shared by the orchestrator, the reapers and the admin UI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::AppError;
use crate::storage::ProviderKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunCause {
    Manual,
    Scheduled,
}

impl RunCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunCause::Manual => "manual",
            RunCause::Scheduled => "scheduled",
        }
    }
}

impl FromStr for RunCause {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(RunCause::Manual),
            "scheduled" => Ok(RunCause::Scheduled),
            other => Err(AppError::InvalidInput(format!("unknown run cause: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Partial | RunStatus::Failed
        )
    }

    /// Status only moves forward. `pending -> failed` covers runs that were never
    /// picked up by a worker.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Pending, RunStatus::Failed) => true,
            (RunStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }

    /// A run's final status derived from its uploads: every copy landed, none did, or some.
    pub fn from_uploads<I>(statuses: I) -> RunStatus
    where
        I: IntoIterator<Item = UploadStatus>,
    {
        let mut total = 0usize;
        let mut completed = 0usize;
        for status in statuses {
            total += 1;
            if status == UploadStatus::Completed {
                completed += 1;
            }
        }
        if completed == 0 {
            RunStatus::Failed
        } else if completed == total {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(AppError::InvalidInput(format!("unknown run status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "uploading" => Ok(UploadStatus::Uploading),
            "completed" => Ok(UploadStatus::Completed),
            "failed" => Ok(UploadStatus::Failed),
            other => Err(AppError::InvalidInput(format!(
                "unknown upload status: {other}"
            ))),
        }
    }
}

/// Who asked for a manual run. Scheduled runs carry none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDestination {
    pub id: Uuid,
    pub name: String,
    pub provider: ProviderKind,
    pub credentials: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDestination {
    pub name: String,
    pub provider: ProviderKind,
    pub credentials: serde_json::Value,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: Uuid,
    pub cause: RunCause,
    pub actor_id: Option<Uuid>,
    pub actor_name: Option<String>,
    pub status: RunStatus,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub manifest: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupUpload {
    pub id: Uuid,
    pub run_id: Uuid,
    pub destination_id: Uuid,
    pub destination_name: String,
    pub status: UploadStatus,
    pub remote_key: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Everything written onto a run when its fan-out has settled.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub file_name: String,
    pub file_size: i64,
    pub manifest: serde_json::Value,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}
