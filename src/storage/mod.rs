//! Uniform access to the cloud backends a backup can be shipped to.
//!
//! Two families sit behind [`StorageProvider`]:
//! * object storage (`s3`, `b2`) served by one parameterized [`ObjectStorageProvider`];
//! * document storage (`google_drive`), addressed by file name inside a folder.
//!
//! Every backup object lives under [`BACKUP_PREFIX`] so listing never picks up
//! unrelated keys.

pub mod drive;
pub mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use crate::errors::{AppError, Result};
use crate::models::BackupDestination;

pub use drive::{DriveProvider, DriveSettings};
pub use s3::{ObjectStorageProvider, ObjectStorageSettings};

pub const BACKUP_PREFIX: &str = "backups/";

static BACKUP_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^backup-[A-Za-z0-9_.:-]*\.tar\.gz$").expect("backup name pattern is valid")
});

/// True if `name` (a bare file name, no prefix) looks like an archive this tool produced.
pub fn is_backup_name(name: &str) -> bool {
    BACKUP_NAME_PATTERN.is_match(name)
}

/// Storage key for an archive file name.
pub fn backup_key(file_name: &str) -> String {
    format!("{}{}", BACKUP_PREFIX, file_name)
}

/// Last path segment of a key; the document store only knows names.
pub fn key_file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    S3,
    B2,
    GoogleDrive,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::S3 => "s3",
            ProviderKind::B2 => "b2",
            ProviderKind::GoogleDrive => "google_drive",
        }
    }

    pub fn is_object_storage(&self) -> bool {
        matches!(self, ProviderKind::S3 | ProviderKind::B2)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" | "aws" => Ok(ProviderKind::S3),
            "b2" | "backblaze" => Ok(ProviderKind::B2),
            "google_drive" | "gdrive" | "drive" => Ok(ProviderKind::GoogleDrive),
            other => Err(AppError::Config(format!(
                "Unknown storage provider kind: '{}'",
                other
            ))),
        }
    }
}

/// One archive as seen by a backend listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short label for logs, e.g. `s3:my-bucket`.
    fn describe(&self) -> String;

    async fn upload(&self, key: &str, local_path: &Path) -> Result<()>;

    async fn download(&self, key: &str, dest_path: &Path) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Archives under the backup prefix, newest first.
    async fn list(&self) -> Result<Vec<BackupObject>>;

    async fn test_connection(&self) -> Result<()>;
}

/// Newest first; objects without a timestamp sink to the end, ties broken by key.
pub fn sort_newest_first(objects: &mut [BackupObject]) {
    objects.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| b.key.cmp(&a.key))
    });
}

/// Turns a persisted destination into a live provider.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    async fn resolve(&self, destination: &BackupDestination) -> Result<Arc<dyn StorageProvider>>;
}

/// Resolves destinations to the real cloud backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct CloudProviders;

#[async_trait]
impl ProviderResolver for CloudProviders {
    async fn resolve(&self, destination: &BackupDestination) -> Result<Arc<dyn StorageProvider>> {
        provider_from_destination(destination).await
    }
}

/// Builds a provider from a persisted destination.
pub async fn provider_from_destination(
    destination: &BackupDestination,
) -> Result<Arc<dyn StorageProvider>> {
    build_provider(destination.provider, &destination.credentials).await
}

/// Builds a provider from raw credentials, e.g. for "test before saving" or the recovery CLI.
pub async fn provider_from_credentials(
    kind: &str,
    credentials: &serde_json::Value,
) -> Result<Arc<dyn StorageProvider>> {
    let kind = ProviderKind::from_str(kind)?;
    build_provider(kind, credentials).await
}

async fn build_provider(
    kind: ProviderKind,
    credentials: &serde_json::Value,
) -> Result<Arc<dyn StorageProvider>> {
    validate_credentials(kind, credentials)?;
    match kind {
        ProviderKind::S3 | ProviderKind::B2 => {
            let settings = ObjectStorageSettings::from_credentials(kind, credentials)?;
            Ok(Arc::new(ObjectStorageProvider::connect(settings).await))
        }
        ProviderKind::GoogleDrive => {
            let settings = DriveSettings::from_credentials(credentials)?;
            Ok(Arc::new(DriveProvider::new(settings)?))
        }
    }
}

/// Checks the credential payload has the shape `kind` needs, without touching the network.
pub fn validate_credentials(kind: ProviderKind, credentials: &serde_json::Value) -> Result<()> {
    match kind {
        ProviderKind::S3 | ProviderKind::B2 => {
            ObjectStorageSettings::from_credentials(kind, credentials).map(|_| ())
        }
        ProviderKind::GoogleDrive => DriveSettings::from_credentials(credentials).map(|_| ()),
    }
}

/// Reads a required, non-empty string field from a credential payload.
pub(crate) fn required_field(credentials: &serde_json::Value, field: &str) -> Result<String> {
    credentials
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Config(format!("Credential field '{}' is missing or empty", field)))
}

pub(crate) fn optional_field(credentials: &serde_json::Value, field: &str) -> Option<String> {
    credentials
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
