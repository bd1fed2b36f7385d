//! Interactive disaster recovery onto a machine with no usable configuration.
//!
//! Nothing here reads persisted settings: the operator types the storage
//! credentials, picks an archive and confirms before anything on disk or in the
//! database is touched.

pub mod console;
pub mod db_restore;
pub mod env_file;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::archive::{self, DATABASE_FILE, ENV_FILE, UPLOADS_DIR, tarball};
use crate::errors::AppError;
use crate::storage::{self, ProviderKind, StorageProvider, key_file_name};

pub use console::Console;
pub use db_restore::{DatabaseLoader, PsqlLoader};

pub const CONFIRM_PHRASE: &str = "RESTORE";

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Application directory receiving the restored `.env`.
    pub target_dir: PathBuf,
    /// Live uploads directory the archived files are copied over.
    pub uploads_dir: PathBuf,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoverySummary {
    pub archive_key: String,
    pub env_restored: bool,
    pub previous_env: Option<PathBuf>,
    pub database_restored: bool,
    pub uploads_copied: u64,
}

/// Full session: credentials, archive choice, confirmation, restore.
pub async fn run_interactive<R: BufRead, W: Write>(
    console: &mut Console<R, W>,
    options: &RecoveryOptions,
    loader: &dyn DatabaseLoader,
) -> Result<RecoverySummary> {
    let (kind, credentials) = prompt_credentials(console)?;
    let provider = storage::provider_from_credentials(kind.as_str(), &credentials)
        .await
        .context("Could not set up the storage provider")?;
    console.say(format!("Connecting to {}...", provider.describe()))?;
    provider
        .test_connection()
        .await
        .context("Storage connection test failed")?;
    restore_from(console, provider.as_ref(), options, loader).await
}

/// Asks for a provider family and its credential fields. Malformed input is
/// rejected here, before any network call.
pub fn prompt_credentials<R: BufRead, W: Write>(
    console: &mut Console<R, W>,
) -> std::result::Result<(ProviderKind, Value), AppError> {
    let kinds = [ProviderKind::S3, ProviderKind::B2, ProviderKind::GoogleDrive];
    console.say("Where are the backups stored?")?;
    for (i, kind) in kinds.iter().enumerate() {
        console.say(format!("  {}. {}", i + 1, kind))?;
    }
    let kind = kinds[console.choose("Provider", kinds.len())?];

    let credentials = match kind {
        ProviderKind::S3 | ProviderKind::B2 => {
            let mut fields = Map::new();
            fields.insert("access_key_id".into(), console.ask_required("Access key id")?.into());
            fields.insert(
                "secret_access_key".into(),
                console.ask_required("Secret access key")?.into(),
            );
            fields.insert("bucket".into(), console.ask_required("Bucket")?.into());
            if let Some(region) = console.ask_optional("Region")? {
                fields.insert("region".into(), region.into());
            }
            if let Some(endpoint) = console.ask_optional("Custom endpoint URL")? {
                fields.insert("endpoint".into(), endpoint.into());
            }
            Value::Object(fields)
        }
        ProviderKind::GoogleDrive => {
            let folder_id = console.ask_required("Drive folder id")?;
            let answer = console.ask_required("Service account key (JSON, or path to the key file)")?;
            let document = if Path::new(&answer).is_file() {
                std::fs::read_to_string(&answer)?
            } else {
                answer
            };
            let service_account: Value = serde_json::from_str(&document).map_err(|e| {
                AppError::InvalidInput(format!("service account key is not valid JSON: {e}"))
            })?;
            serde_json::json!({ "folder_id": folder_id, "service_account": service_account })
        }
    };

    storage::validate_credentials(kind, &credentials)?;
    Ok((kind, credentials))
}

/// Lists the provider's archives, lets the operator pick one and restores it.
pub async fn restore_from<R: BufRead, W: Write>(
    console: &mut Console<R, W>,
    provider: &dyn StorageProvider,
    options: &RecoveryOptions,
    loader: &dyn DatabaseLoader,
) -> Result<RecoverySummary> {
    let archives = provider.list().await.context("Failed to list backups")?;
    if archives.is_empty() {
        bail!("No backups found at {}", provider.describe());
    }

    console.say("Available backups (newest first):")?;
    for (i, object) in archives.iter().enumerate() {
        let when = object
            .last_modified
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "unknown time".to_string());
        console.say(format!(
            "  {}. {}  {}  {}",
            i + 1,
            key_file_name(&object.key),
            human_size(object.size),
            when
        ))?;
    }
    let chosen = &archives[console.choose("Backup to restore", archives.len())?];

    console.say(format!(
        "⚠️  This overwrites the database at DATABASE_URL, the .env in {} and files in {}.",
        options.target_dir.display(),
        options.uploads_dir.display()
    ))?;
    console.confirm_phrase(CONFIRM_PHRASE)?;

    let work = tempfile::Builder::new()
        .prefix("vaultline-restore-")
        .tempdir()
        .context("Failed to create a temporary directory")?;
    let archive_path = work.path().join(key_file_name(&chosen.key));
    console.say(format!("Downloading {}...", chosen.key))?;
    provider
        .download(&chosen.key, &archive_path)
        .await
        .with_context(|| format!("Failed to download {}", chosen.key))?;

    let extracted = work.path().join("extracted");
    let manifest = archive::extract(&archive_path, &extracted).await?;
    if manifest.is_unknown() {
        console.say("Archive has no readable manifest; continuing without version details.")?;
    } else {
        console.say(format!(
            "Backup of '{}' taken {} by app version {} (runtime {}).",
            manifest.database, manifest.created_at, manifest.app_version, manifest.runtime_version
        ))?;
    }

    let mut summary = RecoverySummary {
        archive_key: chosen.key.clone(),
        ..Default::default()
    };

    let target_env = options.target_dir.join(ENV_FILE);
    let archived_env = extracted.join(ENV_FILE);
    if archived_env.is_file() {
        summary.previous_env = env_file::restore_env_file(&archived_env, &target_env)?;
        summary.env_restored = true;
        console.say(format!("✓ Restored {}", target_env.display()))?;
        if let Some(previous) = &summary.previous_env {
            console.say(format!("  previous file kept as {}", previous.display()))?;
        }
    }

    let dump = extracted.join(DATABASE_FILE);
    if dump.is_file() {
        let database_url = match env_file::read_database_url(&target_env)? {
            Some(url) => url,
            None => console.ask_required("DATABASE_URL of the database to restore into")?,
        };
        loader
            .load(&database_url, &dump)
            .await
            .context("Database restore failed")?;
        summary.database_restored = true;
        console.say("✓ Database restored")?;
    } else {
        console.say(format!("⚠️  Archive has no {}; database left untouched.", DATABASE_FILE))?;
    }

    let archived_uploads = extracted.join(UPLOADS_DIR);
    if archived_uploads.is_dir() {
        let dest = options.uploads_dir.clone();
        summary.uploads_copied =
            tokio::task::spawn_blocking(move || tarball::copy_tree(&archived_uploads, &dest))
                .await
                .context("Upload copy task panicked")??;
        console.say(format!("✓ Copied {} uploaded files", summary.uploads_copied))?;
    }

    work.close()
        .context("Failed to remove the temporary restore directory")?;

    print_follow_up(console, options)?;
    Ok(summary)
}

fn print_follow_up<R: BufRead, W: Write>(
    console: &mut Console<R, W>,
    options: &RecoveryOptions,
) -> Result<()> {
    let dir = options.target_dir.display();
    console.say("")?;
    console.say("Restore finished. To bring the application back:")?;
    console.say(format!("  cd {}", dir))?;
    console.say("  # review .env, then apply any schema changes newer than the backup")?;
    console.say("  vaultline serve    # runs pending migrations on start")?;
    console.say("  # rebuild and restart the application service, e.g.")?;
    console.say("  sudo systemctl restart <your-app-service>")?;
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
