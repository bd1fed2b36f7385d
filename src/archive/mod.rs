//! Self-contained snapshot archives: database dump, uploaded files, environment
//! config and a manifest, packed as one `.tar.gz`.
//!
//! Layout inside the archive:
//! ```text
//! manifest.json
//! database.sql
//! uploads/...      (optional)
//! .env             (optional)
//! ```

pub mod dump;
pub mod manifest;
pub mod tarball;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub use dump::{DatabaseDumper, PgDump};
pub use manifest::Manifest;

pub const DATABASE_FILE: &str = "database.sql";
pub const UPLOADS_DIR: &str = "uploads";
pub const ENV_FILE: &str = ".env";

#[derive(Debug, Clone)]
pub struct CreatedArchive {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub manifest: Manifest,
}

pub fn archive_file_name(at: DateTime<Utc>) -> String {
    format!("backup-{}.tar.gz", at.format("%Y-%m-%dT%H-%M-%S-%3fZ"))
}

pub struct ArchiveBuilder {
    dumper: Arc<dyn DatabaseDumper>,
    uploads_dir: PathBuf,
    env_file: PathBuf,
    app_version: String,
}

impl ArchiveBuilder {
    pub fn new(
        dumper: Arc<dyn DatabaseDumper>,
        uploads_dir: impl Into<PathBuf>,
        env_file: impl Into<PathBuf>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            dumper,
            uploads_dir: uploads_dir.into(),
            env_file: env_file.into(),
            app_version: app_version.into(),
        }
    }

    /// Builds one archive inside `out_dir`. The intermediate working directory is
    /// removed on every path; if the dump fails no archive file exists afterwards.
    pub async fn create(&self, out_dir: &Path) -> Result<CreatedArchive> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .with_context(|| format!("Failed to create {}", out_dir.display()))?;
        let work = tempfile::Builder::new()
            .prefix("backup-work-")
            .tempdir_in(out_dir)
            .context("Failed to allocate archive working directory")?;
        let work_path = work.path().to_path_buf();

        self.dumper
            .dump_to(&work_path.join(DATABASE_FILE))
            .await
            .context("Database dump failed; no archive was produced")?;

        if self.uploads_dir.is_dir() {
            let source = self.uploads_dir.clone();
            let dest = work_path.join(UPLOADS_DIR);
            let copied = tokio::task::spawn_blocking(move || tarball::copy_tree(&source, &dest))
                .await
                .context("Upload copy task panicked")??;
            info!("Copied {} uploaded files into the archive", copied);
        } else {
            info!(
                "Uploads directory {} not present, skipping",
                self.uploads_dir.display()
            );
        }

        if self.env_file.is_file() {
            tokio::fs::copy(&self.env_file, work_path.join(ENV_FILE))
                .await
                .with_context(|| format!("Failed to copy {}", self.env_file.display()))?;
        }

        let manifest = Manifest::new(&self.app_version, &self.dumper.database_name());
        manifest.write_to(&work_path)?;

        let file_name = archive_file_name(Utc::now());
        let archive_path = out_dir.join(&file_name);
        let tar_source = work_path.clone();
        let tar_dest = archive_path.clone();
        let files = tokio::task::spawn_blocking(move || tarball::pack_snapshot(&tar_source, &tar_dest))
            .await
            .context("Archive task panicked")??;

        work.close()
            .context("Failed to remove archive working directory")?;

        let size = tokio::fs::metadata(&archive_path).await?.len();
        info!("Created archive {} ({} files, {} bytes)", file_name, files, size);
        Ok(CreatedArchive {
            path: archive_path,
            file_name,
            size,
            manifest,
        })
    }
}

/// Unpacks `archive` into `dest_dir` and returns its manifest, or
/// [`Manifest::unknown`] for archives without a usable one. Archives without a
/// database dump are rejected.
pub async fn extract(archive: &Path, dest_dir: &Path) -> Result<Manifest> {
    let archive = archive.to_path_buf();
    let dest = dest_dir.to_path_buf();
    tokio::task::spawn_blocking(move || tarball::unpack_snapshot(&archive, &dest))
        .await
        .context("Extraction task panicked")??;
    Ok(Manifest::read_from(dest_dir))
}
