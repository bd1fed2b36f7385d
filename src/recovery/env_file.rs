use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Copies the archived env file to `target`. An existing file is renamed to
/// `<name>.before-restore-<timestamp>` first; the new path is returned.
pub fn restore_env_file(archived: &Path, target: &Path) -> Result<Option<PathBuf>> {
    let mut preserved = None;
    if target.exists() {
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".env".to_string());
        let backup = target.with_file_name(format!(
            "{}.before-restore-{}",
            file_name,
            Utc::now().format("%Y%m%dT%H%M%S")
        ));
        std::fs::rename(target, &backup).with_context(|| {
            format!("Failed to move {} aside to {}", target.display(), backup.display())
        })?;
        preserved = Some(backup);
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::copy(archived, target)
        .with_context(|| format!("Failed to write {}", target.display()))?;
    Ok(preserved)
}

/// `DATABASE_URL` from an env file, if the file exists and sets it.
pub fn read_database_url(env_file: &Path) -> Result<Option<String>> {
    if !env_file.is_file() {
        return Ok(None);
    }
    let entries = dotenvy::from_path_iter(env_file)
        .with_context(|| format!("Failed to read {}", env_file.display()))?;
    for entry in entries {
        let (key, value) =
            entry.with_context(|| format!("Malformed line in {}", env_file.display()))?;
        if key == "DATABASE_URL" && !value.trim().is_empty() {
            return Ok(Some(value));
        }
    }
    Ok(None)
}
