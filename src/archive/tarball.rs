//! Packing and unpacking snapshot directories as `.tar.gz`.

use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::debug;
use walkdir::WalkDir;

use super::DATABASE_FILE;

/// Packs a snapshot working directory into `archive_path` and returns the number
/// of files packed.
///
/// The gzip stream is written under a `.partial` name and renamed into place once
/// finished, so a failed pack never leaves a file at `archive_path`. Symlinks and
/// special files are skipped.
pub fn pack_snapshot(work_dir: &Path, archive_path: &Path) -> Result<usize> {
    if !work_dir.join(DATABASE_FILE).is_file() {
        bail!(
            "Snapshot in {} has no {}; refusing to pack it",
            work_dir.display(),
            DATABASE_FILE
        );
    }
    let partial = partial_path(archive_path)?;

    let result = write_tar_gz(work_dir, &partial).and_then(|files| {
        std::fs::rename(&partial, archive_path).with_context(|| {
            format!(
                "Failed to move {} into place at {}",
                partial.display(),
                archive_path.display()
            )
        })?;
        Ok(files)
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&partial);
    }
    result
}

fn partial_path(archive_path: &Path) -> Result<PathBuf> {
    let name = archive_path
        .file_name()
        .with_context(|| format!("Archive path {} has no file name", archive_path.display()))?;
    Ok(archive_path.with_file_name(format!("{}.partial", name.to_string_lossy())))
}

fn write_tar_gz(work_dir: &Path, dest: &Path) -> Result<usize> {
    let file = File::create(dest)
        .with_context(|| format!("Failed to create archive file {}", dest.display()))?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    let mut files = 0;

    // Sorted so the same tree always yields the same entry order.
    for entry in WalkDir::new(work_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", work_dir.display()))?;
        let path = entry.path();
        let name = path.strip_prefix(work_dir).with_context(|| {
            format!("{} is outside {}", path.display(), work_dir.display())
        })?;

        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder
                .append_dir(name, path)
                .with_context(|| format!("Failed to add directory {}", name.display()))?;
        } else if file_type.is_file() {
            builder
                .append_path_with_name(path, name)
                .with_context(|| format!("Failed to add {}", name.display()))?;
            files += 1;
        } else {
            debug!("Skipping {}: not a regular file", path.display());
        }
    }

    let file = builder
        .into_inner()
        .context("Failed to finish tar stream")?
        .finish()
        .context("Failed to finish gzip stream")?;
    file.sync_all()
        .with_context(|| format!("Failed to flush {}", dest.display()))?;
    Ok(files)
}

/// Unpacks a snapshot archive into `dest_dir` and returns the number of entries
/// written. Entries that would land outside `dest_dir` are refused, and an archive
/// without a database dump is rejected as not being a backup.
pub fn unpack_snapshot(archive_path: &Path, dest_dir: &Path) -> Result<usize> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive {}", archive_path.display()))?;
    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

    let mut archive = Archive::new(GzDecoder::new(file));
    let mut unpacked = 0;
    for entry in archive
        .entries()
        .with_context(|| format!("Failed to read {}", archive_path.display()))?
    {
        let mut entry =
            entry.with_context(|| format!("Corrupt entry in {}", archive_path.display()))?;
        let name = entry
            .path()
            .with_context(|| format!("Unreadable entry name in {}", archive_path.display()))?
            .into_owned();
        let inside = entry
            .unpack_in(dest_dir)
            .with_context(|| format!("Failed to unpack {}", name.display()))?;
        if !inside {
            bail!(
                "Archive entry {} would be written outside {}",
                name.display(),
                dest_dir.display()
            );
        }
        unpacked += 1;
    }

    if !dest_dir.join(DATABASE_FILE).is_file() {
        bail!(
            "{} is not a backup archive: {} is missing",
            archive_path.display(),
            DATABASE_FILE
        );
    }
    debug!(
        "Unpacked {} entries from {} into {}",
        unpacked,
        archive_path.display(),
        dest_dir.display()
    );
    Ok(unpacked)
}

/// Recursively copies `source` into `dest`, creating directories as needed and
/// overwriting files that already exist. Returns the number of files copied.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(source) {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        let relative = entry.path().strip_prefix(source).with_context(|| {
            format!(
                "Failed to strip prefix {} from {}",
                source.display(),
                entry.path().display()
            )
        })?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory {}", target.display()))?;
        } else if entry.path().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}
