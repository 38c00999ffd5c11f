//! Backup and restore of the database directory.
//!
//! A backup is a ZIP of the `database` tree plus `config.json`, with a
//! trailing `_hash.txt` holding the lowercase hex SHA-256 of every zipped
//! file body concatenated in write order. Restore validates every entry
//! path before extracting anything.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::{DeviceError, Result};

/// Name of the hash manifest inside the archive.
pub const HASH_ENTRY: &str = "_hash.txt";

/// Archive entry prefix for the database tree.
const DATABASE_PREFIX: &str = "database";

// =============================================================================
// Create
// =============================================================================

/// Write a backup of `database_root` (and `config_file`, when it exists)
/// to `out`.
pub fn create_backup(database_root: &Path, config_file: &Path, out: &Path) -> Result<()> {
    let file = File::create(out)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    let mut hasher = Sha256::new();

    for relative in collect_files(database_root)? {
        let body = std::fs::read(database_root.join(&relative))?;
        let entry = format!("{}/{}", DATABASE_PREFIX, to_entry_name(&relative));
        writer
            .start_file(entry, options)
            .map_err(|e| DeviceError::Backup(e.to_string()))?;
        writer.write_all(&body)?;
        hasher.update(&body);
    }

    if config_file.exists() {
        let body = std::fs::read(config_file)?;
        writer
            .start_file("config.json", options)
            .map_err(|e| DeviceError::Backup(e.to_string()))?;
        writer.write_all(&body)?;
        hasher.update(&body);
    }

    writer
        .start_file(HASH_ENTRY, options)
        .map_err(|e| DeviceError::Backup(e.to_string()))?;
    writer.write_all(hex_digest(hasher).as_bytes())?;
    writer
        .finish()
        .map_err(|e| DeviceError::Backup(e.to_string()))?;

    info!(archive = %out.display(), "backup written");
    Ok(())
}

// =============================================================================
// Restore
// =============================================================================

/// Extract a backup into `dest_root`.
///
/// Every entry path is validated first; an archive containing any escape
/// from the destination is rejected before a single byte is extracted.
/// `_hash.txt` is skipped.
pub fn restore_backup(archive_path: &Path, dest_root: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| DeviceError::Backup(e.to_string()))?;

    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| DeviceError::Backup(e.to_string()))?;
        validate_entry_path(entry.name())?;
    }

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| DeviceError::Backup(e.to_string()))?;
        if entry.name() == HASH_ENTRY || entry.is_dir() {
            continue;
        }
        let target = dest_root.join(entry.name());
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut body = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut body)?;
        std::fs::write(&target, body)?;
    }

    info!(dest = %dest_root.display(), "backup restored");
    Ok(())
}

/// Recompute the body hash of `archive_path` and compare it with the
/// stored `_hash.txt`.
pub fn verify_backup(archive_path: &Path) -> Result<bool> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| DeviceError::Backup(e.to_string()))?;

    let mut hasher = Sha256::new();
    let mut stored = None;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| DeviceError::Backup(e.to_string()))?;
        let mut body = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut body)?;
        if entry.name() == HASH_ENTRY {
            stored = Some(String::from_utf8_lossy(&body).trim().to_string());
        } else {
            hasher.update(&body);
        }
    }

    let Some(stored) = stored else {
        return Err(DeviceError::Backup("archive has no hash manifest".into()));
    };
    Ok(stored == hex_digest(hasher))
}

// =============================================================================
// Helpers
// =============================================================================

fn validate_entry_path(name: &str) -> Result<()> {
    let path = Path::new(name);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
    if escapes {
        return Err(DeviceError::Backup(format!(
            "archive entry '{}' escapes the destination",
            name
        )));
    }
    Ok(())
}

/// Relative paths of every file below `root`, sorted for a deterministic
/// write (and hash) order.
fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, root, out)?;
            } else if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_path_buf());
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    if root.is_dir() {
        walk(root, root, &mut files)?;
    }
    files.sort();
    Ok(files)
}

fn to_entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
