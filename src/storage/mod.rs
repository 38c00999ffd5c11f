//! Persistence: device profiles, RGB profiles and backup archives.
//!
//! Everything lives under one database root:
//! `profiles/<serial>.json` (active device profile),
//! `profiles/<serial>-<name>.json` (named inactive profiles),
//! `rgb/<serial>.json` (RGB profile sets) and
//! `temperatures/<name>.json` (speed profiles).

pub mod backup;
pub mod profiles;

use std::path::{Path, PathBuf};

use crate::error::{DeviceError, Result};

pub use profiles::{DeviceProfile, DpiStage, ProfileStore, RgbStore};

/// Profile names are restricted to `[A-Za-z0-9-]+` so they embed safely in
/// file names.
pub fn validate_profile_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DeviceError::Validation("Profile name is empty".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(DeviceError::Validation(format!(
            "Profile name '{}' may only contain letters, digits and dashes",
            name
        )));
    }
    Ok(())
}

/// Resolved directory layout of the database root.
#[derive(Debug, Clone)]
pub struct Database {
    root: PathBuf,
}

impl Database {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join("profiles")
    }

    pub fn rgb_dir(&self) -> PathBuf {
        self.root.join("rgb")
    }

    pub fn temperatures_dir(&self) -> PathBuf {
        self.root.join("temperatures")
    }

    /// Create every directory the stores write into.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.profiles_dir(),
            self.rgb_dir(),
            self.temperatures_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| DeviceError::Storage(format!("Failed to create {:?}: {}", dir, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["Normal", "my-profile", "Quiet2", "a"] {
            assert!(validate_profile_name(name).is_ok(), "{} rejected", name);
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "my profile", "a/b", "../x", "naïve", "dot.json"] {
            assert!(validate_profile_name(name).is_err(), "{} accepted", name);
        }
    }

    #[test]
    fn test_layout() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("database"));
        db.ensure_layout().unwrap();
        assert!(db.profiles_dir().is_dir());
        assert!(db.rgb_dir().is_dir());
        assert!(db.temperatures_dir().is_dir());
    }
}
