//! Daemon configuration files.
//!
//! `config.json` is consumed once at startup; `scheduler.json` holds the
//! user's RGB on/off times for the web layer. Both tolerate missing fields
//! so a hand-edited file keeps loading across versions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

const CONFIG_FILE: &str = "config.json";
const SCHEDULER_FILE: &str = "scheduler.json";

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address the web layer binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Port the web layer binds to.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Preferred hwmon chip label for the CPU temperature sensor.
    /// Empty means autodetect.
    #[serde(default)]
    pub cpu_sensor_chip: String,

    /// Root of the persisted database (profiles, rgb, temperatures).
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    27003
}

fn default_database_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("corsair-link")
        .join("database")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            cpu_sensor_chip: String::new(),
            database_path: default_database_path(),
        }
    }
}

impl DaemonConfig {
    /// Load `config.json` from `dir`, falling back to defaults when the
    /// file does not exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| DeviceError::Storage(format!("Failed to read config: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| DeviceError::Storage(format!("Failed to parse config: {}", e)))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .map_err(|e| DeviceError::Storage(format!("Failed to create config dir: {}", e)))?;
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DeviceError::Storage(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(dir.join(CONFIG_FILE), content)
            .map_err(|e| DeviceError::Storage(format!("Failed to write config: {}", e)))?;
        Ok(())
    }

    /// Path of the config file inside `dir`.
    pub fn file_path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }
}

/// Time-of-day RGB schedule, evaluated by the web layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Minutes after midnight when lighting turns off.
    #[serde(default = "default_off_at")]
    pub rgb_off_at: u16,

    /// Minutes after midnight when lighting turns back on.
    #[serde(default = "default_on_at")]
    pub rgb_on_at: u16,
}

fn default_off_at() -> u16 {
    23 * 60
}

fn default_on_at() -> u16 {
    7 * 60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rgb_off_at: default_off_at(),
            rgb_on_at: default_on_at(),
        }
    }
}

impl SchedulerConfig {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SCHEDULER_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| DeviceError::Storage(format!("Failed to read scheduler: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| DeviceError::Storage(format!("Failed to parse scheduler: {}", e)))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .map_err(|e| DeviceError::Storage(format!("Failed to create config dir: {}", e)))?;
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DeviceError::Storage(format!("Failed to serialize scheduler: {}", e)))?;
        std::fs::write(dir.join(SCHEDULER_FILE), content)
            .map_err(|e| DeviceError::Storage(format!("Failed to write scheduler: {}", e)))?;
        Ok(())
    }
}
