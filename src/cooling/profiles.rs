//! Speed profiles: temperature bands with fan and pump targets.
//!
//! Profiles are persisted one file per name under `database/temperatures/`.
//! The built-in names "Normal", "Quiet" and "Performance" always exist and
//! cannot be deleted; every channel that loses its profile falls back to
//! "Normal".

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cooling::{clamp_fan, clamp_pump};
use crate::error::{DeviceError, Result};
use crate::storage::validate_profile_name;

/// Names seeded on first run and protected from deletion.
pub const BUILTIN_PROFILES: [&str; 3] = ["Normal", "Quiet", "Performance"];

/// The universal fallback profile name.
pub const FALLBACK_PROFILE: &str = "Normal";

// =============================================================================
// Model
// =============================================================================

/// Temperature source a profile follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempSensor {
    /// Host CPU package sensor.
    Cpu,
    /// Discrete GPU sensor, falling back to CPU when absent.
    Gpu,
    /// This device's own coolant probe.
    Liquid,
}

/// One row of a speed profile: a closed-open temperature interval with
/// fan and pump targets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedBand {
    pub temp_min: f32,
    pub temp_max: f32,
    pub fan_pct: u8,
    pub pump_pct: u8,
    pub mode: u8,
}

/// A named speed profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedProfile {
    pub sensor: TempSensor,
    pub zero_rpm: bool,
    pub bands: Vec<SpeedBand>,
}

impl SpeedProfile {
    /// Find the unique band containing `temp` in `[temp_min, temp_max)`.
    pub fn band_for(&self, temp: f32) -> Option<(usize, &SpeedBand)> {
        self.bands
            .iter()
            .enumerate()
            .find(|(_, b)| temp >= b.temp_min && temp < b.temp_max)
    }
}

/// Ten-degree ladder from 10°C where each band's fan target equals its
/// lower bound and the pump rides ten points above, both clamped.
fn ladder(sensor: TempSensor, fan_offset: i16, pump_offset: i16) -> SpeedProfile {
    let mut bands = Vec::with_capacity(10);
    for step in 0..10u16 {
        let low = 10.0 + step as f32 * 10.0;
        let fan = (low as i16 + fan_offset).clamp(0, 100) as u8;
        let pump = (low as i16 + 10 + pump_offset).clamp(0, 100) as u8;
        bands.push(SpeedBand {
            temp_min: low,
            temp_max: low + 10.0,
            fan_pct: clamp_fan(fan),
            pump_pct: clamp_pump(pump),
            mode: 0,
        });
    }
    SpeedProfile {
        sensor,
        zero_rpm: false,
        bands,
    }
}

/// Built-in profile by name, if `name` is one.
pub fn builtin(name: &str) -> Option<SpeedProfile> {
    match name {
        "Normal" => Some(ladder(TempSensor::Cpu, 0, 0)),
        "Quiet" => Some({
            let mut p = ladder(TempSensor::Cpu, -15, -10);
            p.zero_rpm = true;
            p
        }),
        "Performance" => Some(ladder(TempSensor::Cpu, 15, 10)),
        _ => None,
    }
}

// =============================================================================
// Store
// =============================================================================

/// Disk store for speed profiles, one JSON file per name.
pub struct SpeedProfileStore {
    dir: PathBuf,
}

impl SpeedProfileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Create the directory and seed the built-in profiles that are missing.
    pub fn ensure_builtins(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| DeviceError::Storage(format!("Failed to create profile dir: {}", e)))?;
        for name in BUILTIN_PROFILES {
            let path = self.path_of(name);
            if !path.exists() {
                // builtin() covers every BUILTIN_PROFILES entry
                self.write(name, &builtin(name).unwrap())?;
            }
        }
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).exists()
    }

    pub fn load(&self, name: &str) -> Result<SpeedProfile> {
        let path = self.path_of(name);
        if !path.exists() {
            return Err(DeviceError::UnknownSpeedProfile(name.to_string()));
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| DeviceError::Storage(format!("Failed to read profile: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| DeviceError::Storage(format!("Failed to parse profile: {}", e)))
    }

    /// Load `name`, falling back to "Normal" when it is gone.
    pub fn load_or_fallback(&self, name: &str) -> SpeedProfile {
        self.load(name)
            .ok()
            .or_else(|| builtin(FALLBACK_PROFILE))
            .unwrap_or_else(|| SpeedProfile {
                sensor: TempSensor::Cpu,
                zero_rpm: false,
                bands: Vec::new(),
            })
    }

    pub fn save(&self, name: &str, profile: &SpeedProfile) -> Result<()> {
        validate_profile_name(name)?;
        if profile.bands.is_empty() {
            return Err(DeviceError::Validation(
                "Speed profile needs at least one band".into(),
            ));
        }
        self.write(name, profile)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        if BUILTIN_PROFILES.contains(&name) {
            return Err(DeviceError::Validation(format!(
                "Built-in profile '{}' cannot be deleted",
                name
            )));
        }
        if !self.exists(name) {
            return Err(DeviceError::UnknownSpeedProfile(name.to_string()));
        }
        std::fs::remove_file(self.path_of(name))
            .map_err(|e| DeviceError::Storage(format!("Failed to delete profile: {}", e)))?;
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").map(String::from)
            })
            .collect();
        names.sort();
        names
    }

    fn write(&self, name: &str, profile: &SpeedProfile) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| DeviceError::Storage(format!("Failed to create profile dir: {}", e)))?;
        let content = serde_json::to_string_pretty(profile)
            .map_err(|e| DeviceError::Storage(format!("Failed to serialize profile: {}", e)))?;
        std::fs::write(self.path_of(name), content)
            .map_err(|e| DeviceError::Storage(format!("Failed to write profile: {}", e)))?;
        Ok(())
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SpeedProfileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SpeedProfileStore::new(dir.path().join("temperatures"));
        store.ensure_builtins().unwrap();
        (dir, store)
    }

    #[test]
    fn test_builtins_seeded() {
        let (_dir, store) = store();
        for name in BUILTIN_PROFILES {
            assert!(store.exists(name), "{} missing", name);
        }
    }

    #[test]
    fn test_normal_band_six_covers_seventy() {
        let profile = builtin("Normal").unwrap();
        let (index, band) = profile.band_for(72.0).unwrap();
        assert_eq!(index, 6);
        assert_eq!(band.temp_min, 70.0);
        assert_eq!(band.temp_max, 80.0);
        assert_eq!(band.fan_pct, 70);
        assert_eq!(band.pump_pct, 80);
    }

    #[test]
    fn test_band_bounds_are_closed_open() {
        let profile = builtin("Normal").unwrap();
        assert_eq!(profile.band_for(70.0).unwrap().0, 6);
        assert_eq!(profile.band_for(79.9).unwrap().0, 6);
        assert_eq!(profile.band_for(80.0).unwrap().0, 7);
        assert!(profile.band_for(9.0).is_none());
        assert!(profile.band_for(200.0).is_none());
    }

    #[test]
    fn test_builtin_targets_respect_clamps() {
        for name in BUILTIN_PROFILES {
            let profile = builtin(name).unwrap();
            for band in &profile.bands {
                assert!(band.fan_pct >= 20 && band.fan_pct <= 100);
                assert!(band.pump_pct >= 50 && band.pump_pct <= 100);
            }
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = store();
        let profile = SpeedProfile {
            sensor: TempSensor::Liquid,
            zero_rpm: true,
            bands: vec![SpeedBand {
                temp_min: 25.0,
                temp_max: 40.0,
                fan_pct: 35,
                pump_pct: 60,
                mode: 0,
            }],
        };
        store.save("my-curve", &profile).unwrap();
        assert_eq!(store.load("my-curve").unwrap(), profile);
    }

    #[test]
    fn test_name_with_space_rejected() {
        let (_dir, store) = store();
        let profile = builtin("Normal").unwrap();
        let result = store.save("my curve", &profile);
        assert!(matches!(result, Err(DeviceError::Validation(_))));
    }

    #[test]
    fn test_builtin_delete_rejected() {
        let (_dir, store) = store();
        assert!(store.delete("Normal").is_err());
        assert!(store.exists("Normal"));
    }

    #[test]
    fn test_fallback_on_missing_profile() {
        let (_dir, store) = store();
        let profile = store.load_or_fallback("vanished");
        assert_eq!(profile, builtin("Normal").unwrap());
    }
}
