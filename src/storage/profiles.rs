//! Device profile and RGB profile persistence.
//!
//! One active profile per serial, any number of named inactive copies, and
//! one RGB profile set per LED-bearing serial. Files are pretty-printed
//! JSON so users can inspect and hand-edit them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};
use crate::lighting::patterns::{RgbColor, RgbProfile};
use crate::storage::validate_profile_name;

/// RGB profile names seeded for every device.
pub const DEFAULT_RGB_PROFILES: [&str; 6] = [
    "off",
    "static",
    "rainbow",
    "colorshift",
    "colorpulse",
    "liquid-temperature",
];

// =============================================================================
// Device profile
// =============================================================================

/// One DPI stage of a mouse profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpiStage {
    pub name: String,
    pub dpi_value: u16,
    pub stage_color: RgbColor,
}

/// Per-device persisted state, keyed by serial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub product: String,
    pub serial: String,
    /// True only on the `<serial>.json` copy.
    pub active: bool,
    /// Device brightness slider, 0..=100.
    pub brightness: u8,
    /// `channel_id -> speed profile name`.
    pub speed_profiles: BTreeMap<u8, String>,
    /// `channel_id -> rgb profile name`.
    pub rgb_profiles: BTreeMap<u8, String>,
    /// `channel_id -> user label`.
    pub labels: BTreeMap<u8, String>,
    /// External LED hub accessory type, for hubs that have one.
    pub external_hub_type: u8,
    /// Number of attached external strands.
    pub external_hub_count: u8,
    /// Mouse DPI stages.
    pub dpi_stages: Vec<DpiStage>,
    /// Index of the active DPI stage.
    pub dpi_stage_index: usize,
    /// Color of the DPI indicator itself.
    pub dpi_indicator_color: RgbColor,
    /// Wireless idle sleep timer in minutes.
    pub sleep_minutes: u32,
    /// Hardware-mode lighting pattern installed on stop.
    pub hardware_mode: u8,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            product: String::new(),
            serial: String::new(),
            active: true,
            brightness: 100,
            speed_profiles: BTreeMap::new(),
            rgb_profiles: BTreeMap::new(),
            labels: BTreeMap::new(),
            external_hub_type: 0,
            external_hub_count: 0,
            dpi_stages: vec![
                DpiStage {
                    name: "Precision".into(),
                    dpi_value: 800,
                    stage_color: RgbColor::new(255, 0, 0),
                },
                DpiStage {
                    name: "Default".into(),
                    dpi_value: 1200,
                    stage_color: RgbColor::new(0, 255, 0),
                },
                DpiStage {
                    name: "Fast".into(),
                    dpi_value: 1600,
                    stage_color: RgbColor::new(0, 0, 255),
                },
            ],
            dpi_stage_index: 1,
            dpi_indicator_color: RgbColor::new(255, 255, 255),
            sleep_minutes: 15,
            hardware_mode: 0,
        }
    }
}

// =============================================================================
// Profile store
// =============================================================================

/// Disk store for device profiles.
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Load the active profile for `serial`, creating a default one on
    /// first run.
    pub fn load_or_create(&self, serial: &str, product: &str) -> Result<DeviceProfile> {
        let path = self.active_path(serial);
        if path.exists() {
            return self.read(&path);
        }
        let profile = DeviceProfile {
            product: product.to_string(),
            serial: serial.to_string(),
            ..Default::default()
        };
        self.save_active(&profile)?;
        Ok(profile)
    }

    /// Persist the active profile to `<serial>.json`.
    pub fn save_active(&self, profile: &DeviceProfile) -> Result<()> {
        let mut copy = profile.clone();
        copy.active = true;
        self.write(&self.active_path(&copy.serial), &copy)
    }

    /// Save a named inactive copy to `<serial>-<name>.json`.
    pub fn save_named(&self, profile: &DeviceProfile, name: &str) -> Result<()> {
        validate_profile_name(name)?;
        let mut copy = profile.clone();
        copy.active = false;
        self.write(&self.named_path(&copy.serial, name), &copy)
    }

    pub fn load_named(&self, serial: &str, name: &str) -> Result<DeviceProfile> {
        validate_profile_name(name)?;
        let path = self.named_path(serial, name);
        if !path.exists() {
            return Err(DeviceError::Storage(format!(
                "Profile '{}' not found for {}",
                name, serial
            )));
        }
        self.read(&path)
    }

    /// Promote the named copy to the active profile and return it.
    pub fn activate_named(&self, serial: &str, name: &str) -> Result<DeviceProfile> {
        let mut profile = self.load_named(serial, name)?;
        profile.active = true;
        self.save_active(&profile)?;
        Ok(profile)
    }

    /// Names of the inactive profiles stored for `serial`.
    pub fn list_named(&self, serial: &str) -> Vec<String> {
        let prefix = format!("{}-", serial);
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| {
                let file = entry.file_name().to_string_lossy().into_owned();
                file.strip_suffix(".json")
                    .and_then(|stem| stem.strip_prefix(&prefix))
                    .map(String::from)
            })
            .collect();
        names.sort();
        names
    }

    fn active_path(&self, serial: &str) -> PathBuf {
        self.dir.join(format!("{}.json", serial))
    }

    fn named_path(&self, serial: &str, name: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.json", serial, name))
    }

    fn read(&self, path: &PathBuf) -> Result<DeviceProfile> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DeviceError::Storage(format!("Failed to read profile: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| DeviceError::Storage(format!("Failed to parse profile: {}", e)))
    }

    fn write(&self, path: &PathBuf, profile: &DeviceProfile) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| DeviceError::Storage(format!("Failed to create profile dir: {}", e)))?;
        let content = serde_json::to_string_pretty(profile)
            .map_err(|e| DeviceError::Storage(format!("Failed to serialize profile: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| DeviceError::Storage(format!("Failed to write profile: {}", e)))?;
        Ok(())
    }
}

// =============================================================================
// RGB profile store
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RgbProfileSet {
    profiles: BTreeMap<String, RgbProfile>,
}

/// Disk store for RGB profile sets, one file per serial.
pub struct RgbStore {
    dir: PathBuf,
}

impl RgbStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Seed the default profile set for `serial` if none exists yet.
    pub fn ensure_defaults(&self, serial: &str) -> Result<()> {
        let path = self.path_of(serial);
        if path.exists() {
            return Ok(());
        }
        let mut set = RgbProfileSet::default();
        for name in DEFAULT_RGB_PROFILES {
            set.profiles.insert(name.to_string(), default_profile(name));
        }
        self.write(serial, &set)
    }

    pub fn exists(&self, serial: &str, name: &str) -> bool {
        self.load_set(serial)
            .map(|set| set.profiles.contains_key(name))
            .unwrap_or(false)
    }

    pub fn get(&self, serial: &str, name: &str) -> Result<RgbProfile> {
        let set = self.load_set(serial)?;
        set.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownRgbProfile(name.to_string()))
    }

    pub fn save(&self, serial: &str, name: &str, profile: &RgbProfile) -> Result<()> {
        validate_profile_name(name)?;
        if !(0.1..=10.0).contains(&profile.speed) {
            return Err(DeviceError::Validation(
                "RGB profile speed must be within 0.1..=10".into(),
            ));
        }
        if !(1..=100).contains(&profile.smoothness) {
            return Err(DeviceError::Validation(
                "RGB profile smoothness must be within 1..=100".into(),
            ));
        }
        let mut set = self.load_set(serial).unwrap_or_default();
        set.profiles.insert(name.to_string(), profile.clone());
        self.write(serial, &set)
    }

    pub fn list(&self, serial: &str) -> Vec<String> {
        self.load_set(serial)
            .map(|set| set.profiles.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn load_set(&self, serial: &str) -> Result<RgbProfileSet> {
        let path = self.path_of(serial);
        if !path.exists() {
            return Err(DeviceError::Storage(format!(
                "No RGB profiles stored for {}",
                serial
            )));
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| DeviceError::Storage(format!("Failed to read RGB profiles: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| DeviceError::Storage(format!("Failed to parse RGB profiles: {}", e)))
    }

    fn write(&self, serial: &str, set: &RgbProfileSet) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| DeviceError::Storage(format!("Failed to create RGB dir: {}", e)))?;
        let content = serde_json::to_string_pretty(set)
            .map_err(|e| DeviceError::Storage(format!("Failed to serialize RGB profiles: {}", e)))?;
        std::fs::write(self.path_of(serial), content)
            .map_err(|e| DeviceError::Storage(format!("Failed to write RGB profiles: {}", e)))?;
        Ok(())
    }

    fn path_of(&self, serial: &str) -> PathBuf {
        self.dir.join(format!("{}.json", serial))
    }
}

fn default_profile(name: &str) -> RgbProfile {
    match name {
        "static" => RgbProfile {
            start_color: RgbColor::new(0, 170, 255),
            end_color: RgbColor::new(0, 170, 255),
            ..Default::default()
        },
        "liquid-temperature" => RgbProfile {
            start_color: RgbColor::new(0, 255, 40),
            end_color: RgbColor::new(255, 20, 0),
            min_temp: 25.0,
            max_temp: 55.0,
            ..Default::default()
        },
        _ => RgbProfile::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_store() -> (tempfile::TempDir, ProfileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("profiles"));
        (dir, store)
    }

    #[test]
    fn test_first_run_creates_default() {
        let (_dir, store) = profile_store();
        let profile = store.load_or_create("ABC123", "Commander Core").unwrap();
        assert_eq!(profile.serial, "ABC123");
        assert_eq!(profile.product, "Commander Core");
        assert!(profile.active);
        assert_eq!(profile.brightness, 100);

        // Second load reads the persisted copy.
        let again = store.load_or_create("ABC123", "Commander Core").unwrap();
        assert_eq!(again, profile);
    }

    #[test]
    fn test_profile_roundtrip_is_equal() {
        let (_dir, store) = profile_store();
        let mut profile = store.load_or_create("XYZ", "iCUE Link System Hub").unwrap();
        profile.brightness = 40;
        profile.speed_profiles.insert(1, "Quiet".into());
        profile.rgb_profiles.insert(1, "rainbow".into());
        profile.labels.insert(1, "Front intake".into());
        store.save_active(&profile).unwrap();

        let loaded = store.load_or_create("XYZ", "iCUE Link System Hub").unwrap();
        assert_eq!(loaded, profile);
    }

    #[test]
    fn test_named_profiles_stay_inactive() {
        let (_dir, store) = profile_store();
        let profile = store.load_or_create("SER", "Katar Pro").unwrap();
        store.save_named(&profile, "travel").unwrap();

        let named = store.load_named("SER", "travel").unwrap();
        assert!(!named.active);
        assert_eq!(store.list_named("SER"), vec!["travel".to_string()]);

        let activated = store.activate_named("SER", "travel").unwrap();
        assert!(activated.active);
        // The named copy on disk is still inactive.
        assert!(!store.load_named("SER", "travel").unwrap().active);
    }

    #[test]
    fn test_named_profile_name_validated() {
        let (_dir, store) = profile_store();
        let profile = store.load_or_create("SER", "Katar Pro").unwrap();
        assert!(store.save_named(&profile, "../escape").is_err());
        assert!(store.save_named(&profile, "has space").is_err());
    }

    #[test]
    fn test_rgb_defaults_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = RgbStore::new(dir.path().join("rgb"));
        store.ensure_defaults("SER").unwrap();

        for name in DEFAULT_RGB_PROFILES {
            assert!(store.exists("SER", name), "{} missing", name);
        }
        assert!(matches!(
            store.get("SER", "no-such"),
            Err(DeviceError::UnknownRgbProfile(_))
        ));
    }

    #[test]
    fn test_rgb_save_validates_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let store = RgbStore::new(dir.path().join("rgb"));
        store.ensure_defaults("SER").unwrap();

        let mut profile = RgbProfile::default();
        profile.speed = 20.0;
        assert!(store.save("SER", "fast", &profile).is_err());

        profile.speed = 5.0;
        profile.smoothness = 0;
        assert!(store.save("SER", "fast", &profile).is_err());

        profile.smoothness = 10;
        store.save("SER", "fast", &profile).unwrap();
        assert_eq!(store.get("SER", "fast").unwrap(), profile);
    }
}
