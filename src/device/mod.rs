//! Device drivers and their common surface.
//!
//! Every device class implements [`Driver`]. Operations that do not apply
//! to a class return the `Unsupported` sentinel without side effects, so
//! callers can hit any driver with the full surface.

pub mod dongle;
pub mod hub;
pub mod lighting_node;
pub mod monitor;
pub mod mouse;
pub mod registry;

use std::sync::Arc;

use serde::Serialize;

use crate::cooling::{SpeedProfileStore, TemperatureProbe};
use crate::error::{DeviceError, Result};
use crate::lighting::RgbColor;
use crate::protocol::{DeviceClass, FirmwareVersion};
use crate::storage::{DpiStage, ProfileStore, RgbStore};

pub use monitor::DeviceMonitor;

/// Channel argument meaning "all applicable channels".
pub const ALL_CHANNELS: i16 = -1;

/// Lowest DPI stage value a mouse accepts; out-of-range stages clamp.
pub const DPI_MIN: u16 = 100;
/// Highest DPI stage value.
pub const DPI_MAX: u16 = 18000;

/// Longest accepted sleep timer, in minutes.
pub const SLEEP_MINUTES_MAX: u32 = 120;

// =============================================================================
// Sub-devices
// =============================================================================

/// One fan port, pump, temperature probe, LED strand or wireless child.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubDevice {
    pub channel_id: u8,
    pub name: String,
    pub description: String,
    pub led_channel_count: usize,
    pub contains_pump: bool,
    pub is_temperature_probe: bool,
    pub has_speed: bool,
    pub has_temps: bool,
    /// Last RPM reading.
    pub rpm: u16,
    /// Last temperature reading in °C, one decimal.
    pub temperature: f32,
    pub speed_profile_name: String,
    pub rgb_profile_name: String,
    pub user_label: String,
    /// Battery percentage for wireless children.
    pub battery_pct: Option<u8>,
}

/// Direction of a DPI stage change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpiChange {
    Up,
    Down,
    Cycle,
}

// =============================================================================
// Shared driver context
// =============================================================================

/// Stores and host probes shared by every driver.
pub struct DeviceContext {
    pub profiles: ProfileStore,
    pub rgb: RgbStore,
    pub speeds: SpeedProfileStore,
    pub probe: Arc<dyn TemperatureProbe>,
}

// =============================================================================
// Driver contract
// =============================================================================

/// The common driver surface.
///
/// A driver is either `active` (software mode, control loops running) or
/// `stopped` (hardware mode, no loops); `stop` and `connect` are the only
/// transitions. Default implementations return the `Unsupported` sentinel.
pub trait Driver: Send + Sync {
    fn class(&self) -> DeviceClass;

    fn serial(&self) -> String;

    fn product_name(&self) -> String {
        self.class().name().to_string()
    }

    fn firmware(&self) -> Option<FirmwareVersion> {
        None
    }

    /// Current sub-device rows, profile names and labels merged in.
    fn sub_devices(&self) -> Vec<SubDevice> {
        Vec::new()
    }

    /// Idempotent teardown: cancel loops, restore hardware mode, release
    /// the handle. Returns after the hardware-mode command is acknowledged
    /// or a fatal I/O error occurred.
    fn stop(&self) -> Result<()>;

    /// Best-effort teardown for a host going down hard: mark state and
    /// release handles without touching device mode.
    fn stop_dirty(&self);

    fn update_speed_profile(&self, _channel: i16, _profile: &str) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    fn update_rgb_profile(&self, _channel: i16, _profile: &str) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    /// Replace every channel referring to `deleted` with "Normal".
    fn reset_speed_profiles(&self, _deleted: &str) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    fn update_manual_speed(&self, _channel: i16, _value: u8) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    fn change_device_brightness(&self, _slider: u8) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    /// Stepped brightness: mode 0..=3 maps onto the slider.
    fn change_device_brightness_mode(&self, _mode: u8) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    fn save_user_profile(&self, _name: &str) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    fn change_device_profile(&self, _name: &str) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    fn update_device_label(&self, _channel: i16, _label: &str) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    /// Rebuild the external strand layout of hubs that carry one.
    fn update_external_hub(&self, _hub_type: u8, _count: u8) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    fn save_mouse_dpi(&self, _stages: Vec<DpiStage>) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    fn save_mouse_dpi_colors(
        &self,
        _indicator: RgbColor,
        _stage_colors: Vec<RgbColor>,
    ) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    fn modify_dpi(&self, _change: DpiChange) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    fn update_sleep_timer(&self, _minutes: u32) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    fn get_sleep_mode(&self) -> Result<u32> {
        Err(DeviceError::Unsupported)
    }

    /// Dongles: register a constructed child driver under its product id.
    fn add_paired_device(&self, _product_id: u16, _driver: Arc<dyn Driver>) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    /// Link state of wireless children; wired devices are always up.
    fn is_connected(&self) -> bool {
        true
    }

    /// Wireless children: flip the link state without touching the radio.
    fn set_connected(&self, _connected: bool) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    /// Wireless children: run the post-link initialization sequence.
    fn connect(&self) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    /// Wireless children: battery report pushed by the dongle listener.
    fn modify_battery_level(&self, _pct: u8) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    /// Headsets: mute toggle pushed by the dongle listener.
    fn notify_mute_changed(&self, _muted: bool) -> Result<()> {
        Err(DeviceError::Unsupported)
    }

    /// Wireless children: re-push the persisted sleep timer.
    fn refresh_sleep_timer(&self) -> Result<()> {
        Err(DeviceError::Unsupported)
    }
}

// =============================================================================
// Background tasks
// =============================================================================

/// A ticker thread plus its single-shot exit channel.
pub(crate) struct TaskHandle {
    exit: std::sync::mpsc::Sender<()>,
    join: std::thread::JoinHandle<()>,
}

impl TaskHandle {
    /// Signal the task and wait until the exit is observed.
    pub(crate) fn stop(self) {
        let _ = self.exit.send(());
        let _ = self.join.join();
    }
}

/// Spawn a named ticker that runs `body` every `interval` until its exit
/// channel fires. The channel doubles as the timer, so cancellation is
/// observed without waiting out the tick.
pub(crate) fn spawn_ticker<F>(
    name: &str,
    interval: std::time::Duration,
    body: F,
) -> std::io::Result<TaskHandle>
where
    F: Fn() + Send + 'static,
{
    let (exit, rx) = std::sync::mpsc::channel();
    let join = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => body(),
                Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        })?;
    Ok(TaskHandle { exit, join })
}

/// Map a stepped brightness mode to the slider value.
pub fn brightness_for_mode(mode: u8) -> Result<u8> {
    match mode {
        0 => Ok(0),
        1 => Ok(33),
        2 => Ok(66),
        3 => Ok(100),
        _ => Err(DeviceError::Validation(format!(
            "Brightness mode {} out of 0..=3",
            mode
        ))),
    }
}

/// Validate a brightness slider value.
pub fn validate_brightness(slider: u8) -> Result<u8> {
    if slider > 100 {
        return Err(DeviceError::Validation(format!(
            "Brightness {} out of 0..=100",
            slider
        )));
    }
    Ok(slider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brightness_validation() {
        assert_eq!(validate_brightness(100).unwrap(), 100);
        assert_eq!(validate_brightness(0).unwrap(), 0);
        assert!(validate_brightness(101).is_err());
    }

    #[test]
    fn test_brightness_modes() {
        assert_eq!(brightness_for_mode(0).unwrap(), 0);
        assert_eq!(brightness_for_mode(3).unwrap(), 100);
        assert!(brightness_for_mode(4).is_err());
    }
}
