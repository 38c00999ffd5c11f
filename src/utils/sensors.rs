//! Host sensor access for the speed governor.
//!
//! Wraps `sysinfo` component temperatures. The CPU reading honors the
//! chip label configured in `config.json`; the GPU reading prefers NVIDIA
//! sensors, then AMD, and reports `None` when neither exists so the
//! governor can fall back to the CPU.

use std::sync::Mutex;

use sysinfo::Components;

use crate::cooling::TemperatureProbe;

/// Information about a detected sensor.
#[derive(Debug, Clone)]
pub struct SensorInfo {
    pub label: String,
    pub temperature: f32,
}

/// Wrapper for system sensor access.
pub struct SystemSensors {
    components: Components,
    preferred_chip: String,
}

impl SystemSensors {
    /// `preferred_chip` is matched against sensor labels first; empty
    /// means autodetect.
    pub fn new(preferred_chip: &str) -> Self {
        Self {
            components: Components::new_with_refreshed_list(),
            preferred_chip: preferred_chip.to_lowercase(),
        }
    }

    /// Refresh all sensor values.
    pub fn refresh(&mut self) {
        self.components.refresh(true);
    }

    /// Find the CPU package temperature.
    pub fn find_cpu_temp(&self) -> Option<f32> {
        if !self.preferred_chip.is_empty() {
            let preferred = self
                .components
                .iter()
                .find(|c| c.label().to_lowercase().contains(&self.preferred_chip))
                .and_then(|c| c.temperature());
            if preferred.is_some() {
                return preferred;
            }
        }
        self.components
            .iter()
            .find(|c| {
                let label = c.label().to_lowercase();
                label.contains("cpu")
                    || label.contains("package")
                    || label.contains("tctl")
                    || label.contains("tdie")
                    || label.contains("core")
            })
            .and_then(|c| c.temperature())
    }

    /// Find the GPU temperature, NVIDIA first, then AMD.
    pub fn find_gpu_temp(&self) -> Option<f32> {
        let by_label = |needle: &str| {
            self.components
                .iter()
                .find(|c| c.label().to_lowercase().contains(needle))
                .and_then(|c| c.temperature())
        };
        by_label("nvidia")
            .or_else(|| by_label("amdgpu"))
            .or_else(|| by_label("edge"))
            .or_else(|| by_label("gpu"))
    }

    /// All detected sensors, for diagnostics.
    pub fn list_all(&self) -> Vec<SensorInfo> {
        self.components
            .iter()
            .map(|c| SensorInfo {
                label: c.label().to_string(),
                temperature: c.temperature().unwrap_or(0.0),
            })
            .collect()
    }
}

/// Shared probe handed to every driver; refreshes on each read, which the
/// 1–3 s governor and telemetry cadences keep cheap.
pub struct HostSensors {
    inner: Mutex<SystemSensors>,
}

impl HostSensors {
    pub fn new(preferred_chip: &str) -> Self {
        Self {
            inner: Mutex::new(SystemSensors::new(preferred_chip)),
        }
    }
}

impl TemperatureProbe for HostSensors {
    fn cpu_temp(&self) -> Option<f32> {
        let mut sensors = self.inner.lock().unwrap();
        sensors.refresh();
        sensors.find_cpu_temp()
    }

    fn gpu_temp(&self) -> Option<f32> {
        let mut sensors = self.inner.lock().unwrap();
        sensors.refresh();
        sensors.find_gpu_temp()
    }
}
