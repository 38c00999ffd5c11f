//! Speed governor: turns temperature readings into speed writes.
//!
//! A per-driver ticker snapshots the speed-capable channels, resolves each
//! channel's profile and sensor, picks the matching band and emits one
//! combined speed program. Targets unchanged since the previous tick are
//! skipped.

use std::collections::HashMap;

use tracing::debug;

use crate::cooling::profiles::{SpeedProfileStore, TempSensor};
use crate::cooling::{clamp_fan, clamp_pump};

/// Temperature sources the governor can read.
///
/// Implemented over host sensors in production; tests supply fixed values.
pub trait TemperatureProbe: Send + Sync {
    fn cpu_temp(&self) -> Option<f32>;
    fn gpu_temp(&self) -> Option<f32>;
}

/// One speed-capable channel, snapshotted from the driver's sub-devices.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub channel_id: u8,
    pub contains_pump: bool,
    pub profile_name: String,
}

/// A resolved speed target for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedTarget {
    pub channel_id: u8,
    pub percent: u8,
}

/// A write is skipped when the same profile, band and targets were
/// already sent for the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheKey {
    profile: String,
    band: usize,
    fan: u8,
    pump: u8,
}

/// Per-driver governor state: the last written key per channel.
#[derive(Default)]
pub struct SpeedGovernor {
    cache: HashMap<u8, CacheKey>,
}

impl SpeedGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget cached targets so the next tick rewrites every channel.
    /// Called after resume and after manual speed writes.
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    /// Compute the targets that actually need writing this tick.
    ///
    /// `liquid_temp` is the device's own coolant reading for LIQUID
    /// profiles. Channels whose sensor has no reading are skipped.
    pub fn tick(
        &mut self,
        channels: &[ChannelSpec],
        store: &SpeedProfileStore,
        probe: &dyn TemperatureProbe,
        liquid_temp: Option<f32>,
    ) -> Vec<SpeedTarget> {
        let mut targets = Vec::new();

        for channel in channels {
            let profile = store.load_or_fallback(&channel.profile_name);

            let reading = match profile.sensor {
                TempSensor::Cpu => probe.cpu_temp(),
                // GPU misses fall back to the CPU reading.
                TempSensor::Gpu => probe.gpu_temp().or_else(|| probe.cpu_temp()),
                TempSensor::Liquid => liquid_temp,
            };
            let Some(reading) = reading else {
                continue;
            };

            let Some((band_index, band)) = profile.band_for(reading) else {
                // Below every band: zero-rpm profiles park the fans.
                if profile.zero_rpm
                    && !channel.contains_pump
                    && profile.bands.first().is_some_and(|b| reading < b.temp_min)
                {
                    targets.push(SpeedTarget {
                        channel_id: channel.channel_id,
                        percent: 0,
                    });
                }
                continue;
            };

            let fan = clamp_fan(band.fan_pct);
            let pump = clamp_pump(band.pump_pct);
            let percent = if channel.contains_pump { pump } else { fan };

            let key = CacheKey {
                profile: channel.profile_name.clone(),
                band: band_index,
                fan,
                pump,
            };
            if self.cache.get(&channel.channel_id) == Some(&key) {
                continue;
            }
            self.cache.insert(channel.channel_id, key);

            debug!(
                channel = channel.channel_id,
                reading, band = band_index, percent, "speed target"
            );
            targets.push(SpeedTarget {
                channel_id: channel.channel_id,
                percent,
            });
        }

        targets
    }
}

/// Build the family speed program: a count byte, then one
/// `{channel, mode, value_lo, value_hi}` tuple per target.
pub fn build_speed_payload(targets: &[SpeedTarget]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + targets.len() * 4);
    payload.push(targets.len() as u8);
    for target in targets {
        payload.extend_from_slice(&[target.channel_id, 0x00, target.percent, 0x00]);
    }
    payload
}
