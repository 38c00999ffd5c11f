//! Cooling hub drivers: iCUE Link System Hub, Commander Core and
//! Commander Core XT.
//!
//! One `HubDriver` owns the HID handle, the device profile, the sub-device
//! table and four background tasks: telemetry, speed governor, lighting
//! render and (where the class defines resume bytes) the resume watcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cooling::{
    build_speed_payload, clamp_fan, clamp_pump, ChannelSpec, SpeedGovernor, SpeedTarget,
    FALLBACK_PROFILE,
};
use crate::device::{
    brightness_for_mode, spawn_ticker, validate_brightness, DeviceContext, DeviceMonitor, Driver,
    SubDevice, TaskHandle, ALL_CHANNELS,
};
use crate::error::{DeviceError, Result};
use crate::lighting::{ChannelPlan, FrameSink, RenderEngine, RenderPlan};
use crate::protocol::commands::{
    DT_FANS, DT_LED_CONFIG, DT_SET_SPEED, DT_SPEEDS, DT_TEMPERATURES, EP_FANS, EP_LED_CONFIG,
    EP_SET_SPEED, EP_SPEEDS, EP_TEMPERATURES, SPEED_STATUS_BUSY,
};
use crate::protocol::{
    DeviceClass, EndpointIo, FirmwareVersion, Transport, MODE_HARDWARE, MODE_SOFTWARE,
};
use crate::storage::DeviceProfile;

/// Channel id of the pump sub-device on AIO-bearing classes.
const PUMP_CHANNEL: u8 = 0;

/// First fan channel id; channel 0 stays reserved for the pump.
const FIRST_FAN_CHANNEL: u8 = 1;

/// LED count of the pump head ring.
const PUMP_LED_COUNT: usize = 16;

/// Retry budget for speed writes on classes that echo a status byte.
const SPEED_RETRY_MAX: u32 = 20;
const SPEED_RETRY_DELAY: Duration = Duration::from_millis(100);

// =============================================================================
// Wire decoding
// =============================================================================

/// Decode a fan/port presence table: `[count, state...]`.
pub(crate) fn decode_presence(payload: &[u8]) -> Vec<bool> {
    let Some((&count, states)) = payload.split_first() else {
        return Vec::new();
    };
    states
        .iter()
        .take(count as usize)
        .map(|&state| state != 0)
        .collect()
}

/// Decode LED channel counts: `[count, (lo, hi)...]`.
pub(crate) fn decode_led_counts(payload: &[u8]) -> Vec<usize> {
    let Some((&count, rest)) = payload.split_first() else {
        return Vec::new();
    };
    rest.chunks_exact(2)
        .take(count as usize)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]) as usize)
        .collect()
}

/// Decode per-channel RPMs: `[count, (lo, hi)...]`.
pub(crate) fn decode_rpms(payload: &[u8]) -> Vec<u16> {
    let Some((&count, rest)) = payload.split_first() else {
        return Vec::new();
    };
    rest.chunks_exact(2)
        .take(count as usize)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Decode temperature entries: `[count, (status, lo, hi)...]`.
/// A non-zero status marks a disconnected probe and yields `None`.
pub(crate) fn decode_temps(payload: &[u8]) -> Vec<Option<f32>> {
    let Some((&count, rest)) = payload.split_first() else {
        return Vec::new();
    };
    rest.chunks_exact(3)
        .take(count as usize)
        .map(|entry| {
            if entry[0] != 0 {
                return None;
            }
            Some(i16::from_le_bytes([entry[1], entry[2]]) as f32 / 10.0)
        })
        .collect()
}

// =============================================================================
// Frame sink
// =============================================================================

struct HubSink {
    io: Arc<EndpointIo>,
    liquid: Arc<Mutex<Option<f32>>>,
}

impl FrameSink for HubSink {
    fn write_frame(&self, frame: &[u8]) -> Result<()> {
        self.io.write_color(frame)
    }

    fn temperature(&self) -> Option<f32> {
        *self.liquid.lock().unwrap()
    }
}

// =============================================================================
// Driver
// =============================================================================

struct HubInner {
    class: DeviceClass,
    serial: String,
    io: Arc<EndpointIo>,
    ctx: Arc<DeviceContext>,
    firmware: FirmwareVersion,
    profile: Mutex<DeviceProfile>,
    subs: Mutex<Vec<SubDevice>>,
    engine: RenderEngine,
    monitor: DeviceMonitor,
    governor: Mutex<SpeedGovernor>,
    liquid: Arc<Mutex<Option<f32>>>,
    running: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<TaskHandle>>,
    watcher: Mutex<Option<std::thread::JoinHandle<()>>>,
    /// External-request lock; acquired before the profile lock.
    request: Mutex<()>,
}

/// Driver for the cooling hub classes.
pub struct HubDriver {
    inner: Arc<HubInner>,
}

impl HubDriver {
    pub fn link_system_hub(
        serial: &str,
        transport: Arc<Transport>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        Self::open(DeviceClass::LinkSystemHub, serial, transport, ctx)
    }

    pub fn commander_core(
        serial: &str,
        transport: Arc<Transport>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        Self::open(DeviceClass::CommanderCore, serial, transport, ctx)
    }

    pub fn commander_core_xt(
        serial: &str,
        transport: Arc<Transport>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        Self::open(DeviceClass::CommanderCoreXt, serial, transport, ctx)
    }

    /// Negotiate software mode, enumerate sub-devices, load the profile and
    /// start the control loops.
    pub fn open(
        class: DeviceClass,
        serial: &str,
        transport: Arc<Transport>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        let io = Arc::new(EndpointIo::new(transport));

        io.set_mode(MODE_SOFTWARE)?;
        let firmware = io.get_firmware()?;
        info!(device = class.name(), serial, firmware = %firmware, "hub initialized");

        let subs = enumerate_sub_devices(class, &io)?;

        let mut profile = ctx.profiles.load_or_create(serial, class.name())?;
        reconcile_profile(&mut profile, &subs);
        ctx.profiles.save_active(&profile)?;
        ctx.rgb.ensure_defaults(serial)?;

        io.init_color_endpoint()?;

        let inner = Arc::new(HubInner {
            class,
            serial: serial.to_string(),
            io,
            ctx,
            firmware,
            profile: Mutex::new(profile),
            subs: Mutex::new(subs),
            engine: RenderEngine::new(),
            monitor: DeviceMonitor::new(),
            governor: Mutex::new(SpeedGovernor::new()),
            liquid: Arc::new(Mutex::new(None)),
            running: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
            request: Mutex::new(()),
        });

        inner.restart_render()?;
        inner.spawn_tasks()?;

        Ok(Self { inner })
    }
}

fn enumerate_sub_devices(class: DeviceClass, io: &EndpointIo) -> Result<Vec<SubDevice>> {
    let mut subs = Vec::new();
    let at = io.payload_offset();

    let fans = io.framed_read(EP_FANS, DT_FANS, None)?;
    let presence = decode_presence(&fans[at..]);

    let leds = io.framed_read(EP_LED_CONFIG, DT_LED_CONFIG, None)?;
    let led_counts = decode_led_counts(&leds[at..]);

    for (index, connected) in presence.iter().enumerate() {
        if !connected {
            continue;
        }
        let channel = FIRST_FAN_CHANNEL + index as u8;
        subs.push(SubDevice {
            channel_id: channel,
            name: format!("Fan {}", index + 1),
            description: "Fan port".to_string(),
            led_channel_count: led_counts.get(index).copied().unwrap_or(0),
            has_speed: true,
            ..Default::default()
        });
    }

    // The pump renders after the external fan rings.
    if class.has_liquid() {
        subs.push(SubDevice {
            channel_id: PUMP_CHANNEL,
            name: "AIO Pump".to_string(),
            description: "AIO pump and coolant probe".to_string(),
            led_channel_count: PUMP_LED_COUNT,
            contains_pump: true,
            is_temperature_probe: true,
            has_speed: true,
            has_temps: true,
            ..Default::default()
        });
    }

    debug!(count = subs.len(), "sub-devices enumerated");
    Ok(subs)
}

/// Make the profile maps cover every current channel; invariant 3 keeps
/// each reference valid or "Normal".
fn reconcile_profile(profile: &mut DeviceProfile, subs: &[SubDevice]) {
    for sub in subs {
        if sub.has_speed {
            profile
                .speed_profiles
                .entry(sub.channel_id)
                .or_insert_with(|| FALLBACK_PROFILE.to_string());
        }
        if sub.led_channel_count > 0 {
            profile
                .rgb_profiles
                .entry(sub.channel_id)
                .or_insert_with(|| "static".to_string());
        }
    }
}

impl HubInner {
    fn spawn_tasks(self: &Arc<Self>) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();

        let telemetry = Arc::clone(self);
        tasks.push(spawn_ticker(
            "hub-telemetry",
            Duration::from_millis(self.class.telemetry_interval_ms()),
            move || telemetry.telemetry_tick(),
        )?);

        let governor = Arc::clone(self);
        tasks.push(spawn_ticker(
            "hub-governor",
            Duration::from_millis(self.class.governor_interval_ms()),
            move || governor.governor_tick(),
        )?);

        if let Some((first, second)) = self.class.resume_steps() {
            let watcher = Arc::clone(self);
            let join = std::thread::Builder::new()
                .name("hub-resume".to_string())
                .spawn(move || watcher.resume_loop(first, second))?;
            *self.watcher.lock().unwrap() = Some(join);
        }

        Ok(())
    }

    fn telemetry_tick(&self) {
        match self.io.get_mode() {
            Ok(mode) => self.monitor.publish(mode),
            Err(e) => warn!(error = %e, "device mode read failed"),
        }

        let at = self.io.payload_offset();

        match self.io.framed_read(EP_SPEEDS, DT_SPEEDS, None) {
            Ok(response) => {
                let rpms = decode_rpms(&response[at..]);
                let mut subs = self.subs.lock().unwrap();
                for (reading, sub) in rpms.iter().zip(subs.iter_mut().filter(|s| s.has_speed)) {
                    sub.rpm = *reading;
                }
            }
            Err(e) => warn!(error = %e, "speed telemetry dropped"),
        }

        match self.io.framed_read(EP_TEMPERATURES, DT_TEMPERATURES, None) {
            Ok(response) => {
                let temps = decode_temps(&response[at..]);
                let mut subs = self.subs.lock().unwrap();
                let mut liquid = None;
                for (reading, sub) in temps.iter().zip(subs.iter_mut().filter(|s| s.has_temps)) {
                    if let Some(value) = reading {
                        sub.temperature = *value;
                        if sub.contains_pump {
                            liquid = Some(*value);
                        }
                    }
                }
                if liquid.is_some() {
                    *self.liquid.lock().unwrap() = liquid;
                }
            }
            Err(e) => warn!(error = %e, "temperature telemetry dropped"),
        }
    }

    fn governor_tick(&self) {
        let channels: Vec<ChannelSpec> = {
            let profile = self.profile.lock().unwrap();
            let subs = self.subs.lock().unwrap();
            subs.iter()
                .filter(|sub| sub.has_speed)
                .map(|sub| ChannelSpec {
                    channel_id: sub.channel_id,
                    contains_pump: sub.contains_pump,
                    profile_name: profile
                        .speed_profiles
                        .get(&sub.channel_id)
                        .cloned()
                        .unwrap_or_else(|| FALLBACK_PROFILE.to_string()),
                })
                .collect()
        };

        let liquid = *self.liquid.lock().unwrap();
        let targets = self.governor.lock().unwrap().tick(
            &channels,
            &self.ctx.speeds,
            &*self.ctx.probe,
            liquid,
        );
        if targets.is_empty() {
            return;
        }
        if let Err(e) = self.write_speed_program(&targets) {
            warn!(error = %e, "speed write dropped");
        }
    }

    fn write_speed_program(&self, targets: &[SpeedTarget]) -> Result<()> {
        let payload = build_speed_payload(targets);
        for _ in 0..SPEED_RETRY_MAX {
            let response = self.io.framed_write(EP_SET_SPEED, DT_SET_SPEED, &payload)?;
            if !self.class.echoes_speed_writes() {
                return Ok(());
            }
            if response[self.io.payload_offset()] != SPEED_STATUS_BUSY {
                return Ok(());
            }
            std::thread::sleep(SPEED_RETRY_DELAY);
        }
        warn!("speed program rejected after retries; dropping tick");
        Ok(())
    }

    fn resume_loop(self: Arc<Self>, first: u8, second: u8) {
        while self.running.load(Ordering::SeqCst) {
            if !self.monitor.wait_for_flip(first, second, &self.running) {
                break;
            }
            info!(device = self.class.name(), "resume from sleep detected");
            self.engine.halt();
            let reinit = self
                .io
                .set_mode(MODE_SOFTWARE)
                .and_then(|_| self.io.init_color_endpoint())
                .and_then(|_| self.restart_render());
            if let Err(e) = reinit {
                warn!(error = %e, "resume re-initialization failed");
            }
            self.governor.lock().unwrap().invalidate();
        }
    }

    /// Snapshot the render plan and atomically restart the render task.
    fn restart_render(&self) -> Result<()> {
        let plan = {
            let profile = self.profile.lock().unwrap();
            let subs = self.subs.lock().unwrap();
            let channels = subs
                .iter()
                .filter(|sub| sub.led_channel_count > 0)
                .map(|sub| {
                    let name = profile
                        .rgb_profiles
                        .get(&sub.channel_id)
                        .cloned()
                        .unwrap_or_else(|| "static".to_string());
                    let rgb = self
                        .ctx
                        .rgb
                        .get(&self.serial, &name)
                        .unwrap_or_default();
                    ChannelPlan {
                        channel_id: sub.channel_id,
                        led_count: sub.led_channel_count,
                        profile_name: name,
                        profile: rgb,
                    }
                })
                .collect();
            RenderPlan {
                channels,
                brightness: profile.brightness,
                interval: Duration::from_millis(self.class.render_interval_ms()),
            }
        };

        let sink = Arc::new(HubSink {
            io: Arc::clone(&self.io),
            liquid: Arc::clone(&self.liquid),
        });
        self.engine.restart(plan, sink)
    }

    fn led_total(&self) -> usize {
        self.subs
            .lock()
            .unwrap()
            .iter()
            .map(|sub| sub.led_channel_count)
            .sum()
    }

    /// Resolve a channel argument to concrete sub-device ids.
    fn resolve_channels(&self, channel: i16, want_speed: bool) -> Result<Vec<u8>> {
        let subs = self.subs.lock().unwrap();
        let eligible = |sub: &SubDevice| {
            if want_speed {
                sub.has_speed
            } else {
                sub.led_channel_count > 0
            }
        };
        if channel == ALL_CHANNELS {
            return Ok(subs.iter().filter(|s| eligible(s)).map(|s| s.channel_id).collect());
        }
        let id = u8::try_from(channel)
            .map_err(|_| DeviceError::Validation(format!("Bad channel {}", channel)))?;
        if !subs.iter().any(|s| s.channel_id == id && eligible(s)) {
            return Err(DeviceError::Validation(format!(
                "Channel {} does not exist on this device",
                id
            )));
        }
        Ok(vec![id])
    }
}

impl Driver for HubDriver {
    fn class(&self) -> DeviceClass {
        self.inner.class
    }

    fn serial(&self) -> String {
        self.inner.serial.clone()
    }

    fn firmware(&self) -> Option<FirmwareVersion> {
        Some(self.inner.firmware)
    }

    fn sub_devices(&self) -> Vec<SubDevice> {
        let profile = self.inner.profile.lock().unwrap();
        let subs = self.inner.subs.lock().unwrap();
        subs.iter()
            .map(|sub| {
                let mut row = sub.clone();
                row.speed_profile_name = profile
                    .speed_profiles
                    .get(&sub.channel_id)
                    .cloned()
                    .unwrap_or_default();
                row.rgb_profile_name = profile
                    .rgb_profiles
                    .get(&sub.channel_id)
                    .cloned()
                    .unwrap_or_default();
                row.user_label = profile
                    .labels
                    .get(&sub.channel_id)
                    .cloned()
                    .unwrap_or_default();
                row
            })
            .collect()
    }

    fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.running.store(false, Ordering::SeqCst);
        for task in inner.tasks.lock().unwrap().drain(..) {
            task.stop();
        }
        if let Some(watcher) = inner.watcher.lock().unwrap().take() {
            let _ = watcher.join();
        }

        let sink = HubSink {
            io: Arc::clone(&inner.io),
            liquid: Arc::clone(&inner.liquid),
        };
        inner.engine.shutdown(&sink, inner.led_total());

        inner.io.set_mode(MODE_HARDWARE)?;
        info!(device = inner.class.name(), serial = %inner.serial, "hub stopped");
        Ok(())
    }

    fn stop_dirty(&self) {
        let inner = &self.inner;
        inner.stopped.store(true, Ordering::SeqCst);
        inner.running.store(false, Ordering::SeqCst);
        for task in inner.tasks.lock().unwrap().drain(..) {
            task.stop();
        }
        if let Some(watcher) = inner.watcher.lock().unwrap().take() {
            let _ = watcher.join();
        }
        inner.engine.halt();
    }

    fn update_speed_profile(&self, channel: i16, name: &str) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        if name != FALLBACK_PROFILE && !inner.ctx.speeds.exists(name) {
            return Err(DeviceError::UnknownSpeedProfile(name.to_string()));
        }
        let channels = inner.resolve_channels(channel, true)?;
        let mut profile = inner.profile.lock().unwrap();
        for id in channels {
            profile.speed_profiles.insert(id, name.to_string());
        }
        // Persist under the profile lock; takes effect next governor tick.
        inner.ctx.profiles.save_active(&profile)?;
        Ok(())
    }

    fn update_rgb_profile(&self, channel: i16, name: &str) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        inner.ctx.rgb.get(&inner.serial, name)?;
        if name == "liquid-temperature" && !inner.class.has_liquid() {
            return Err(DeviceError::LiquidWithoutPump);
        }
        let channels = inner.resolve_channels(channel, false)?;
        {
            let mut profile = inner.profile.lock().unwrap();
            let unchanged = channels
                .iter()
                .all(|id| profile.rgb_profiles.get(id).map(String::as_str) == Some(name));
            if unchanged {
                return Ok(());
            }
            for id in &channels {
                profile.rgb_profiles.insert(*id, name.to_string());
            }
            inner.ctx.profiles.save_active(&profile)?;
        }
        inner.restart_render()
    }

    fn reset_speed_profiles(&self, deleted: &str) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        let mut profile = inner.profile.lock().unwrap();
        let mut changed = false;
        for name in profile.speed_profiles.values_mut() {
            if name == deleted {
                *name = FALLBACK_PROFILE.to_string();
                changed = true;
            }
        }
        if changed {
            inner.ctx.profiles.save_active(&profile)?;
        }
        Ok(())
    }

    fn update_manual_speed(&self, channel: i16, value: u8) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        let channels = inner.resolve_channels(channel, true)?;
        let targets: Vec<SpeedTarget> = {
            let subs = inner.subs.lock().unwrap();
            channels
                .iter()
                .filter_map(|id| subs.iter().find(|s| s.channel_id == *id))
                .map(|sub| SpeedTarget {
                    channel_id: sub.channel_id,
                    percent: if sub.contains_pump {
                        clamp_pump(value)
                    } else {
                        clamp_fan(value)
                    },
                })
                .collect()
        };
        inner.write_speed_program(&targets)?;
        // The governor must not skip its next write because of stale keys.
        inner.governor.lock().unwrap().invalidate();
        Ok(())
    }

    fn change_device_brightness(&self, slider: u8) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        let slider = validate_brightness(slider)?;
        {
            let mut profile = inner.profile.lock().unwrap();
            profile.brightness = slider;
            inner.ctx.profiles.save_active(&profile)?;
        }
        inner.restart_render()
    }

    fn change_device_brightness_mode(&self, mode: u8) -> Result<()> {
        self.change_device_brightness(brightness_for_mode(mode)?)
    }

    fn save_user_profile(&self, name: &str) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        let profile = inner.profile.lock().unwrap();
        inner.ctx.profiles.save_named(&profile, name)
    }

    fn change_device_profile(&self, name: &str) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        let loaded = inner.ctx.profiles.activate_named(&inner.serial, name)?;
        {
            let mut profile = inner.profile.lock().unwrap();
            *profile = loaded;
            let subs = inner.subs.lock().unwrap();
            reconcile_profile(&mut profile, &subs);
            inner.ctx.profiles.save_active(&profile)?;
        }
        inner.governor.lock().unwrap().invalidate();
        inner.restart_render()
    }

    fn update_device_label(&self, channel: i16, label: &str) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        let id = u8::try_from(channel)
            .map_err(|_| DeviceError::Validation(format!("Bad channel {}", channel)))?;
        let mut profile = inner.profile.lock().unwrap();
        profile.labels.insert(id, label.to_string());
        inner.ctx.profiles.save_active(&profile)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooling::SpeedProfileStore;
    use crate::cooling::TemperatureProbe;
    use crate::device::DpiChange;
    use crate::protocol::commands::{
        CMD_GET_FIRMWARE, CMD_GET_MODE, CMD_READ, CMD_SET_MODE, DT_COLOR, OP_CONTROL,
    };
    use crate::protocol::transport::HidEndpoint;
    use crate::storage::{ProfileStore, RgbStore};
    use std::collections::HashMap;

    struct FixedProbe;

    impl TemperatureProbe for FixedProbe {
        fn cpu_temp(&self) -> Option<f32> {
            Some(45.0)
        }
        fn gpu_temp(&self) -> Option<f32> {
            None
        }
    }

    fn context(dir: &std::path::Path) -> Arc<DeviceContext> {
        let speeds = SpeedProfileStore::new(dir.join("temperatures"));
        speeds.ensure_builtins().unwrap();
        Arc::new(DeviceContext {
            profiles: ProfileStore::new(dir.join("profiles")),
            rgb: RgbStore::new(dir.join("rgb")),
            speeds,
            probe: Arc::new(FixedProbe),
        })
    }

    // A small device simulator: answers mode, firmware and framed endpoint
    // reads from scripted per-endpoint payloads, and records every write.
    struct FakeHubState {
        writes: Vec<Vec<u8>>,
        opened: Option<u8>,
        pending: Option<Vec<u8>>,
        endpoints: HashMap<u8, Vec<u8>>,
        mode: u8,
    }

    #[derive(Clone)]
    struct FakeHub {
        class: DeviceClass,
        state: Arc<Mutex<FakeHubState>>,
    }

    impl FakeHub {
        fn new(class: DeviceClass) -> Self {
            Self {
                class,
                state: Arc::new(Mutex::new(FakeHubState {
                    writes: Vec::new(),
                    opened: None,
                    pending: None,
                    endpoints: HashMap::new(),
                    mode: 0x01,
                })),
            }
        }

        /// Script the tagged frame served for reads of `endpoint`.
        fn serve(&self, endpoint: u8, tag: [u8; 2], payload: &[u8]) {
            let at = self.class.response_offset();
            let mut frame = vec![0u8; self.class.read_size()];
            frame[at..at + 2].copy_from_slice(&tag);
            frame[at + 2..at + 2 + payload.len()].copy_from_slice(payload);
            self.state.lock().unwrap().endpoints.insert(endpoint, frame);
        }

        fn writes(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().writes.clone()
        }

        fn mode(&self) -> u8 {
            self.state.lock().unwrap().mode
        }

        /// Simulate a firmware-side mode flip (host sleep).
        fn force_mode(&self, mode: u8) {
            self.state.lock().unwrap().mode = mode;
        }
    }

    impl HidEndpoint for FakeHub {
        fn write(&self, data: &[u8]) -> Result<usize> {
            let mut state = self.state.lock().unwrap();
            state.writes.push(data.to_vec());
            let cmd = &data[1..];
            let at = self.class.response_offset();

            if cmd.starts_with(&[0x0D, 0x01]) || cmd.starts_with(&[0x0D, 0x00]) {
                state.opened = Some(cmd[2]);
            } else if cmd.starts_with(&CMD_READ) {
                if let Some(frame) = state.opened.and_then(|ep| state.endpoints.get(&ep)).cloned()
                {
                    state.pending = Some(frame);
                }
            } else if cmd[0] == OP_CONTROL && cmd[1..].starts_with(&CMD_SET_MODE) {
                state.mode = cmd[1 + CMD_SET_MODE.len()];
            } else if cmd[0] == OP_CONTROL && cmd[1..].starts_with(&CMD_GET_MODE) {
                let mut frame = vec![0u8; self.class.read_size()];
                frame[at + 2] = state.mode;
                state.pending = Some(frame);
            } else if cmd[0] == OP_CONTROL && cmd[1..].starts_with(&CMD_GET_FIRMWARE) {
                let mut frame = vec![0u8; self.class.read_size()];
                frame[at..at + 4].copy_from_slice(&[0x03, 0x17, 0x34, 0x12]);
                state.pending = Some(frame);
            }
            Ok(data.len())
        }

        fn read_timeout(&self, buf: &mut [u8], _timeout_ms: i32) -> Result<usize> {
            let mut state = self.state.lock().unwrap();
            match state.pending.take() {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }

    fn open_commander(fake: &FakeHub, dir: &std::path::Path) -> HubDriver {
        // Two fan ports present, 8 LEDs each; one probe at 33.5 °C.
        fake.serve(EP_FANS, DT_FANS, &[2, 1, 1]);
        fake.serve(EP_LED_CONFIG, DT_LED_CONFIG, &[2, 8, 0, 8, 0]);
        fake.serve(EP_SPEEDS, DT_SPEEDS, &[3, 0xC4, 0x09, 0xB0, 0x04, 0x10, 0x02]);
        fake.serve(EP_TEMPERATURES, DT_TEMPERATURES, &[1, 0, 0x4F, 0x01]);

        let transport = Arc::new(Transport::new(
            DeviceClass::CommanderCore,
            Box::new(fake.clone()),
        ));
        HubDriver::commander_core("HUBSER1", transport, context(dir)).unwrap()
    }

    #[test]
    fn test_open_negotiates_software_mode_and_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHub::new(DeviceClass::CommanderCore);
        let driver = open_commander(&fake, dir.path());

        assert_eq!(fake.mode(), MODE_SOFTWARE);
        assert_eq!(driver.firmware().unwrap().to_string(), "3.23.4660");

        // The software-mode command went out with the documented framing.
        let writes = fake.writes();
        assert!(writes
            .iter()
            .any(|w| w[..6] == [0x00, 0x08, 0x01, 0x03, 0x00, 0x02]));

        driver.stop().unwrap();
    }

    #[test]
    fn test_sub_device_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHub::new(DeviceClass::CommanderCore);
        let driver = open_commander(&fake, dir.path());

        let subs = driver.sub_devices();
        assert_eq!(subs.len(), 3);
        // Fans first (external LED rings), pump last.
        assert_eq!(subs[0].name, "Fan 1");
        assert!(subs[0].has_speed);
        assert_eq!(subs[0].led_channel_count, 8);
        assert_eq!(subs[0].speed_profile_name, "Normal");
        assert_eq!(subs[0].rgb_profile_name, "static");
        assert!(subs[2].contains_pump);
        assert_eq!(subs[2].channel_id, PUMP_CHANNEL);

        driver.stop().unwrap();
    }

    #[test]
    fn test_stop_sends_hardware_mode_last() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHub::new(DeviceClass::CommanderCore);
        let driver = open_commander(&fake, dir.path());

        driver.stop().unwrap();
        assert_eq!(fake.mode(), MODE_HARDWARE);

        let writes = fake.writes();
        let last = writes.last().unwrap();
        assert_eq!(&last[..6], &[0x00, 0x08, 0x01, 0x03, 0x00, 0x01]);

        // stop is idempotent: no further writes.
        let count = writes.len();
        driver.stop().unwrap();
        assert_eq!(fake.writes().len(), count);
    }

    #[test]
    fn test_unknown_profiles_rejected_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHub::new(DeviceClass::CommanderCore);
        let driver = open_commander(&fake, dir.path());

        assert!(matches!(
            driver.update_speed_profile(1, "missing"),
            Err(DeviceError::UnknownSpeedProfile(_))
        ));
        assert!(matches!(
            driver.update_rgb_profile(1, "missing"),
            Err(DeviceError::UnknownRgbProfile(_))
        ));
        assert_eq!(driver.sub_devices()[0].speed_profile_name, "Normal");

        driver.stop().unwrap();
    }

    #[test]
    fn test_update_speed_profile_all_channels() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHub::new(DeviceClass::CommanderCore);
        let driver = open_commander(&fake, dir.path());

        driver.update_speed_profile(ALL_CHANNELS, "Quiet").unwrap();
        for sub in driver.sub_devices() {
            assert_eq!(sub.speed_profile_name, "Quiet");
        }

        driver.reset_speed_profiles("Quiet").unwrap();
        for sub in driver.sub_devices() {
            assert_eq!(sub.speed_profile_name, "Normal");
        }

        driver.stop().unwrap();
    }

    #[test]
    fn test_brightness_validation_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHub::new(DeviceClass::CommanderCore);
        let driver = open_commander(&fake, dir.path());

        assert!(driver.change_device_brightness(101).is_err());
        driver.change_device_brightness(100).unwrap();
        driver.change_device_brightness_mode(1).unwrap();

        let stored = context(dir.path())
            .profiles
            .load_or_create("HUBSER1", "Commander Core")
            .unwrap();
        assert_eq!(stored.brightness, 33);

        driver.stop().unwrap();
    }

    /// Count all-black reset frames: the first chunk of a color write whose
    /// RGB payload is entirely zero. Only restarts emit those.
    fn reset_frame_count(fake: &FakeHub) -> usize {
        fake.writes()
            .iter()
            .filter(|w| {
                w[1..3] == [0x06, 0x00]
                    && w[5..7] == DT_COLOR
                    && w[7..].iter().all(|&b| b == 0)
            })
            .count()
    }

    #[test]
    fn test_rgb_profile_update_restarts_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHub::new(DeviceClass::CommanderCore);
        let driver = open_commander(&fake, dir.path());

        // Initial render at open already wrote one reset frame.
        assert_eq!(reset_frame_count(&fake), 1);

        // Re-applying the profile the channels already run is a no-op.
        driver.update_rgb_profile(ALL_CHANNELS, "static").unwrap();
        assert_eq!(reset_frame_count(&fake), 1);

        // A real change restarts once.
        driver.update_rgb_profile(1, "rainbow").unwrap();
        assert_eq!(reset_frame_count(&fake), 2);

        // Applying it again does not restart the render task.
        driver.update_rgb_profile(1, "rainbow").unwrap();
        assert_eq!(reset_frame_count(&fake), 2);

        driver.stop().unwrap();
        // Shutdown leaves the LEDs dark with one final reset frame.
        assert_eq!(reset_frame_count(&fake), 3);
    }

    #[test]
    fn test_resume_from_sleep_reinitializes() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHub::new(DeviceClass::CommanderCore);
        let driver = open_commander(&fake, dir.path());

        // Let telemetry publish the quiescent (software) mode byte.
        std::thread::sleep(Duration::from_millis(1300));
        let resets_before = reset_frame_count(&fake);

        // Host slept: the firmware fell back out of software mode.
        fake.force_mode(MODE_HARDWARE);
        std::thread::sleep(Duration::from_millis(2600));

        // The watcher re-sent software mode and re-ran the render path.
        assert_eq!(fake.mode(), MODE_SOFTWARE);
        assert!(reset_frame_count(&fake) > resets_before);

        // The persisted profile is untouched by a resume cycle.
        let stored = context(dir.path())
            .profiles
            .load_or_create("HUBSER1", "Commander Core")
            .unwrap();
        assert_eq!(stored.brightness, 100);

        driver.stop().unwrap();
    }

    #[test]
    fn test_manual_speed_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHub::new(DeviceClass::CommanderCore);
        let driver = open_commander(&fake, dir.path());

        // Pump channel: 10 % clamps to 50 %.
        driver.update_manual_speed(PUMP_CHANNEL as i16, 10).unwrap();
        let writes = fake.writes();
        let speed_write = writes
            .iter()
            .rev()
            .find(|w| w[1..3] == [0x06, 0x00] && w[5..7] == DT_SET_SPEED)
            .expect("speed write present");
        // Payload after the 4-byte prefix: [count, channel, mode, pct, 0].
        assert_eq!(speed_write[7], 0x01);
        assert_eq!(speed_write[8], PUMP_CHANNEL);
        assert_eq!(speed_write[10], 50);

        driver.stop().unwrap();
    }

    #[test]
    fn test_save_and_change_user_profile() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHub::new(DeviceClass::CommanderCore);
        let driver = open_commander(&fake, dir.path());

        driver.update_speed_profile(1, "Performance").unwrap();
        driver.save_user_profile("gaming").unwrap();
        driver.update_speed_profile(1, "Quiet").unwrap();

        driver.change_device_profile("gaming").unwrap();
        let subs = driver.sub_devices();
        let fan1 = subs.iter().find(|s| s.channel_id == 1).unwrap();
        assert_eq!(fan1.speed_profile_name, "Performance");

        assert!(driver.save_user_profile("bad name").is_err());

        driver.stop().unwrap();
    }

    #[test]
    fn test_dpi_surface_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeHub::new(DeviceClass::CommanderCore);
        let driver = open_commander(&fake, dir.path());

        assert!(matches!(
            driver.modify_dpi(DpiChange::Up),
            Err(DeviceError::Unsupported)
        ));
        assert!(matches!(
            driver.update_sleep_timer(10),
            Err(DeviceError::Unsupported)
        ));

        driver.stop().unwrap();
    }

    #[test]
    fn test_decode_presence() {
        assert_eq!(decode_presence(&[3, 1, 0, 1]), vec![true, false, true]);
        assert_eq!(decode_presence(&[]), Vec::<bool>::new());
    }

    #[test]
    fn test_decode_rpms() {
        assert_eq!(decode_rpms(&[2, 0xC4, 0x09, 0xB0, 0x04]), vec![2500, 1200]);
    }

    #[test]
    fn test_decode_temps() {
        // status 0 with 335 => 33.5 °C; status 1 => disconnected probe
        assert_eq!(
            decode_temps(&[2, 0, 0x4F, 0x01, 1, 0, 0]),
            vec![Some(33.5), None]
        );
    }

    #[test]
    fn test_decode_led_counts() {
        assert_eq!(decode_led_counts(&[2, 8, 0, 34, 0]), vec![8, 34]);
    }
}
