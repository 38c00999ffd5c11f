//! Mouse drivers: Harpoon RGB Pro and Katar Pro (wired), plus the
//! wireless children that live behind a dongle.
//!
//! A wired mouse owns its own handle and listener interface. A wireless
//! child shares the dongle handle through a routed endpoint view and never
//! writes while its link is down: the endpoint selector reaches the
//! dongle's radio and a write to an absent peripheral can stall the whole
//! handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, warn};

use crate::device::{
    brightness_for_mode, spawn_ticker, validate_brightness, DeviceContext, DpiChange, Driver,
    SubDevice, TaskHandle, ALL_CHANNELS, DPI_MAX, DPI_MIN, SLEEP_MINUTES_MAX,
};
use crate::error::{DeviceError, Result};
use crate::lighting::{ChannelPlan, FrameSink, RenderEngine, RenderPlan, RgbColor};
use crate::protocol::commands::{
    CMD_HEARTBEAT, EVT_DPI_BUTTON, EVT_TYPE_OFFSET, EVT_VALUE_OFFSET, MOUSE_CMD_SET_DPI,
    MOUSE_CMD_SET_DPI_COLORS, MOUSE_CMD_SLEEP_TIMER,
};
use crate::protocol::{
    DeviceClass, EndpointIo, FirmwareVersion, Transport, MODE_HARDWARE, MODE_SOFTWARE,
};
use crate::storage::{DeviceProfile, DpiStage};

/// Listener poll timeout, matching the task-inventory cadence.
const LISTENER_POLL_MS: i32 = 100;

/// LED zones per mouse class.
fn led_zones(class: DeviceClass) -> usize {
    match class {
        DeviceClass::M75AirWireless => 2,
        _ => 1,
    }
}

struct MouseSink {
    io: Arc<EndpointIo>,
    connected: Arc<AtomicBool>,
}

impl FrameSink for MouseSink {
    fn write_frame(&self, frame: &[u8]) -> Result<()> {
        // Dropping frames while offline keeps the dongle radio quiet.
        if !self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.io.write_color(frame)
    }
}

struct MouseInner {
    class: DeviceClass,
    serial: String,
    io: Arc<EndpointIo>,
    ctx: Arc<DeviceContext>,
    profile: Mutex<DeviceProfile>,
    firmware: Mutex<Option<FirmwareVersion>>,
    connected: Arc<AtomicBool>,
    engine: RenderEngine,
    battery: Mutex<Option<u8>>,
    running: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<TaskHandle>>,
    listener: Mutex<Option<std::thread::JoinHandle<()>>>,
    request: Mutex<()>,
}

/// Driver for wired mice and dongle-routed wireless children.
pub struct MouseDriver {
    inner: Arc<MouseInner>,
}

impl MouseDriver {
    /// Open a wired mouse on its own handle. `listener` is the secondary
    /// interface carrying DPI-button packets, when the registry found one.
    pub fn open_wired(
        class: DeviceClass,
        serial: &str,
        transport: Arc<Transport>,
        listener: Option<Arc<Transport>>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        let io = Arc::new(EndpointIo::new(transport));
        io.set_mode(MODE_SOFTWARE)?;
        let firmware = io.get_firmware()?;
        info!(device = class.name(), serial, firmware = %firmware, "mouse initialized");

        let driver = Self::build(class, serial, io, ctx, true)?;
        *driver.inner.firmware.lock().unwrap() = Some(firmware);

        driver.inner.io.init_color_endpoint()?;
        driver.inner.restart_render()?;
        driver.inner.push_dpi_stage()?;

        driver.spawn_keepalive()?;
        if let Some(listener) = listener {
            driver.spawn_listener(listener)?;
        }
        Ok(driver)
    }

    /// Construct a wireless child behind `dongle`. The child starts
    /// offline; `connect` runs once the dongle observes the link.
    pub fn wireless_child(
        class: DeviceClass,
        serial: &str,
        dongle: Arc<Transport>,
        selector: u8,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        let io = Arc::new(EndpointIo::routed(dongle, selector));
        Self::build(class, serial, io, ctx, false)
    }

    fn build(
        class: DeviceClass,
        serial: &str,
        io: Arc<EndpointIo>,
        ctx: Arc<DeviceContext>,
        connected: bool,
    ) -> Result<Self> {
        let profile = ctx.profiles.load_or_create(serial, class.name())?;
        ctx.rgb.ensure_defaults(serial)?;

        Ok(Self {
            inner: Arc::new(MouseInner {
                class,
                serial: serial.to_string(),
                io,
                ctx,
                profile: Mutex::new(profile),
                firmware: Mutex::new(None),
                connected: Arc::new(AtomicBool::new(connected)),
                engine: RenderEngine::new(),
                battery: Mutex::new(None),
                running: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
                request: Mutex::new(()),
            }),
        })
    }

    fn spawn_keepalive(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let handle = spawn_ticker(
            "mouse-keepalive",
            Duration::from_millis(self.inner.class.keepalive_interval_ms()),
            move || {
                if !inner.connected.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = inner.io.control(&CMD_HEARTBEAT, &[], None) {
                    warn!(error = %e, "mouse heartbeat failed");
                }
            },
        )?;
        self.inner.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    fn spawn_listener(&self, listener: Arc<Transport>) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let join = std::thread::Builder::new()
            .name("mouse-listener".to_string())
            .spawn(move || {
                while inner.running.load(Ordering::SeqCst) {
                    match listener.read_unsolicited(LISTENER_POLL_MS) {
                        Ok(Some(packet)) => inner.handle_event(&packet),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "mouse listener read failed");
                            std::thread::sleep(Duration::from_millis(250));
                        }
                    }
                }
            })?;
        *self.inner.listener.lock().unwrap() = Some(join);
        Ok(())
    }
}

impl MouseInner {
    fn handle_event(&self, packet: &[u8]) {
        if packet.len() <= EVT_VALUE_OFFSET {
            return;
        }
        if packet[EVT_TYPE_OFFSET] == EVT_DPI_BUTTON {
            let change = match packet[EVT_VALUE_OFFSET] {
                0x01 => DpiChange::Up,
                0x02 => DpiChange::Down,
                _ => DpiChange::Cycle,
            };
            if let Err(e) = self.apply_dpi_change(change) {
                warn!(error = %e, "DPI button handling failed");
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DeviceError::Offline);
        }
        Ok(())
    }

    fn restart_render(&self) -> Result<()> {
        let plan = {
            let profile = self.profile.lock().unwrap();
            let name = profile
                .rgb_profiles
                .get(&0)
                .cloned()
                .unwrap_or_else(|| "static".to_string());
            let rgb = self.ctx.rgb.get(&self.serial, &name).unwrap_or_default();
            RenderPlan {
                channels: vec![ChannelPlan {
                    channel_id: 0,
                    led_count: led_zones(self.class),
                    profile_name: name,
                    profile: rgb,
                }],
                brightness: profile.brightness,
                interval: Duration::from_millis(self.class.render_interval_ms()),
            }
        };
        let sink = Arc::new(MouseSink {
            io: Arc::clone(&self.io),
            connected: Arc::clone(&self.connected),
        });
        self.engine.restart(plan, sink)
    }

    /// Write the active DPI stage value as a little-endian u16.
    fn push_dpi_stage(&self) -> Result<()> {
        self.ensure_connected()?;
        let (dpi, color) = {
            let profile = self.profile.lock().unwrap();
            let stage = profile
                .dpi_stages
                .get(profile.dpi_stage_index)
                .cloned()
                .unwrap_or(DpiStage {
                    name: "Default".into(),
                    dpi_value: 1200,
                    stage_color: RgbColor::new(255, 255, 255),
                });
            (stage.dpi_value, stage.stage_color)
        };
        let mut payload = [0u8; 2];
        LittleEndian::write_u16(&mut payload, dpi);
        self.io.control(&MOUSE_CMD_SET_DPI, &payload, None)?;
        self.io.control(
            &MOUSE_CMD_SET_DPI_COLORS,
            &[color.red, color.green, color.blue],
            None,
        )?;
        debug!(dpi, "DPI stage pushed");
        Ok(())
    }

    /// Write the idle sleep timer as little-endian u32 milliseconds.
    fn push_sleep_timer(&self) -> Result<()> {
        self.ensure_connected()?;
        let minutes = self.profile.lock().unwrap().sleep_minutes;
        let mut payload = [0u8; 4];
        LittleEndian::write_u32(&mut payload, minutes * 60 * 1000);
        self.io.control(&MOUSE_CMD_SLEEP_TIMER, &payload, None)?;
        Ok(())
    }

    fn apply_dpi_change(&self, change: DpiChange) -> Result<()> {
        {
            let mut profile = self.profile.lock().unwrap();
            let count = profile.dpi_stages.len();
            if count == 0 {
                return Err(DeviceError::Validation("No DPI stages defined".into()));
            }
            profile.dpi_stage_index = match change {
                DpiChange::Up => (profile.dpi_stage_index + 1).min(count - 1),
                DpiChange::Down => profile.dpi_stage_index.saturating_sub(1),
                DpiChange::Cycle => (profile.dpi_stage_index + 1) % count,
            };
            self.ctx.profiles.save_active(&profile)?;
        }
        match self.push_dpi_stage() {
            Ok(()) => Ok(()),
            // Offline children keep the persisted stage for the next connect.
            Err(e) if e.is_unsupported() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Driver for MouseDriver {
    fn class(&self) -> DeviceClass {
        self.inner.class
    }

    fn serial(&self) -> String {
        self.inner.serial.clone()
    }

    fn firmware(&self) -> Option<FirmwareVersion> {
        *self.inner.firmware.lock().unwrap()
    }

    fn sub_devices(&self) -> Vec<SubDevice> {
        let profile = self.inner.profile.lock().unwrap();
        vec![SubDevice {
            channel_id: 0,
            name: self.inner.class.name().to_string(),
            description: "Pointing device".to_string(),
            led_channel_count: led_zones(self.inner.class),
            rgb_profile_name: profile.rgb_profiles.get(&0).cloned().unwrap_or_default(),
            user_label: profile.labels.get(&0).cloned().unwrap_or_default(),
            battery_pct: *self.inner.battery.lock().unwrap(),
            ..Default::default()
        }]
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
        if let Some(listener) = inner.listener.lock().unwrap().take() {
            let _ = listener.join();
        }

        if inner.connected.load(Ordering::SeqCst) {
            let sink = MouseSink {
                io: Arc::clone(&inner.io),
                connected: Arc::clone(&inner.connected),
            };
            inner.engine.shutdown(&sink, led_zones(inner.class));
            inner.io.set_mode(MODE_HARDWARE)?;
        } else {
            inner.engine.halt();
        }
        info!(device = inner.class.name(), serial = %inner.serial, "mouse stopped");
        Ok(())
    }

    fn stop_dirty(&self) {
        let inner = &self.inner;
        inner.stopped.store(true, Ordering::SeqCst);
        inner.running.store(false, Ordering::SeqCst);
        for task in inner.tasks.lock().unwrap().drain(..) {
            task.stop();
        }
        if let Some(listener) = inner.listener.lock().unwrap().take() {
            let _ = listener.join();
        }
        inner.engine.halt();
        inner.connected.store(false, Ordering::SeqCst);
    }

    fn update_rgb_profile(&self, channel: i16, name: &str) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        if channel != ALL_CHANNELS && channel != 0 {
            return Err(DeviceError::Validation(format!("Bad channel {}", channel)));
        }
        inner.ctx.rgb.get(&inner.serial, name)?;
        if name == "liquid-temperature" {
            return Err(DeviceError::LiquidWithoutPump);
        }
        {
            let mut profile = inner.profile.lock().unwrap();
            if profile.rgb_profiles.get(&0).map(String::as_str) == Some(name) {
                return Ok(());
            }
            profile.rgb_profiles.insert(0, name.to_string());
            inner.ctx.profiles.save_active(&profile)?;
        }
        inner.restart_render()
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
            inner.ctx.profiles.save_active(&profile)?;
        }
        if inner.connected.load(Ordering::SeqCst) {
            inner.push_dpi_stage()?;
            inner.push_sleep_timer()?;
        }
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

    /// Persist a new stage set. Out-of-range stage values clamp to the
    /// supported span rather than failing.
    fn save_mouse_dpi(&self, stages: Vec<DpiStage>) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        if stages.is_empty() || stages.len() > 5 {
            return Err(DeviceError::Validation(
                "A mouse carries between 1 and 5 DPI stages".into(),
            ));
        }
        {
            let mut profile = inner.profile.lock().unwrap();
            profile.dpi_stages = stages
                .into_iter()
                .map(|mut stage| {
                    stage.dpi_value = stage.dpi_value.clamp(DPI_MIN, DPI_MAX);
                    stage
                })
                .collect();
            profile.dpi_stage_index = profile.dpi_stage_index.min(profile.dpi_stages.len() - 1);
            inner.ctx.profiles.save_active(&profile)?;
        }
        match inner.push_dpi_stage() {
            Ok(()) => Ok(()),
            Err(e) if e.is_unsupported() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn save_mouse_dpi_colors(&self, indicator: RgbColor, stage_colors: Vec<RgbColor>) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        {
            let mut profile = inner.profile.lock().unwrap();
            profile.dpi_indicator_color = indicator;
            for (stage, color) in profile.dpi_stages.iter_mut().zip(stage_colors) {
                stage.stage_color = color;
            }
            inner.ctx.profiles.save_active(&profile)?;
        }
        match inner.push_dpi_stage() {
            Ok(()) => Ok(()),
            Err(e) if e.is_unsupported() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn modify_dpi(&self, change: DpiChange) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        inner.apply_dpi_change(change)
    }

    fn update_sleep_timer(&self, minutes: u32) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        if minutes == 0 || minutes > SLEEP_MINUTES_MAX {
            return Err(DeviceError::Validation(format!(
                "Sleep timer {} out of 1..={} minutes",
                minutes, SLEEP_MINUTES_MAX
            )));
        }
        {
            let mut profile = inner.profile.lock().unwrap();
            profile.sleep_minutes = minutes;
            inner.ctx.profiles.save_active(&profile)?;
        }
        match inner.push_sleep_timer() {
            Ok(()) => Ok(()),
            Err(e) if e.is_unsupported() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn get_sleep_mode(&self) -> Result<u32> {
        Ok(self.inner.profile.lock().unwrap().sleep_minutes)
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn set_connected(&self, connected: bool) -> Result<()> {
        let inner = &self.inner;
        let was = inner.connected.swap(connected, Ordering::SeqCst);
        if was && !connected {
            info!(device = inner.class.name(), serial = %inner.serial, "link lost");
            inner.engine.halt();
        }
        Ok(())
    }

    /// Post-link initialization: clear stale input, bounce the mode flag,
    /// read firmware, prime the color endpoint and re-push the persisted
    /// sleep timer and DPI stage.
    fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(DeviceError::Offline);
        }

        inner.io.transport().drain_input();
        inner.io.set_mode(MODE_HARDWARE)?;
        inner.io.set_mode(MODE_SOFTWARE)?;
        let firmware = inner.io.get_firmware()?;
        *inner.firmware.lock().unwrap() = Some(firmware);
        inner.io.init_color_endpoint()?;

        inner.connected.store(true, Ordering::SeqCst);
        inner.push_sleep_timer()?;
        inner.push_dpi_stage()?;
        inner.restart_render()?;
        info!(device = inner.class.name(), serial = %inner.serial, firmware = %firmware, "link established");
        Ok(())
    }

    fn modify_battery_level(&self, pct: u8) -> Result<()> {
        *self.inner.battery.lock().unwrap() = Some(pct.min(100));
        Ok(())
    }

    fn refresh_sleep_timer(&self) -> Result<()> {
        match self.inner.push_sleep_timer() {
            Ok(()) => Ok(()),
            Err(e) if e.is_unsupported() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
