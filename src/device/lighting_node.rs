//! RGB-only controller drivers: Lighting Node Core, Lighting Node Pro and
//! the LT100 towers.
//!
//! These classes have no fans or probes; the driver runs just the render
//! task over de-interleaved per-channel R/G/B streams. The strand layout
//! comes from the persisted external-hub configuration, and `stop`
//! installs a hardware-only pattern so the device keeps displaying
//! something once the daemon is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::device::{
    brightness_for_mode, validate_brightness, DeviceContext, Driver, SubDevice, ALL_CHANNELS,
};
use crate::error::{DeviceError, Result};
use crate::lighting::{deinterleave, ChannelPlan, FrameSink, RenderEngine, RenderPlan};
use crate::protocol::commands::{DT_HW_PATTERN, EP_HW_PATTERN};
use crate::protocol::{
    DeviceClass, EndpointIo, FirmwareVersion, Transport, MODE_HARDWARE, MODE_SOFTWARE,
};
use crate::storage::DeviceProfile;

/// Strands attached when a profile has no layout yet.
const DEFAULT_STRAND_COUNT: u8 = 2;

/// LEDs per strand for each accessory type.
fn strand_led_count(class: DeviceClass, hub_type: u8) -> usize {
    if class == DeviceClass::Lt100 {
        // One tower is one strand.
        return 27;
    }
    match hub_type {
        0 => 10, // LED strip
        1 => 12, // HD-series fan
        2 => 16, // LL-series fan
        3 => 34, // QL-series fan
        _ => 10,
    }
}

struct NodeSink {
    io: Arc<EndpointIo>,
}

impl FrameSink for NodeSink {
    fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let (red, green, blue) = deinterleave(frame);
        self.io.write_color_channels(&red, &green, &blue)
    }
}

struct NodeInner {
    class: DeviceClass,
    serial: String,
    io: Arc<EndpointIo>,
    ctx: Arc<DeviceContext>,
    firmware: FirmwareVersion,
    profile: Mutex<DeviceProfile>,
    subs: Mutex<Vec<SubDevice>>,
    engine: RenderEngine,
    stopped: AtomicBool,
    request: Mutex<()>,
}

/// Driver for the Lighting Node family.
pub struct LightingNodeDriver {
    inner: Arc<NodeInner>,
}

impl LightingNodeDriver {
    pub fn lighting_node_core(
        serial: &str,
        transport: Arc<Transport>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        Self::open(DeviceClass::LightingNodeCore, serial, transport, ctx)
    }

    pub fn lighting_node_pro(
        serial: &str,
        transport: Arc<Transport>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        Self::open(DeviceClass::LightingNodePro, serial, transport, ctx)
    }

    pub fn lt100(
        serial: &str,
        transport: Arc<Transport>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        Self::open(DeviceClass::Lt100, serial, transport, ctx)
    }

    pub fn open(
        class: DeviceClass,
        serial: &str,
        transport: Arc<Transport>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        let io = Arc::new(EndpointIo::new(transport));

        io.set_mode(MODE_SOFTWARE)?;
        let firmware = io.get_firmware()?;
        info!(device = class.name(), serial, firmware = %firmware, "lighting node initialized");

        let mut profile = ctx.profiles.load_or_create(serial, class.name())?;
        if profile.external_hub_count == 0 {
            profile.external_hub_count = DEFAULT_STRAND_COUNT;
        }
        let subs = build_strands(class, &profile);
        reconcile_rgb(&mut profile, &subs);
        ctx.profiles.save_active(&profile)?;
        ctx.rgb.ensure_defaults(serial)?;

        io.init_color_endpoint()?;

        let inner = Arc::new(NodeInner {
            class,
            serial: serial.to_string(),
            io,
            ctx,
            firmware,
            profile: Mutex::new(profile),
            subs: Mutex::new(subs),
            engine: RenderEngine::new(),
            stopped: AtomicBool::new(false),
            request: Mutex::new(()),
        });
        inner.restart_render()?;

        Ok(Self { inner })
    }
}

/// Strand rows for the configured accessory layout. Ordinals are the
/// strand positions, so existing channels keep their ids across a
/// reconfiguration.
fn build_strands(class: DeviceClass, profile: &DeviceProfile) -> Vec<SubDevice> {
    let leds = strand_led_count(class, profile.external_hub_type);
    (0..profile.external_hub_count)
        .map(|index| SubDevice {
            channel_id: index,
            name: if class == DeviceClass::Lt100 {
                format!("Tower {}", index + 1)
            } else {
                format!("Strand {}", index + 1)
            },
            description: "External LED channel".to_string(),
            led_channel_count: leds,
            ..Default::default()
        })
        .collect()
}

fn reconcile_rgb(profile: &mut DeviceProfile, subs: &[SubDevice]) {
    for sub in subs {
        profile
            .rgb_profiles
            .entry(sub.channel_id)
            .or_insert_with(|| "static".to_string());
    }
}

impl NodeInner {
    fn restart_render(&self) -> Result<()> {
        let plan = {
            let profile = self.profile.lock().unwrap();
            let subs = self.subs.lock().unwrap();
            let channels = subs
                .iter()
                .map(|sub| {
                    let name = profile
                        .rgb_profiles
                        .get(&sub.channel_id)
                        .cloned()
                        .unwrap_or_else(|| "static".to_string());
                    let rgb = self.ctx.rgb.get(&self.serial, &name).unwrap_or_default();
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
        let sink = Arc::new(NodeSink {
            io: Arc::clone(&self.io),
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

    fn resolve_channels(&self, channel: i16) -> Result<Vec<u8>> {
        let subs = self.subs.lock().unwrap();
        if channel == ALL_CHANNELS {
            return Ok(subs.iter().map(|s| s.channel_id).collect());
        }
        let id = u8::try_from(channel)
            .map_err(|_| DeviceError::Validation(format!("Bad channel {}", channel)))?;
        if !subs.iter().any(|s| s.channel_id == id) {
            return Err(DeviceError::Validation(format!(
                "Channel {} does not exist on this device",
                id
            )));
        }
        Ok(vec![id])
    }
}

impl Driver for LightingNodeDriver {
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

        let sink = NodeSink {
            io: Arc::clone(&inner.io),
        };
        inner.engine.shutdown(&sink, inner.led_total());

        // Install the hardware fallback pattern so the device keeps
        // animating on its own after the daemon exits.
        let pattern = inner.profile.lock().unwrap().hardware_mode;
        inner
            .io
            .framed_write(EP_HW_PATTERN, DT_HW_PATTERN, &[pattern])?;
        inner.io.set_mode(MODE_HARDWARE)?;
        info!(device = inner.class.name(), serial = %inner.serial, "lighting node stopped");
        Ok(())
    }

    fn stop_dirty(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.engine.halt();
    }

    fn update_rgb_profile(&self, channel: i16, name: &str) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        inner.ctx.rgb.get(&inner.serial, name)?;
        if name == "liquid-temperature" {
            return Err(DeviceError::LiquidWithoutPump);
        }
        let channels = inner.resolve_channels(channel)?;
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
            if profile.external_hub_count == 0 {
                profile.external_hub_count = DEFAULT_STRAND_COUNT;
            }
            let subs = build_strands(inner.class, &profile);
            reconcile_rgb(&mut profile, &subs);
            inner.ctx.profiles.save_active(&profile)?;
            *inner.subs.lock().unwrap() = subs;
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

    /// Rebuild the strand table for a new accessory layout. The render
    /// task is cancelled before the rows change.
    fn update_external_hub(&self, hub_type: u8, count: u8) -> Result<()> {
        let inner = &self.inner;
        let _req = inner.request.lock().unwrap();
        if count == 0 || count > 6 {
            return Err(DeviceError::Validation(format!(
                "External strand count {} out of 1..=6",
                count
            )));
        }
        inner.engine.halt();
        {
            let mut profile = inner.profile.lock().unwrap();
            profile.external_hub_type = hub_type;
            profile.external_hub_count = count;
            let subs = build_strands(inner.class, &profile);
            reconcile_rgb(&mut profile, &subs);
            inner.ctx.profiles.save_active(&profile)?;
            *inner.subs.lock().unwrap() = subs;
        }
        inner.restart_render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooling::{SpeedProfileStore, TemperatureProbe};
    use crate::protocol::transport::mock::MockEndpoint;
    use crate::storage::{ProfileStore, RgbStore};

    struct NoProbe;

    impl TemperatureProbe for NoProbe {
        fn cpu_temp(&self) -> Option<f32> {
            None
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
            probe: Arc::new(NoProbe),
        })
    }

    fn open_node(dir: &std::path::Path) -> (MockEndpoint, LightingNodeDriver) {
        let mock = MockEndpoint::new();
        // Firmware response is consumed by the second control transfer.
        mock.push_response(vec![0u8; 64]); // software mode ack
        let mut fw = vec![0u8; 64];
        fw[4..8].copy_from_slice(&[0x01, 0x02, 0x10, 0x00]);
        mock.push_response(fw);

        let transport = Arc::new(Transport::new(
            DeviceClass::LightingNodeCore,
            Box::new(mock.clone()),
        ));
        let driver =
            LightingNodeDriver::lighting_node_core("NODE1", transport, context(dir)).unwrap();
        (mock, driver)
    }

    #[test]
    fn test_open_builds_default_strands() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, driver) = open_node(dir.path());

        let subs = driver.sub_devices();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].name, "Strand 1");
        assert_eq!(subs[0].led_channel_count, 10);
        assert_eq!(subs[0].rgb_profile_name, "static");
        assert_eq!(driver.firmware().unwrap().to_string(), "1.2.16");

        driver.stop().unwrap();
    }

    #[test]
    fn test_frames_go_out_per_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, driver) = open_node(dir.path());

        // Initial static render: reset frame + static frame, each sent as
        // three tagged channel streams.
        let color_writes: Vec<Vec<u8>> = mock
            .writes()
            .iter()
            .filter(|w| w[1] == 0x06)
            .cloned()
            .collect();
        assert!(color_writes.len() >= 6);
        // Channel tags cycle 0x00 (red), 0x01 (green), 0x02 (blue).
        assert_eq!(color_writes[0][6], 0x00);
        assert_eq!(color_writes[1][6], 0x01);
        assert_eq!(color_writes[2][6], 0x02);

        driver.stop().unwrap();
    }

    #[test]
    fn test_external_hub_rebuild_keeps_ordinals() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, driver) = open_node(dir.path());

        driver.update_device_label(0, "Desk strip").unwrap();
        driver.update_external_hub(2, 4).unwrap();

        let subs = driver.sub_devices();
        assert_eq!(subs.len(), 4);
        assert_eq!(subs[0].channel_id, 0);
        assert_eq!(subs[0].led_channel_count, 16);
        // The existing ordinal kept its label.
        assert_eq!(subs[0].user_label, "Desk strip");

        assert!(driver.update_external_hub(2, 0).is_err());

        driver.stop().unwrap();
    }

    #[test]
    fn test_stop_installs_hardware_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, driver) = open_node(dir.path());

        driver.stop().unwrap();

        let writes = mock.writes();
        // Hardware pattern write targets the pattern endpoint before the
        // final hardware-mode command.
        let pattern_open = writes
            .iter()
            .position(|w| w[1..4] == [0x0D, 0x01, EP_HW_PATTERN])
            .expect("pattern endpoint opened");
        let last = writes.last().unwrap();
        assert_eq!(&last[1..6], &[0x08, 0x01, 0x03, 0x00, 0x01]);
        assert!(pattern_open < writes.len() - 1);
    }

    #[test]
    fn test_liquid_profile_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, driver) = open_node(dir.path());

        assert!(matches!(
            driver.update_rgb_profile(0, "liquid-temperature"),
            Err(DeviceError::LiquidWithoutPump)
        ));

        driver.stop().unwrap();
    }

    #[test]
    fn test_speed_surface_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, driver) = open_node(dir.path());

        assert!(matches!(
            driver.update_speed_profile(0, "Normal"),
            Err(DeviceError::Unsupported)
        ));
        assert!(matches!(
            driver.update_manual_speed(0, 50),
            Err(DeviceError::Unsupported)
        ));

        driver.stop().unwrap();
    }
}
