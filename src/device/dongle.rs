//! Wireless dongle multiplexer.
//!
//! One dongle driver owns the receiver handle plus a table of child
//! drivers keyed by product id. It forwards heartbeats to the dongle and
//! to every connected child, and translates unsolicited link-state,
//! battery, mute and DPI-button packets from the listener interface into
//! calls on the children. Children reach the radio only through their
//! routed endpoint view, never through a back-pointer to this driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, warn};

use crate::device::mouse::MouseDriver;
use crate::device::{spawn_ticker, DeviceContext, DpiChange, Driver, SubDevice, TaskHandle};
use crate::error::{DeviceError, Result};
use crate::protocol::commands::{
    CMD_HEARTBEAT, CORSAIR_VID, DT_SUB_DEVICES, EP_SUB_DEVICES, EVT_ADDR_OFFSET, EVT_BATTERY,
    EVT_DPI_BUTTON, EVT_LINK_STATE, EVT_MUTE, EVT_TYPE_OFFSET, EVT_VALUE_OFFSET, LINK_CONNECTED,
};
use crate::protocol::{DeviceClass, EndpointIo, Transport, MODE_HARDWARE, MODE_SOFTWARE};

/// Endpoint selector of the first paired slot.
const CHILD_SELECTOR_BASE: u8 = 0x08;

/// Listener poll timeout.
const LISTENER_POLL_MS: i32 = 100;

/// Callback invoked for every child driver the dongle constructs, so the
/// registry can publish it alongside wired devices.
pub type ChildSink = Box<dyn Fn(Arc<dyn Driver>) + Send + Sync>;

// =============================================================================
// Paired-device records
// =============================================================================

/// One entry of the dongle's paired-device table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PairedDevice {
    pub vendor: u16,
    pub product: u16,
    pub kind: u8,
    pub serial: String,
    pub selector: u8,
}

/// Decode the paired-device list:
/// `{count, [vendor(2), _, _, product(2), type, id_len, id[id_len]]...}`.
/// Truncated entries end the decode; earlier records are kept.
pub(crate) fn decode_paired_devices(payload: &[u8]) -> Vec<PairedDevice> {
    let Some((&count, mut rest)) = payload.split_first() else {
        return Vec::new();
    };
    let mut devices = Vec::new();
    for index in 0..count {
        if rest.len() < 8 {
            break;
        }
        let vendor = LittleEndian::read_u16(&rest[0..2]);
        let product = LittleEndian::read_u16(&rest[4..6]);
        let kind = rest[6];
        let id_len = rest[7] as usize;
        if rest.len() < 8 + id_len {
            break;
        }
        let serial = String::from_utf8_lossy(&rest[8..8 + id_len]).into_owned();
        devices.push(PairedDevice {
            vendor,
            product,
            kind,
            serial,
            selector: CHILD_SELECTOR_BASE + index,
        });
        rest = &rest[8 + id_len..];
    }
    devices
}

// =============================================================================
// Driver
// =============================================================================

struct ChildEntry {
    product: u16,
    selector: u8,
    driver: Arc<dyn Driver>,
}

struct DongleInner {
    class: DeviceClass,
    serial: String,
    transport: Arc<Transport>,
    io: Arc<EndpointIo>,
    children: Mutex<Vec<ChildEntry>>,
    running: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<TaskHandle>>,
    listener: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Driver for the wireless receiver classes.
pub struct DongleDriver {
    inner: Arc<DongleInner>,
}

impl DongleDriver {
    /// Initialize the receiver: software mode, paired-device enumeration,
    /// child construction, keep-alive and listener tasks.
    pub fn open(
        class: DeviceClass,
        serial: &str,
        transport: Arc<Transport>,
        listener: Option<Arc<Transport>>,
        ctx: Arc<DeviceContext>,
        on_child: Option<ChildSink>,
    ) -> Result<Self> {
        let io = Arc::new(EndpointIo::new(Arc::clone(&transport)));
        io.set_mode(MODE_SOFTWARE)?;
        info!(device = class.name(), serial, "dongle initialized");

        let paired = io.framed_read(EP_SUB_DEVICES, DT_SUB_DEVICES, None)?;
        let records = decode_paired_devices(&paired[io.payload_offset()..]);

        let mut children = Vec::new();
        for record in records {
            if record.vendor != CORSAIR_VID {
                warn!(vendor = record.vendor, "foreign paired device skipped");
                continue;
            }
            let Some(child_class) =
                DeviceClass::from_pid(record.product).filter(|c| c.is_wireless_child())
            else {
                warn!(product = format_args!("{:#06X}", record.product), "unknown paired product skipped");
                continue;
            };
            let child = MouseDriver::wireless_child(
                child_class,
                &record.serial,
                Arc::clone(&transport),
                record.selector,
                Arc::clone(&ctx),
            )?;
            let child: Arc<dyn Driver> = Arc::new(child);
            if let Some(sink) = on_child.as_ref() {
                sink(Arc::clone(&child));
            }
            info!(
                device = child_class.name(),
                serial = %record.serial,
                selector = record.selector,
                kind = record.kind,
                "paired child registered"
            );
            children.push(ChildEntry {
                product: record.product,
                selector: record.selector,
                driver: child,
            });
        }

        let inner = Arc::new(DongleInner {
            class,
            serial: serial.to_string(),
            transport,
            io,
            children: Mutex::new(children),
            running: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
        });

        inner.spawn_keepalive()?;
        if let Some(listener) = listener {
            inner.spawn_listener(listener)?;
        }

        Ok(Self { inner })
    }
}

impl DongleInner {
    fn spawn_keepalive(self: &Arc<Self>) -> Result<()> {
        let inner = Arc::clone(self);
        let handle = spawn_ticker(
            "dongle-keepalive",
            Duration::from_millis(self.class.keepalive_interval_ms()),
            move || inner.keepalive_tick(),
        )?;
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    /// Heartbeat the dongle and every connected child; a failed child
    /// heartbeat marks that child offline. Connected children also get
    /// their persisted sleep timer re-pushed.
    fn keepalive_tick(&self) {
        if let Err(e) = self.io.control(&CMD_HEARTBEAT, &[], None) {
            warn!(error = %e, "dongle heartbeat failed");
            return;
        }
        let children = self.children.lock().unwrap();
        for entry in children.iter() {
            if !entry.driver.is_connected() {
                continue;
            }
            let routed = EndpointIo::routed(Arc::clone(&self.transport), entry.selector);
            if let Err(e) = routed.control(&CMD_HEARTBEAT, &[], None) {
                warn!(selector = entry.selector, error = %e, "child heartbeat failed; marking offline");
                let _ = entry.driver.set_connected(false);
                continue;
            }
            if let Err(e) = entry.driver.refresh_sleep_timer() {
                if !e.is_unsupported() {
                    warn!(selector = entry.selector, error = %e, "sleep timer refresh failed");
                }
            }
        }
    }

    fn spawn_listener(self: &Arc<Self>, listener: Arc<Transport>) -> Result<()> {
        let inner = Arc::clone(self);
        let join = std::thread::Builder::new()
            .name("dongle-listener".to_string())
            .spawn(move || {
                while inner.running.load(Ordering::SeqCst) {
                    match listener.read_unsolicited(LISTENER_POLL_MS) {
                        Ok(Some(packet)) => inner.handle_event(&packet),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "listener read failed");
                            std::thread::sleep(Duration::from_millis(250));
                        }
                    }
                }
            })?;
        *self.listener.lock().unwrap() = Some(join);
        Ok(())
    }

    fn child_by_selector(&self, selector: u8) -> Option<Arc<dyn Driver>> {
        self.children
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.selector == selector)
            .map(|entry| Arc::clone(&entry.driver))
    }

    fn handle_event(self: &Arc<Self>, packet: &[u8]) {
        if packet.len() <= EVT_VALUE_OFFSET {
            return;
        }
        let event = packet[EVT_TYPE_OFFSET];
        let selector = packet[EVT_ADDR_OFFSET];
        let value = packet[EVT_VALUE_OFFSET];

        let Some(child) = self.child_by_selector(selector) else {
            debug!(selector, event, "event for unknown child dropped");
            return;
        };

        match event {
            EVT_LINK_STATE => {
                if value == LINK_CONNECTED {
                    // The radio needs a moment to settle before the child
                    // initialization sequence succeeds.
                    let inner = Arc::clone(self);
                    let delay = Duration::from_millis(self.class.connect_delay_ms());
                    let spawned = std::thread::Builder::new()
                        .name("dongle-connect".to_string())
                        .spawn(move || {
                            std::thread::sleep(delay);
                            if !inner.running.load(Ordering::SeqCst) {
                                return;
                            }
                            if let Err(e) = child.connect() {
                                warn!(selector, error = %e, "child connect failed");
                            }
                        });
                    if let Err(e) = spawned {
                        warn!(error = %e, "could not spawn connect task");
                    }
                } else {
                    let _ = child.set_connected(false);
                }
            }
            EVT_BATTERY => {
                let _ = child.modify_battery_level(value);
            }
            EVT_MUTE => {
                if let Err(e) = child.notify_mute_changed(value != 0) {
                    if !e.is_unsupported() {
                        warn!(selector, error = %e, "mute notification failed");
                    }
                }
            }
            EVT_DPI_BUTTON => {
                let change = match value {
                    0x01 => DpiChange::Up,
                    0x02 => DpiChange::Down,
                    _ => DpiChange::Cycle,
                };
                if let Err(e) = child.modify_dpi(change) {
                    if !e.is_unsupported() {
                        warn!(selector, error = %e, "DPI button failed");
                    }
                }
            }
            _ => debug!(event, "unhandled listener event"),
        }
    }
}

impl Driver for DongleDriver {
    fn class(&self) -> DeviceClass {
        self.inner.class
    }

    fn serial(&self) -> String {
        self.inner.serial.clone()
    }

    fn sub_devices(&self) -> Vec<SubDevice> {
        self.inner
            .children
            .lock()
            .unwrap()
            .iter()
            .map(|entry| SubDevice {
                channel_id: entry.selector,
                name: DeviceClass::from_pid(entry.product)
                    .map(|c| c.name().to_string())
                    .unwrap_or_else(|| format!("Product {:#06X}", entry.product)),
                description: "Paired wireless device".to_string(),
                ..Default::default()
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
        if let Some(listener) = inner.listener.lock().unwrap().take() {
            let _ = listener.join();
        }

        for entry in inner.children.lock().unwrap().iter() {
            if let Err(e) = entry.driver.stop() {
                warn!(selector = entry.selector, error = %e, "child stop failed");
            }
        }
        inner.io.set_mode(MODE_HARDWARE)?;
        info!(device = inner.class.name(), serial = %inner.serial, "dongle stopped");
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
        for entry in inner.children.lock().unwrap().iter() {
            entry.driver.stop_dirty();
        }
    }

    fn add_paired_device(&self, product_id: u16, driver: Arc<dyn Driver>) -> Result<()> {
        let mut children = self.inner.children.lock().unwrap();
        if children.iter().any(|entry| entry.product == product_id) {
            return Err(DeviceError::Validation(format!(
                "Product {:#06X} already paired",
                product_id
            )));
        }
        let selector = CHILD_SELECTOR_BASE + children.len() as u8;
        children.push(ChildEntry {
            product: product_id,
            selector,
            driver,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooling::{SpeedProfileStore, TemperatureProbe};
    use crate::protocol::transport::mock::{tagged_response, MockEndpoint};
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

    /// Paired table with one Katar Pro Wireless (serial "KPW01") and one
    /// unknown product.
    fn paired_payload() -> Vec<u8> {
        let mut payload = vec![2u8];
        // vendor 0x1B1C, product 0x1B94, type 0x02, id "KPW01"
        payload.extend_from_slice(&[0x1C, 0x1B, 0x00, 0x00, 0x94, 0x1B, 0x02, 5]);
        payload.extend_from_slice(b"KPW01");
        // unknown product 0xAAAA
        payload.extend_from_slice(&[0x1C, 0x1B, 0x00, 0x00, 0xAA, 0xAA, 0x02, 2]);
        payload.extend_from_slice(b"XX");
        payload
    }

    fn open_dongle(
        dir: &std::path::Path,
        listener: Option<Arc<Transport>>,
    ) -> (MockEndpoint, DongleDriver, Arc<Mutex<Vec<Arc<dyn Driver>>>>) {
        let mock = MockEndpoint::new();
        // set_mode ack, framed read (close, open, tagged read, close)
        mock.push_response(vec![0u8; 64]);
        mock.push_response(vec![0u8; 64]);
        mock.push_response(vec![0u8; 64]);
        mock.push_response(tagged_response(64, 5, DT_SUB_DEVICES, &paired_payload()));
        mock.push_response(vec![0u8; 64]);

        let transport = Arc::new(Transport::new(
            DeviceClass::SlipstreamDongle,
            Box::new(mock.clone()),
        ));
        let published: Arc<Mutex<Vec<Arc<dyn Driver>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink: ChildSink = {
            let published = Arc::clone(&published);
            Box::new(move |child| published.lock().unwrap().push(child))
        };
        let driver = DongleDriver::open(
            DeviceClass::SlipstreamDongle,
            "DONGLE1",
            transport,
            listener,
            context(dir),
            Some(sink),
        )
        .unwrap();
        (mock, driver, published)
    }

    #[test]
    fn test_decode_paired_devices() {
        let records = decode_paired_devices(&paired_payload());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].vendor, 0x1B1C);
        assert_eq!(records[0].product, 0x1B94);
        assert_eq!(records[0].serial, "KPW01");
        assert_eq!(records[0].selector, CHILD_SELECTOR_BASE);
        assert_eq!(records[1].selector, CHILD_SELECTOR_BASE + 1);
    }

    #[test]
    fn test_decode_truncated_table() {
        let mut payload = paired_payload();
        payload.truncate(10);
        assert!(decode_paired_devices(&payload).len() <= 1);
        assert!(decode_paired_devices(&[]).is_empty());
    }

    #[test]
    fn test_open_registers_known_children_only() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, driver, published) = open_dongle(dir.path(), None);

        let children = published.lock().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].class(), DeviceClass::KatarProWireless);
        assert_eq!(children[0].serial(), "KPW01");
        assert!(!children[0].is_connected());
        drop(children);

        let subs = driver.sub_devices();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].name, "Katar Pro Wireless");

        driver.stop().unwrap();
    }

    #[test]
    fn test_battery_and_disconnect_events() {
        let dir = tempfile::tempdir().unwrap();
        let listener_mock = MockEndpoint::new();
        let listener = Arc::new(Transport::new(
            DeviceClass::SlipstreamDongle,
            Box::new(listener_mock.clone()),
        ));
        let (_mock, driver, published) = open_dongle(dir.path(), Some(listener));

        // Battery packet for selector 0x08.
        let mut battery = vec![0u8; 64];
        battery[EVT_TYPE_OFFSET] = EVT_BATTERY;
        battery[EVT_ADDR_OFFSET] = CHILD_SELECTOR_BASE;
        battery[EVT_VALUE_OFFSET] = 77;
        listener_mock.push_response(battery);

        // Link-down packet.
        let mut down = vec![0u8; 64];
        down[EVT_TYPE_OFFSET] = EVT_LINK_STATE;
        down[EVT_ADDR_OFFSET] = CHILD_SELECTOR_BASE;
        down[EVT_VALUE_OFFSET] = 0x00;
        listener_mock.push_response(down);

        std::thread::sleep(Duration::from_millis(400));

        let children = published.lock().unwrap();
        assert_eq!(children[0].sub_devices()[0].battery_pct, Some(77));
        assert!(!children[0].is_connected());
        drop(children);

        driver.stop().unwrap();
    }

    #[test]
    fn test_hot_connect_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let listener_mock = MockEndpoint::new();
        let listener = Arc::new(Transport::new(
            DeviceClass::SlipstreamDongle,
            Box::new(listener_mock.clone()),
        ));
        let (mock, driver, published) = open_dongle(dir.path(), Some(listener));

        // Responses for the child connect sequence on the dongle handle:
        // hardware ack, software ack, firmware.
        mock.push_response(vec![0u8; 64]);
        mock.push_response(vec![0u8; 64]);
        let mut fw = vec![0u8; 64];
        fw[5..9].copy_from_slice(&[0x01, 0x00, 0x00, 0x00]);
        mock.push_response(fw);

        let mut up = vec![0u8; 64];
        up[EVT_TYPE_OFFSET] = EVT_LINK_STATE;
        up[EVT_ADDR_OFFSET] = CHILD_SELECTOR_BASE;
        up[EVT_VALUE_OFFSET] = LINK_CONNECTED;
        listener_mock.push_response(up);

        // Not yet connected before the settle delay elapses.
        std::thread::sleep(Duration::from_millis(500));
        assert!(!published.lock().unwrap()[0].is_connected());

        std::thread::sleep(Duration::from_millis(
            DeviceClass::SlipstreamDongle.connect_delay_ms() + 700,
        ));
        assert!(published.lock().unwrap()[0].is_connected());

        driver.stop().unwrap();
    }

    #[test]
    fn test_add_paired_device_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, driver, published) = open_dongle(dir.path(), None);

        let child = Arc::clone(&published.lock().unwrap()[0]);
        assert!(driver.add_paired_device(0x1B94, child).is_err());

        driver.stop().unwrap();
    }

    #[test]
    fn test_stop_stops_children_then_dongle() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, driver, _published) = open_dongle(dir.path(), None);

        driver.stop().unwrap();
        let writes = mock.writes();
        let last = writes.last().unwrap();
        // The dongle's own hardware-mode command is the final write.
        assert_eq!(&last[1..6], &[0x02, 0x01, 0x03, 0x00, 0x01]);

        // Idempotent.
        let count = writes.len();
        driver.stop().unwrap();
        assert_eq!(mock.writes().len(), count);
    }
}
