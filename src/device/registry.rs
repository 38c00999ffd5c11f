//! Device registry: enumeration, concurrent driver construction and clean
//! shutdown.
//!
//! The registry initializes HID once, filters the enumeration to one
//! primary interface per `(serial, product)`, and constructs one driver
//! per device on its own thread. Unknown products are logged and skipped;
//! a driver that fails to construct is logged and skipped as well. On
//! shutdown every driver's `stop` runs before the HID subsystem goes away.

use std::collections::HashSet;
use std::ffi::CString;
use std::sync::{Arc, Mutex};

use hidapi::HidApi;
use tracing::{debug, error, info, warn};

use crate::device::dongle::DongleDriver;
use crate::device::hub::HubDriver;
use crate::device::lighting_node::LightingNodeDriver;
use crate::device::mouse::MouseDriver;
use crate::device::{DeviceContext, Driver};
use crate::error::{DeviceError, Result};
use crate::protocol::{DeviceClass, Transport, CORSAIR_VID};

struct Candidate {
    class: DeviceClass,
    serial: String,
    path: CString,
    listener_path: Option<CString>,
}

/// Owner of the HID subsystem and the open driver set.
pub struct Registry {
    api: Mutex<Option<HidApi>>,
    drivers: Arc<Mutex<Vec<Arc<dyn Driver>>>>,
}

impl Registry {
    /// Enumerate matching devices and construct their drivers.
    ///
    /// HID library failure and a missing serial on an enumerated device are
    /// fatal; everything else is logged and skipped.
    pub fn initialize(ctx: Arc<DeviceContext>) -> Result<Self> {
        let api = HidApi::new()?;
        let candidates = collect_candidates(&api)?;
        info!(count = candidates.len(), "device enumeration complete");

        // Handles open on this thread; the HID API is not a shared resource
        // worth contending over. Construction, which does the slow protocol
        // negotiation, runs one thread per device.
        let mut prepared = Vec::new();
        for candidate in candidates {
            let device = match api.open_path(&candidate.path) {
                Ok(device) => device,
                Err(e) => {
                    error!(
                        device = candidate.class.name(),
                        serial = %candidate.serial,
                        error = %e,
                        "open failed; device skipped"
                    );
                    continue;
                }
            };
            let transport = Arc::new(Transport::new(candidate.class, Box::new(device)));
            let listener = candidate.listener_path.as_ref().and_then(|path| {
                match api.open_path(path) {
                    Ok(device) => Some(Arc::new(Transport::new(
                        candidate.class,
                        Box::new(device),
                    ))),
                    Err(e) => {
                        warn!(
                            device = candidate.class.name(),
                            error = %e,
                            "listener interface unavailable"
                        );
                        None
                    }
                }
            });
            prepared.push((candidate.class, candidate.serial, transport, listener));
        }

        let drivers: Arc<Mutex<Vec<Arc<dyn Driver>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut joins = Vec::new();
        for (class, serial, transport, listener) in prepared {
            let ctx = Arc::clone(&ctx);
            let drivers = Arc::clone(&drivers);
            joins.push(std::thread::spawn(move || {
                match construct(class, &serial, transport, listener, ctx, &drivers) {
                    Ok(driver) => drivers.lock().unwrap().push(driver),
                    Err(e) => {
                        error!(device = class.name(), serial = %serial, error = %e, "driver construction failed; device skipped")
                    }
                }
            }));
        }
        for join in joins {
            let _ = join.join();
        }

        info!(count = drivers.lock().unwrap().len(), "drivers online");
        Ok(Self {
            api: Mutex::new(Some(api)),
            drivers,
        })
    }

    /// Snapshot of the open driver set, dongle children included.
    pub fn drivers(&self) -> Vec<Arc<dyn Driver>> {
        self.drivers.lock().unwrap().clone()
    }

    /// Find a driver by device serial.
    pub fn driver_by_serial(&self, serial: &str) -> Option<Arc<dyn Driver>> {
        self.drivers
            .lock()
            .unwrap()
            .iter()
            .find(|driver| driver.serial() == serial)
            .cloned()
    }

    /// Stop every driver, then shut the HID subsystem down. The last
    /// command on every handle is its hardware-mode command.
    pub fn stop_all(&self) {
        for driver in self.drivers.lock().unwrap().drain(..) {
            if let Err(e) = driver.stop() {
                error!(device = driver.class().name(), serial = %driver.serial(), error = %e, "stop failed");
            }
        }
        *self.api.lock().unwrap() = None;
    }

    /// Best-effort teardown when the host is going down hard.
    pub fn stop_all_dirty(&self) {
        for driver in self.drivers.lock().unwrap().drain(..) {
            driver.stop_dirty();
        }
        *self.api.lock().unwrap() = None;
    }

    #[cfg(test)]
    pub(crate) fn from_drivers(drivers: Vec<Arc<dyn Driver>>) -> Self {
        Self {
            api: Mutex::new(None),
            drivers: Arc::new(Mutex::new(drivers)),
        }
    }
}

/// Filter the enumeration to one primary interface per (serial, product)
/// and remember each device's listener interface path.
fn collect_candidates(api: &HidApi) -> Result<Vec<Candidate>> {
    let mut seen: HashSet<(String, u16)> = HashSet::new();
    let mut candidates = Vec::new();

    for info in api.device_list() {
        if info.vendor_id() != CORSAIR_VID {
            continue;
        }
        let Some(class) = DeviceClass::from_pid(info.product_id()) else {
            debug!(
                product = format_args!("{:#06X}", info.product_id()),
                "unknown product skipped"
            );
            continue;
        };
        // Wireless children enumerate behind their dongle, not over USB.
        if class.is_wireless_child() {
            continue;
        }
        if info.interface_number() != class.primary_interface() {
            continue;
        }
        let Some(serial) = info.serial_number().map(str::to_string) else {
            return Err(DeviceError::InvalidResponse {
                message: format!(
                    "device {:#06X} enumerated without a serial number",
                    info.product_id()
                ),
            });
        };
        if !seen.insert((serial.clone(), info.product_id())) {
            continue;
        }

        let listener_path = class.listener_interface().and_then(|interface| {
            api.device_list()
                .find(|other| {
                    other.vendor_id() == CORSAIR_VID
                        && other.product_id() == info.product_id()
                        && other.serial_number() == info.serial_number()
                        && other.interface_number() == interface
                })
                .map(|other| other.path().to_owned())
        });

        candidates.push(Candidate {
            class,
            serial,
            path: info.path().to_owned(),
            listener_path,
        });
    }

    Ok(candidates)
}

fn construct(
    class: DeviceClass,
    serial: &str,
    transport: Arc<Transport>,
    listener: Option<Arc<Transport>>,
    ctx: Arc<DeviceContext>,
    drivers: &Arc<Mutex<Vec<Arc<dyn Driver>>>>,
) -> Result<Arc<dyn Driver>> {
    let driver: Arc<dyn Driver> = match class {
        DeviceClass::LinkSystemHub | DeviceClass::CommanderCore | DeviceClass::CommanderCoreXt => {
            Arc::new(HubDriver::open(class, serial, transport, ctx)?)
        }
        DeviceClass::LightingNodeCore | DeviceClass::LightingNodePro | DeviceClass::Lt100 => {
            Arc::new(LightingNodeDriver::open(class, serial, transport, ctx)?)
        }
        DeviceClass::HarpoonRgbPro | DeviceClass::KatarPro => Arc::new(MouseDriver::open_wired(
            class, serial, transport, listener, ctx,
        )?),
        DeviceClass::SlipstreamDongle
        | DeviceClass::HeadsetDongle
        | DeviceClass::DarkCoreDongle
        | DeviceClass::ScufDongleV2
        | DeviceClass::VoidV2Dongle => {
            let published = Arc::clone(drivers);
            Arc::new(DongleDriver::open(
                class,
                serial,
                transport,
                listener,
                ctx,
                Some(Box::new(move |child| {
                    published.lock().unwrap().push(child)
                })),
            )?)
        }
        DeviceClass::KatarProWireless | DeviceClass::M75AirWireless => {
            return Err(DeviceError::Validation(
                "wireless children are constructed by their dongle".into(),
            ));
        }
    };
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubDriver {
        serial: String,
        stops: Arc<AtomicUsize>,
    }

    impl Driver for StubDriver {
        fn class(&self) -> DeviceClass {
            DeviceClass::CommanderCore
        }

        fn serial(&self) -> String {
            self.serial.clone()
        }

        fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop_dirty(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_stop_all_stops_every_driver() {
        let stops = Arc::new(AtomicUsize::new(0));
        let registry = Registry::from_drivers(vec![
            Arc::new(StubDriver {
                serial: "A".into(),
                stops: Arc::clone(&stops),
            }),
            Arc::new(StubDriver {
                serial: "B".into(),
                stops: Arc::clone(&stops),
            }),
        ]);

        assert!(registry.driver_by_serial("B").is_some());
        assert!(registry.driver_by_serial("C").is_none());

        registry.stop_all();
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert!(registry.drivers().is_empty());
    }
}
