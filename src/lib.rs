//! Corsair Link Devices Library
//!
//! Rust drivers for Corsair iCUE Link hubs, Commander-family controllers,
//! lighting nodes, AIO coolers, mice and Slipstream wireless dongles.
//!
//! # Features
//!
//! - Place controllers in software mode and restore hardware mode on exit
//! - Temperature-driven fan and pump control with persisted speed profiles
//! - Per-LED lighting render engine with atomic profile restarts
//! - Wireless dongle multiplexing with hot attach/detach of children
//! - JSON device profiles and ZIP backup/restore of the database
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use corsair_link_devices::cooling::SpeedProfileStore;
//! use corsair_link_devices::device::registry::Registry;
//! use corsair_link_devices::device::DeviceContext;
//! use corsair_link_devices::storage::{Database, ProfileStore, RgbStore};
//! use corsair_link_devices::utils::HostSensors;
//! use corsair_link_devices::Driver;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let database = Database::new("./database".into());
//!     database.ensure_layout()?;
//!     let speeds = SpeedProfileStore::new(database.temperatures_dir());
//!     speeds.ensure_builtins()?;
//!
//!     let registry = Registry::initialize(Arc::new(DeviceContext {
//!         profiles: ProfileStore::new(database.profiles_dir()),
//!         rgb: RgbStore::new(database.rgb_dir()),
//!         speeds,
//!         probe: Arc::new(HostSensors::new("")),
//!     }))?;
//!
//!     for driver in registry.drivers() {
//!         println!("{} ({})", driver.product_name(), driver.serial());
//!     }
//!
//!     registry.stop_all();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod cooling;
pub mod device;
pub mod error;
pub mod lighting;
pub mod protocol;
pub mod storage;
pub mod utils;

// Re-exports for convenience
pub use device::registry::Registry;
pub use device::{DeviceContext, Driver, SubDevice};
pub use error::{DeviceError, Result};
pub use protocol::DeviceClass;
