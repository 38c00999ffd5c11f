//! Host-side utilities.

pub mod sensors;

pub use sensors::{HostSensors, SystemSensors};
