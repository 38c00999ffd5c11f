//! Vendor HID protocol: framing, transport and endpoint vocabulary.

pub mod commands;
pub mod endpoint;
pub mod transport;

pub use commands::{DeviceClass, CORSAIR_VID, MODE_HARDWARE, MODE_SOFTWARE};
pub use endpoint::{EndpointIo, FirmwareVersion};
pub use transport::{HidEndpoint, Transport};
