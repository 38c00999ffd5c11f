//! HID command definitions and per-class configuration for the Corsair family.
//!
//! Every command is an out-report whose first byte is the 0x00 report id,
//! followed by a transport opcode, an endpoint selector and the payload,
//! padded to the class write size. Wire constants follow the family pattern
//! observed across iCUE Link hubs, Commander-family controllers, lighting
//! nodes and Slipstream dongles.

// =============================================================================
// Constants
// =============================================================================

/// Corsair USB vendor id.
pub const CORSAIR_VID: u16 = 0x1B1C;

/// iCUE Link System Hub.
pub const LINK_SYSTEM_HUB_PID: u16 = 0x0C3F;
/// Commander Core (bundled with Elite Capellix AIOs).
pub const COMMANDER_CORE_PID: u16 = 0x0C32;
/// Commander Core XT.
pub const COMMANDER_CORE_XT_PID: u16 = 0x0C2A;
/// Lighting Node Core.
pub const LIGHTING_NODE_CORE_PID: u16 = 0x0C1A;
/// Lighting Node Pro.
pub const LIGHTING_NODE_PRO_PID: u16 = 0x0C0B;
/// LT100 Smart Lighting Towers.
pub const LT100_PID: u16 = 0x0C23;
/// Harpoon RGB Pro (wired).
pub const HARPOON_RGB_PRO_PID: u16 = 0x1B75;
/// Katar Pro (wired).
pub const KATAR_PRO_PID: u16 = 0x1B93;
/// Katar Pro Wireless (child behind a Slipstream dongle).
pub const KATAR_PRO_WIRELESS_PID: u16 = 0x1B94;
/// M75 Air Wireless (child behind a Slipstream dongle).
pub const M75_AIR_WIRELESS_PID: u16 = 0x1BB8;
/// Multi-device Slipstream dongle.
pub const SLIPSTREAM_DONGLE_PID: u16 = 0x1BDC;
/// Wireless headset dongle.
pub const HEADSET_DONGLE_PID: u16 = 0x0A4B;
/// Dark Core mouse dongle.
pub const DARK_CORE_DONGLE_PID: u16 = 0x1B64;
/// SCUF controller dongle, revision 2.
pub const SCUF_DONGLE_V2_PID: u16 = 0x1BD0;
/// VOID v2 headset dongle.
pub const VOID_V2_DONGLE_PID: u16 = 0x0A6B;

// =============================================================================
// Transport opcodes (buffer byte 1, after the 0x00 report id)
// =============================================================================

/// Single-frame control command.
pub const OP_CONTROL: u8 = 0x08;
/// Dongle-routed control command.
pub const OP_DONGLE: u8 = 0x02;
/// Mouse wireless command.
pub const OP_MOUSE: u8 = 0x07;

// =============================================================================
// Command selectors
// =============================================================================

/// Open a logical endpoint: `[0x0D, 0x01, endpoint]`.
pub const CMD_OPEN_ENDPOINT: [u8; 2] = [0x0D, 0x01];
/// Open the color endpoint: `[0x0D, 0x00, endpoint]`.
pub const CMD_OPEN_COLOR_ENDPOINT: [u8; 2] = [0x0D, 0x00];
/// Close a logical endpoint: `[0x05, 0x01, endpoint]`.
pub const CMD_CLOSE_ENDPOINT: [u8; 2] = [0x05, 0x01];
/// Begin a (possibly chunked) endpoint write.
pub const CMD_WRITE: [u8; 2] = [0x06, 0x00];
/// Continuation chunk of an endpoint write.
pub const CMD_WRITE_NEXT: [u8; 2] = [0x06, 0x01];
/// Read staged data from the open endpoint.
pub const CMD_READ: [u8; 2] = [0x08, 0x09];

/// Set device mode: `[0x01, 0x03, 0x00, mode]` behind the class opcode.
pub const CMD_SET_MODE: [u8; 3] = [0x01, 0x03, 0x00];
/// Get device mode: the mode byte comes back as the first payload byte.
pub const CMD_GET_MODE: [u8; 3] = [0x02, 0x03, 0x00];
/// Get firmware version; response payload is `[major, minor, patch_lo, patch_hi]`.
pub const CMD_GET_FIRMWARE: [u8; 2] = [0x02, 0x13];

/// Hardware-autonomous mode byte.
pub const MODE_HARDWARE: u8 = 0x01;
/// Host-driven software mode byte.
pub const MODE_SOFTWARE: u8 = 0x02;

/// Dongle heartbeat selector.
pub const CMD_HEARTBEAT: [u8; 2] = [0x12, 0x00];
/// Dongle paired-device list query.
pub const CMD_GET_PAIRED: [u8; 2] = [0x36, 0x00];

/// Mouse: set the active DPI stage, payload LE u16 dots-per-inch.
pub const MOUSE_CMD_SET_DPI: [u8; 2] = [0x13, 0x02];
/// Mouse: set per-stage DPI indicator colors.
pub const MOUSE_CMD_SET_DPI_COLORS: [u8; 2] = [0x14, 0x02];
/// Mouse: install the idle sleep timer, payload LE u32 milliseconds.
pub const MOUSE_CMD_SLEEP_TIMER: [u8; 2] = [0x0E, 0x02];
/// Mouse: query battery level.
pub const MOUSE_CMD_GET_BATTERY: [u8; 2] = [0x0F, 0x02];

// =============================================================================
// Logical endpoints
// =============================================================================

/// Fan/port presence table.
pub const EP_FANS: u8 = 0x20;
/// Per-channel RPM readings.
pub const EP_SPEEDS: u8 = 0x17;
/// Per-probe temperature readings.
pub const EP_TEMPERATURES: u8 = 0x21;
/// Speed program upload.
pub const EP_SET_SPEED: u8 = 0x18;
/// LED color stream.
pub const EP_COLOR: u8 = 0x22;
/// LED channel configuration (external hub strand layout).
pub const EP_LED_CONFIG: u8 = 0x1E;
/// Sub-device / paired-device inventory.
pub const EP_SUB_DEVICES: u8 = 0x36;
/// Hardware-mode lighting pattern slot (Lighting Node family).
pub const EP_HW_PATTERN: u8 = 0x28;

// =============================================================================
// Response data types (2-byte tags at the class response offset)
// =============================================================================

/// RPM table.
pub const DT_SPEEDS: [u8; 2] = [0x06, 0x00];
/// Temperature table.
pub const DT_TEMPERATURES: [u8; 2] = [0x10, 0x00];
/// Fan/port presence table.
pub const DT_FANS: [u8; 2] = [0x09, 0x00];
/// Speed program acknowledge.
pub const DT_SET_SPEED: [u8; 2] = [0x07, 0x00];
/// Color stream acknowledge.
pub const DT_COLOR: [u8; 2] = [0x12, 0x00];
/// LED channel configuration.
pub const DT_LED_CONFIG: [u8; 2] = [0x0F, 0x00];
/// Sub-device inventory.
pub const DT_SUB_DEVICES: [u8; 2] = [0x21, 0x00];
/// Hardware pattern slot acknowledge.
pub const DT_HW_PATTERN: [u8; 2] = [0x0A, 0x00];

/// Speed-program status byte reporting a transient rejection; callers
/// retry a bounded number of times before dropping the tick.
pub const SPEED_STATUS_BUSY: u8 = 0x03;

// =============================================================================
// Listener events (unsolicited packets on the secondary interface)
// =============================================================================

/// Byte offset of the event type in a listener packet.
pub const EVT_TYPE_OFFSET: usize = 1;
/// Byte offset of the originating child endpoint selector.
pub const EVT_ADDR_OFFSET: usize = 2;
/// Byte offset of the event value.
pub const EVT_VALUE_OFFSET: usize = 4;

/// Wireless link-state change; value 0x02 = connected.
pub const EVT_LINK_STATE: u8 = 0x36;
/// Link-state value reporting an established connection.
pub const LINK_CONNECTED: u8 = 0x02;
/// Battery level report; value is a percentage.
pub const EVT_BATTERY: u8 = 0x0F;
/// Microphone mute toggle.
pub const EVT_MUTE: u8 = 0x45;
/// DPI / side button press; value 0x01 = up, 0x02 = down, 0x00 = cycle.
pub const EVT_DPI_BUTTON: u8 = 0x05;

// =============================================================================
// Device classes
// =============================================================================

/// Per-LED-channel color tag bytes for de-interleaved R/G/B uploads.
pub const COLOR_CHANNEL_RED: u8 = 0x00;
pub const COLOR_CHANNEL_GREEN: u8 = 0x01;
pub const COLOR_CHANNEL_BLUE: u8 = 0x02;

/// Device classes this daemon can orchestrate.
///
/// The class fixes the wire geometry (report sizes, chunking, response
/// offsets), the interface layout and the control-loop cadences. Everything
/// else a driver needs is derived from these accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    LinkSystemHub,
    CommanderCore,
    CommanderCoreXt,
    LightingNodeCore,
    LightingNodePro,
    Lt100,
    HarpoonRgbPro,
    KatarPro,
    KatarProWireless,
    M75AirWireless,
    HeadsetDongle,
    SlipstreamDongle,
    DarkCoreDongle,
    ScufDongleV2,
    VoidV2Dongle,
}

impl DeviceClass {
    /// Look up the class from a USB product id.
    pub fn from_pid(pid: u16) -> Option<Self> {
        match pid {
            LINK_SYSTEM_HUB_PID => Some(Self::LinkSystemHub),
            COMMANDER_CORE_PID => Some(Self::CommanderCore),
            COMMANDER_CORE_XT_PID => Some(Self::CommanderCoreXt),
            LIGHTING_NODE_CORE_PID => Some(Self::LightingNodeCore),
            LIGHTING_NODE_PRO_PID => Some(Self::LightingNodePro),
            LT100_PID => Some(Self::Lt100),
            HARPOON_RGB_PRO_PID => Some(Self::HarpoonRgbPro),
            KATAR_PRO_PID => Some(Self::KatarPro),
            KATAR_PRO_WIRELESS_PID => Some(Self::KatarProWireless),
            M75_AIR_WIRELESS_PID => Some(Self::M75AirWireless),
            HEADSET_DONGLE_PID => Some(Self::HeadsetDongle),
            SLIPSTREAM_DONGLE_PID => Some(Self::SlipstreamDongle),
            DARK_CORE_DONGLE_PID => Some(Self::DarkCoreDongle),
            SCUF_DONGLE_V2_PID => Some(Self::ScufDongleV2),
            VOID_V2_DONGLE_PID => Some(Self::VoidV2Dongle),
            _ => None,
        }
    }

    /// USB product id.
    pub fn pid(&self) -> u16 {
        match self {
            Self::LinkSystemHub => LINK_SYSTEM_HUB_PID,
            Self::CommanderCore => COMMANDER_CORE_PID,
            Self::CommanderCoreXt => COMMANDER_CORE_XT_PID,
            Self::LightingNodeCore => LIGHTING_NODE_CORE_PID,
            Self::LightingNodePro => LIGHTING_NODE_PRO_PID,
            Self::Lt100 => LT100_PID,
            Self::HarpoonRgbPro => HARPOON_RGB_PRO_PID,
            Self::KatarPro => KATAR_PRO_PID,
            Self::KatarProWireless => KATAR_PRO_WIRELESS_PID,
            Self::M75AirWireless => M75_AIR_WIRELESS_PID,
            Self::HeadsetDongle => HEADSET_DONGLE_PID,
            Self::SlipstreamDongle => SLIPSTREAM_DONGLE_PID,
            Self::DarkCoreDongle => DARK_CORE_DONGLE_PID,
            Self::ScufDongleV2 => SCUF_DONGLE_V2_PID,
            Self::VoidV2Dongle => VOID_V2_DONGLE_PID,
        }
    }

    /// Human-readable product name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LinkSystemHub => "iCUE Link System Hub",
            Self::CommanderCore => "Commander Core",
            Self::CommanderCoreXt => "Commander Core XT",
            Self::LightingNodeCore => "Lighting Node Core",
            Self::LightingNodePro => "Lighting Node Pro",
            Self::Lt100 => "LT100 Smart Lighting Towers",
            Self::HarpoonRgbPro => "Harpoon RGB Pro",
            Self::KatarPro => "Katar Pro",
            Self::KatarProWireless => "Katar Pro Wireless",
            Self::M75AirWireless => "M75 Air Wireless",
            Self::HeadsetDongle => "Wireless Headset Receiver",
            Self::SlipstreamDongle => "Slipstream Wireless Receiver",
            Self::DarkCoreDongle => "Dark Core Receiver",
            Self::ScufDongleV2 => "SCUF Wireless Receiver v2",
            Self::VoidV2Dongle => "VOID v2 Receiver",
        }
    }

    /// Out-report size, report id included.
    pub fn write_size(&self) -> usize {
        match self {
            Self::LinkSystemHub | Self::CommanderCoreXt => 385,
            Self::SlipstreamDongle
            | Self::HeadsetDongle
            | Self::DarkCoreDongle
            | Self::ScufDongleV2
            | Self::VoidV2Dongle => 97,
            _ => 65,
        }
    }

    /// In-report size.
    pub fn read_size(&self) -> usize {
        match self {
            Self::LinkSystemHub | Self::CommanderCoreXt => 384,
            _ => 64,
        }
    }

    /// Largest color payload slice carried by one chunk.
    pub fn max_chunk(&self) -> usize {
        match self {
            Self::LinkSystemHub | Self::CommanderCoreXt => 381,
            Self::LightingNodePro => 50,
            _ => 61,
        }
    }

    /// Byte offset of the 2-byte response data-type tag.
    pub fn response_offset(&self) -> usize {
        match self {
            Self::KatarProWireless
            | Self::M75AirWireless
            | Self::SlipstreamDongle
            | Self::HeadsetDongle
            | Self::DarkCoreDongle
            | Self::ScufDongleV2
            | Self::VoidV2Dongle => 5,
            _ => 4,
        }
    }

    /// Transport opcode placed after the report id.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::HarpoonRgbPro | Self::KatarPro | Self::KatarProWireless | Self::M75AirWireless => {
                OP_MOUSE
            }
            Self::SlipstreamDongle
            | Self::HeadsetDongle
            | Self::DarkCoreDongle
            | Self::ScufDongleV2
            | Self::VoidV2Dongle => OP_DONGLE,
            _ => OP_CONTROL,
        }
    }

    /// Whether stale input reports must be drained before each write.
    /// Firmware on dongle-routed handles and mice emits unsolicited reports.
    pub fn drain_before_write(&self) -> bool {
        matches!(
            self,
            Self::LinkSystemHub
                | Self::HarpoonRgbPro
                | Self::KatarPro
                | Self::KatarProWireless
                | Self::M75AirWireless
                | Self::SlipstreamDongle
                | Self::HeadsetDongle
                | Self::DarkCoreDongle
                | Self::ScufDongleV2
                | Self::VoidV2Dongle
        )
    }

    /// Primary control interface index.
    pub fn primary_interface(&self) -> i32 {
        match self {
            Self::HarpoonRgbPro | Self::KatarPro => 1,
            _ => 0,
        }
    }

    /// Secondary interface carrying unsolicited event packets, if any.
    pub fn listener_interface(&self) -> Option<i32> {
        match self {
            Self::SlipstreamDongle => Some(2),
            Self::HeadsetDongle | Self::VoidV2Dongle => Some(3),
            Self::DarkCoreDongle | Self::ScufDongleV2 => Some(4),
            Self::HarpoonRgbPro | Self::KatarPro => Some(2),
            _ => None,
        }
    }

    /// Resume-from-sleep trigger bytes, observed in order on the device
    /// mode byte, for classes that run a resume watcher. Firmware differs
    /// per class.
    pub fn resume_steps(&self) -> Option<(u8, u8)> {
        match self {
            Self::LinkSystemHub => Some((0x01, 0x00)),
            Self::CommanderCore | Self::CommanderCoreXt => Some((0x02, 0x01)),
            _ => None,
        }
    }

    /// Lighting render cadence in milliseconds.
    pub fn render_interval_ms(&self) -> u64 {
        match self {
            Self::LinkSystemHub => 10,
            Self::HarpoonRgbPro | Self::KatarPro | Self::KatarProWireless | Self::M75AirWireless => {
                20
            }
            _ => 40,
        }
    }

    /// Speed governor cadence in milliseconds.
    pub fn governor_interval_ms(&self) -> u64 {
        3000
    }

    /// Telemetry poll cadence in milliseconds.
    pub fn telemetry_interval_ms(&self) -> u64 {
        1000
    }

    /// Keep-alive cadence for wireless handles, in milliseconds.
    pub fn keepalive_interval_ms(&self) -> u64 {
        match self {
            Self::SlipstreamDongle | Self::HeadsetDongle | Self::VoidV2Dongle => 5000,
            _ => 10000,
        }
    }

    /// Delay between a link-state "connected" packet and the child
    /// initialization sequence, in milliseconds.
    pub fn connect_delay_ms(&self) -> u64 {
        3000
    }

    /// Whether the class echoes speed writes with a status byte that must
    /// be polled for transient rejections.
    pub fn echoes_speed_writes(&self) -> bool {
        matches!(self, Self::CommanderCore | Self::CommanderCoreXt)
    }

    /// Whether color frames are de-interleaved into per-channel R/G/B
    /// streams instead of one RGB stream.
    pub fn per_channel_color(&self) -> bool {
        matches!(
            self,
            Self::LightingNodeCore | Self::LightingNodePro | Self::Lt100
        )
    }

    /// Whether color-write continuations increment the first command byte
    /// instead of using the continuation sub-opcode.
    pub fn incrementing_color_chunks(&self) -> bool {
        matches!(self, Self::LightingNodePro | Self::Lt100)
    }

    pub fn has_fans(&self) -> bool {
        matches!(
            self,
            Self::LinkSystemHub | Self::CommanderCore | Self::CommanderCoreXt
        )
    }

    /// Classes with a liquid loop expose a pump channel and a coolant probe.
    pub fn has_liquid(&self) -> bool {
        matches!(self, Self::LinkSystemHub | Self::CommanderCore)
    }

    pub fn has_rgb(&self) -> bool {
        !matches!(
            self,
            Self::HeadsetDongle | Self::ScufDongleV2 | Self::VoidV2Dongle
        )
    }

    pub fn has_dpi(&self) -> bool {
        matches!(
            self,
            Self::HarpoonRgbPro | Self::KatarPro | Self::KatarProWireless | Self::M75AirWireless
        )
    }

    pub fn is_dongle(&self) -> bool {
        matches!(
            self,
            Self::SlipstreamDongle
                | Self::HeadsetDongle
                | Self::DarkCoreDongle
                | Self::ScufDongleV2
                | Self::VoidV2Dongle
        )
    }

    pub fn is_wireless_child(&self) -> bool {
        matches!(self, Self::KatarProWireless | Self::M75AirWireless)
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_from_known_pid() {
        assert_eq!(
            DeviceClass::from_pid(LINK_SYSTEM_HUB_PID),
            Some(DeviceClass::LinkSystemHub)
        );
        assert_eq!(
            DeviceClass::from_pid(SLIPSTREAM_DONGLE_PID),
            Some(DeviceClass::SlipstreamDongle)
        );
    }

    #[test]
    fn test_class_from_unknown_pid() {
        assert_eq!(DeviceClass::from_pid(0xFFFF), None);
    }

    #[test]
    fn test_pid_roundtrip() {
        for class in [
            DeviceClass::LinkSystemHub,
            DeviceClass::CommanderCore,
            DeviceClass::CommanderCoreXt,
            DeviceClass::LightingNodeCore,
            DeviceClass::LightingNodePro,
            DeviceClass::Lt100,
            DeviceClass::HarpoonRgbPro,
            DeviceClass::KatarPro,
            DeviceClass::KatarProWireless,
            DeviceClass::M75AirWireless,
            DeviceClass::HeadsetDongle,
            DeviceClass::SlipstreamDongle,
            DeviceClass::DarkCoreDongle,
            DeviceClass::ScufDongleV2,
            DeviceClass::VoidV2Dongle,
        ] {
            assert_eq!(DeviceClass::from_pid(class.pid()), Some(class));
        }
    }

    #[test]
    fn test_wire_geometry() {
        assert_eq!(DeviceClass::CommanderCore.write_size(), 65);
        assert_eq!(DeviceClass::CommanderCore.max_chunk(), 61);
        assert_eq!(DeviceClass::CommanderCoreXt.write_size(), 385);
        assert_eq!(DeviceClass::CommanderCoreXt.max_chunk(), 381);
        assert_eq!(DeviceClass::LightingNodePro.max_chunk(), 50);
    }

    #[test]
    fn test_response_offsets() {
        assert_eq!(DeviceClass::LinkSystemHub.response_offset(), 4);
        assert_eq!(DeviceClass::KatarProWireless.response_offset(), 5);
    }

    #[test]
    fn test_resume_steps_per_class() {
        assert_eq!(DeviceClass::LinkSystemHub.resume_steps(), Some((0x01, 0x00)));
        assert_eq!(DeviceClass::CommanderCore.resume_steps(), Some((0x02, 0x01)));
        assert_eq!(DeviceClass::KatarPro.resume_steps(), None);
    }

    #[test]
    fn test_capabilities() {
        assert!(DeviceClass::LinkSystemHub.has_fans());
        assert!(DeviceClass::LinkSystemHub.has_liquid());
        assert!(!DeviceClass::CommanderCoreXt.has_liquid());
        assert!(DeviceClass::KatarProWireless.has_dpi());
        assert!(DeviceClass::SlipstreamDongle.is_dongle());
        assert!(!DeviceClass::HeadsetDongle.has_rgb());
        assert!(DeviceClass::Lt100.per_channel_color());
    }
}
