//! Endpoint I/O on top of the framed transport.
//!
//! Translates the device vocabulary of *open endpoint / write / read /
//! close endpoint* and *color-endpoint open / color write* into transport
//! calls, chunking color payloads that exceed the class chunk size.
//!
//! Dongle-routed children get the same vocabulary behind a two-byte route
//! prefix; the child never touches the dongle handle directly.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{DeviceError, Result};
use crate::protocol::commands::{
    CMD_CLOSE_ENDPOINT, CMD_GET_FIRMWARE, CMD_GET_MODE, CMD_OPEN_COLOR_ENDPOINT,
    CMD_OPEN_ENDPOINT, CMD_READ, CMD_SET_MODE, CMD_WRITE, CMD_WRITE_NEXT, COLOR_CHANNEL_BLUE,
    COLOR_CHANNEL_GREEN, COLOR_CHANNEL_RED, DT_COLOR, EP_COLOR, OP_DONGLE,
};
use crate::protocol::transport::Transport;

/// Firmware version as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u16,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// =============================================================================
// EndpointIo
// =============================================================================

/// Endpoint-level view of one device (or one routed wireless child).
pub struct EndpointIo {
    transport: Arc<Transport>,
    /// Dongle route prefix: `[OP_DONGLE, child selector]` for children.
    route: Vec<u8>,
}

impl EndpointIo {
    /// Endpoint I/O for a directly attached device.
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            route: Vec::new(),
        }
    }

    /// Endpoint I/O for a wireless child reached through its dongle.
    pub fn routed(transport: Arc<Transport>, selector: u8) -> Self {
        Self {
            transport,
            route: vec![OP_DONGLE, selector],
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    fn command(&self, parts: &[&[u8]]) -> Vec<u8> {
        let mut cmd = self.route.clone();
        for part in parts {
            cmd.extend_from_slice(part);
        }
        cmd
    }

    /// First payload byte offset in a response buffer.
    pub fn payload_offset(&self) -> usize {
        self.transport.class().response_offset() + 2
    }

    // -------------------------------------------------------------------------
    // Control commands
    // -------------------------------------------------------------------------

    /// Issue a control command behind the class transport opcode.
    pub fn control(
        &self,
        selector: &[u8],
        payload: &[u8],
        expected: Option<[u8; 2]>,
    ) -> Result<Vec<u8>> {
        let opcode = [self.transport.class().opcode()];
        let cmd = self.command(&[&opcode, selector]);
        self.transport.transfer(&cmd, payload, expected)
    }

    /// Flip the device between hardware and software mode.
    pub fn set_mode(&self, mode: u8) -> Result<()> {
        self.control(&CMD_SET_MODE, &[mode], None)?;
        Ok(())
    }

    /// Read the current device-mode byte.
    pub fn get_mode(&self) -> Result<u8> {
        let response = self.control(&CMD_GET_MODE, &[], None)?;
        Ok(response[self.payload_offset()])
    }

    /// Read and decode the firmware version.
    pub fn get_firmware(&self) -> Result<FirmwareVersion> {
        let response = self.control(&CMD_GET_FIRMWARE, &[], None)?;
        let at = self.transport.class().response_offset();
        if response.len() < at + 4 {
            return Err(DeviceError::InvalidResponse {
                message: "firmware response too short".into(),
            });
        }
        Ok(FirmwareVersion {
            major: response[at],
            minor: response[at + 1],
            patch: LittleEndian::read_u16(&response[at + 2..at + 4]),
        })
    }

    // -------------------------------------------------------------------------
    // Framed endpoint reads
    // -------------------------------------------------------------------------

    fn open(&self, endpoint: u8) -> Result<()> {
        let cmd = self.command(&[&CMD_OPEN_ENDPOINT, &[endpoint]]);
        self.transport.transfer(&cmd, &[], None)?;
        Ok(())
    }

    fn close(&self, endpoint: u8) -> Result<()> {
        let cmd = self.command(&[&CMD_CLOSE_ENDPOINT, &[endpoint]]);
        self.transport.transfer(&cmd, &[], None)?;
        Ok(())
    }

    /// Read typed data from a logical endpoint.
    ///
    /// Runs the family handshake: close, open, optional request write, read
    /// until the expected data type appears, close. Returns the raw response
    /// buffer; payload bytes start at `payload_offset()`.
    pub fn framed_read(
        &self,
        endpoint: u8,
        data_type: [u8; 2],
        request: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        self.close(endpoint)?;
        self.open(endpoint)?;
        if let Some(request) = request {
            let cmd = self.command(&[&CMD_WRITE]);
            self.transport.transfer(&cmd, request, None)?;
        }
        let cmd = self.command(&[&CMD_READ]);
        let result = self.transport.transfer(&cmd, &[], Some(data_type));
        // The endpoint must be closed again even when the read timed out.
        self.close(endpoint)?;
        result
    }

    /// Write a typed payload to a logical endpoint, chunked if needed.
    /// Returns the response to the final chunk.
    pub fn framed_write(
        &self,
        endpoint: u8,
        data_type: [u8; 2],
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        self.close(endpoint)?;
        self.open(endpoint)?;
        let result = self.write_chunked(data_type, payload);
        self.close(endpoint)?;
        result
    }

    // -------------------------------------------------------------------------
    // Color stream
    // -------------------------------------------------------------------------

    /// One-time color endpoint setup at driver init. Thereafter frames go
    /// out as raw chunked packets without the open/close dance.
    pub fn init_color_endpoint(&self) -> Result<()> {
        self.close(EP_COLOR)?;
        let cmd = self.command(&[&CMD_OPEN_COLOR_ENDPOINT, &[EP_COLOR]]);
        self.transport.transfer(&cmd, &[], None)?;
        Ok(())
    }

    /// Send one interleaved R,G,B frame to the color endpoint.
    pub fn write_color(&self, frame: &[u8]) -> Result<()> {
        self.write_chunked(DT_COLOR, frame)?;
        Ok(())
    }

    /// Send one frame as three per-channel streams, each tagged with its
    /// channel byte. Used by hubs that take de-interleaved uploads.
    pub fn write_color_channels(&self, red: &[u8], green: &[u8], blue: &[u8]) -> Result<()> {
        for (channel, data) in [
            (COLOR_CHANNEL_RED, red),
            (COLOR_CHANNEL_GREEN, green),
            (COLOR_CHANNEL_BLUE, blue),
        ] {
            self.write_chunked([DT_COLOR[0], channel], data)?;
        }
        Ok(())
    }

    /// Chunked write of `length prefix + data type + payload`.
    ///
    /// The first chunk carries the begin-write opcode; continuations use the
    /// continuation sub-opcode, or an incremented first byte on classes with
    /// that quirk.
    fn write_chunked(&self, data_type: [u8; 2], payload: &[u8]) -> Result<Vec<u8>> {
        let mut framed = Vec::with_capacity(payload.len() + 4);
        let mut prefix = [0u8; 2];
        LittleEndian::write_u16(&mut prefix, (payload.len() + 2) as u16);
        framed.extend_from_slice(&prefix);
        framed.extend_from_slice(&data_type);
        framed.extend_from_slice(payload);

        let chunk_size = self.transport.class().max_chunk();
        let incrementing = self.transport.class().incrementing_color_chunks();
        let mut response = Vec::new();

        for (index, chunk) in framed.chunks(chunk_size).enumerate() {
            let opcode = if index == 0 {
                CMD_WRITE
            } else if incrementing {
                [CMD_WRITE[0] + index as u8, CMD_WRITE[1]]
            } else {
                CMD_WRITE_NEXT
            };
            let cmd = self.command(&[&opcode]);
            response = self.transport.transfer(&cmd, chunk, None)?;
        }
        Ok(response)
    }
}
