//! Framed HID transport shared by every driver task.
//!
//! One `Transport` wraps one opened HID handle. The per-handle mutex
//! guarantees that a write and the read of its response stay paired, so at
//! most one request is outstanding per handle at any instant. Real devices
//! and mock devices share the `HidEndpoint` trait so driver logic is
//! testable without hardware.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{DeviceError, Result};
use crate::protocol::commands::DeviceClass;

/// Default HID read timeout in milliseconds.
const READ_TIMEOUT_MS: i32 = 2000;

/// Upper bound on the response-type matching loop.
const RESPONSE_MATCH_TIMEOUT_MS: u64 = 500;

/// Per-read timeout while hunting for a matching response type.
const RESPONSE_POLL_MS: i32 = 50;

// =============================================================================
// HidEndpoint
// =============================================================================

/// Abstraction over one opened HID interface.
///
/// Implemented by `hidapi::HidDevice` and by the in-memory mock used in
/// tests.
pub trait HidEndpoint: Send {
    /// Write one out-report. Returns the number of bytes written.
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Read one in-report, waiting up to `timeout_ms`. Returns 0 when no
    /// report arrived in time.
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize>;
}

impl HidEndpoint for hidapi::HidDevice {
    fn write(&self, data: &[u8]) -> Result<usize> {
        Ok(hidapi::HidDevice::write(self, data)?)
    }

    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        Ok(hidapi::HidDevice::read_timeout(self, buf, timeout_ms)?)
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Exclusive owner of one HID handle plus the class wire geometry.
pub struct Transport {
    class: DeviceClass,
    endpoint: Mutex<Box<dyn HidEndpoint>>,
}

impl Transport {
    pub fn new(class: DeviceClass, endpoint: Box<dyn HidEndpoint>) -> Self {
        Self {
            class,
            endpoint: Mutex::new(endpoint),
        }
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    /// Send one framed request and read its response.
    ///
    /// The buffer starts with the 0x00 report id, then `command` (which
    /// carries its own transport opcode), then `payload`, padded to the
    /// class write size. When `expected` is set, reads continue with a
    /// bounded timer until the two bytes at the class response offset match;
    /// elapsing that timer is a distinct error carrying the last buffer.
    ///
    /// The handle mutex is held across the drain, the write and every read,
    /// so concurrent tasks on the same handle are totally ordered.
    pub fn transfer(
        &self,
        command: &[u8],
        payload: &[u8],
        expected: Option<[u8; 2]>,
    ) -> Result<Vec<u8>> {
        let write_size = self.class.write_size();
        if 1 + command.len() + payload.len() > write_size {
            return Err(DeviceError::Validation(format!(
                "request of {} bytes exceeds write size {}",
                1 + command.len() + payload.len(),
                write_size
            )));
        }

        let mut buf = vec![0u8; write_size];
        buf[1..1 + command.len()].copy_from_slice(command);
        buf[1 + command.len()..1 + command.len() + payload.len()].copy_from_slice(payload);

        let endpoint = self.endpoint.lock().unwrap();

        if self.class.drain_before_write() {
            Self::drain(&**endpoint, self.class.read_size());
        }

        trace!(
            class = %self.class,
            command = format_args!("{:02X?}", command),
            len = payload.len(),
            "HID TX"
        );
        endpoint.write(&buf)?;

        let mut response = vec![0u8; self.class.read_size()];
        endpoint.read_timeout(&mut response, READ_TIMEOUT_MS)?;

        if let Some(expected) = expected {
            let offset = self.class.response_offset();
            let deadline = Instant::now() + Duration::from_millis(RESPONSE_MATCH_TIMEOUT_MS);

            while response[offset..offset + 2] != expected {
                if Instant::now() >= deadline {
                    return Err(DeviceError::ResponseTimeout {
                        expected,
                        last: response,
                    });
                }
                let n = endpoint.read_timeout(&mut response, RESPONSE_POLL_MS)?;
                if n == 0 {
                    continue;
                }
            }
        }

        trace!(
            class = %self.class,
            first = format_args!("{:02X?}", &response[..8.min(response.len())]),
            "HID RX"
        );
        Ok(response)
    }

    /// Read one unsolicited packet, used by listener tasks bound to a
    /// secondary interface. Returns `None` when nothing arrived in time.
    pub fn read_unsolicited(&self, timeout_ms: i32) -> Result<Option<Vec<u8>>> {
        let endpoint = self.endpoint.lock().unwrap();
        let mut buf = vec![0u8; self.class.read_size()];
        let n = endpoint.read_timeout(&mut buf, timeout_ms)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf))
    }

    /// Drop any queued input reports so the next read sees the response to
    /// the next write, not leftovers from prior commands.
    pub fn drain_input(&self) {
        let endpoint = self.endpoint.lock().unwrap();
        Self::drain(&**endpoint, self.class.read_size());
    }

    fn drain(endpoint: &dyn HidEndpoint, read_size: usize) {
        let mut buf = vec![0u8; read_size];
        loop {
            match endpoint.read_timeout(&mut buf, 1) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }
}

// =============================================================================
// Mock endpoint (tests)
// =============================================================================

/// A scripted HID endpoint for driver tests.
///
/// Responses queued with `push_response` are served to reads with a real
/// timeout; reads with a 1 ms timeout (the drain path) are served from the
/// separate `stale` queue so drains do not consume scripted responses.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Default)]
    struct MockState {
        writes: Vec<Vec<u8>>,
        responses: VecDeque<Vec<u8>>,
        stale: VecDeque<Vec<u8>>,
    }

    #[derive(Clone, Default)]
    pub struct MockEndpoint {
        state: Arc<Mutex<MockState>>,
    }

    impl MockEndpoint {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a response frame for the next non-drain read.
        pub fn push_response(&self, frame: Vec<u8>) {
            self.state.lock().unwrap().responses.push_back(frame);
        }

        /// Queue a stale frame that only the drain path will consume.
        pub fn push_stale(&self, frame: Vec<u8>) {
            self.state.lock().unwrap().stale.push_back(frame);
        }

        /// All frames written so far, report id included.
        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().writes.clone()
        }

        /// Number of frames written so far.
        pub fn write_count(&self) -> usize {
            self.state.lock().unwrap().writes.len()
        }
    }

    impl HidEndpoint for MockEndpoint {
        fn write(&self, data: &[u8]) -> Result<usize> {
            let mut state = self.state.lock().unwrap();
            state.writes.push(data.to_vec());
            Ok(data.len())
        }

        fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
            let mut state = self.state.lock().unwrap();
            let frame = if timeout_ms <= 1 {
                state.stale.pop_front()
            } else {
                state.responses.pop_front()
            };
            match frame {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }

    /// Build a response frame of `size` bytes with `tag` at `offset` and
    /// `data` right after the tag.
    pub fn tagged_response(size: usize, offset: usize, tag: [u8; 2], data: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; size];
        frame[offset..offset + 2].copy_from_slice(&tag);
        frame[offset + 2..offset + 2 + data.len()].copy_from_slice(data);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockEndpoint, tagged_response};
    use super::*;
    use crate::protocol::commands::{CMD_SET_MODE, DT_SPEEDS, MODE_SOFTWARE, OP_CONTROL};

    fn control_command() -> Vec<u8> {
        let mut cmd = vec![OP_CONTROL];
        cmd.extend_from_slice(&CMD_SET_MODE);
        cmd.push(MODE_SOFTWARE);
        cmd
    }

    #[test]
    fn test_frame_layout_and_padding() {
        let mock = MockEndpoint::new();
        let transport = Transport::new(DeviceClass::CommanderCore, Box::new(mock.clone()));
        mock.push_response(vec![0u8; 64]);

        transport.transfer(&control_command(), &[], None).unwrap();

        let writes = mock.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 65);
        assert_eq!(&writes[0][..6], &[0x00, 0x08, 0x01, 0x03, 0x00, 0x02]);
        assert!(writes[0][6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mock = MockEndpoint::new();
        let transport = Transport::new(DeviceClass::CommanderCore, Box::new(mock));
        let payload = vec![0u8; 70];
        let result = transport.transfer(&[0x08], &payload, None);
        assert!(matches!(result, Err(DeviceError::Validation(_))));
    }

    #[test]
    fn test_response_type_matching_skips_noise() {
        let mock = MockEndpoint::new();
        let transport = Transport::new(DeviceClass::CommanderCore, Box::new(mock.clone()));

        // First frame carries the wrong tag, second one matches.
        mock.push_response(tagged_response(64, 4, [0xAA, 0xBB], &[]));
        mock.push_response(tagged_response(64, 4, DT_SPEEDS, &[0x01, 0xC4, 0x09]));

        let response = transport
            .transfer(&control_command(), &[], Some(DT_SPEEDS))
            .unwrap();
        assert_eq!(&response[4..6], &DT_SPEEDS);
        assert_eq!(response[6], 0x01);
    }

    #[test]
    fn test_response_timeout_returns_last_buffer() {
        let mock = MockEndpoint::new();
        let transport = Transport::new(DeviceClass::CommanderCore, Box::new(mock.clone()));
        mock.push_response(tagged_response(64, 4, [0xAA, 0xBB], &[0x07]));

        let result = transport.transfer(&control_command(), &[], Some(DT_SPEEDS));
        match result {
            Err(DeviceError::ResponseTimeout { expected, last }) => {
                assert_eq!(expected, DT_SPEEDS);
                assert_eq!(&last[4..6], &[0xAA, 0xBB]);
            }
            other => panic!("expected response timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_drain_consumes_stale_reports_only() {
        let mock = MockEndpoint::new();
        // Katar Pro drains before every write.
        let transport = Transport::new(DeviceClass::KatarPro, Box::new(mock.clone()));
        mock.push_stale(vec![0xFF; 64]);
        mock.push_stale(vec![0xFE; 64]);
        mock.push_response(tagged_response(64, 4, DT_SPEEDS, &[]));

        let response = transport.transfer(&[0x07, 0x12], &[], None).unwrap();
        // The scripted response survived the drain.
        assert_eq!(&response[4..6], &DT_SPEEDS);
    }

    #[test]
    fn test_single_outstanding_request_per_handle() {
        use std::sync::Arc;
        use std::thread;

        let mock = MockEndpoint::new();
        let transport = Arc::new(Transport::new(
            DeviceClass::CommanderCore,
            Box::new(mock.clone()),
        ));
        for _ in 0..16 {
            mock.push_response(vec![0u8; 64]);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let transport = Arc::clone(&transport);
            handles.push(thread::spawn(move || {
                for _ in 0..4 {
                    transport.transfer(&[0x08, 0x01], &[], None).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // Every request produced exactly one write; none interleaved into
        // a torn frame.
        assert_eq!(mock.write_count(), 16);
        assert!(mock.writes().iter().all(|w| w.len() == 65));
    }
}
