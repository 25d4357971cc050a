//! Speeduino backend
//!
//! Speaks the TunerStudio-compatible Speeduino serial protocol over a
//! [`Transport`]. Status queries are plain single-byte ASCII commands; page
//! access rides the checksummed envelope.

use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{ConfigPage, EcuBackend};
use crate::detect::DialectId;
use crate::protocol::{
    frame::Frame, Command, ProtocolError, TelemetrySnapshot, Transport, TransportFactory,
    CONFIG_PAGE_COUNT, MAX_PAGE_SIZE, OUTPUT_CHANNELS_SIZE,
};

/// Settle delay between opening the port and the first handshake byte
const CONNECT_SETTLE: Duration = Duration::from_millis(100);

/// How long a flash burn takes before the ECU answers again
const DEFAULT_BURN_DELAY: Duration = Duration::from_millis(2000);

/// Read slice used while accumulating a reply. An idle slice after data
/// ends the read, so short replies don't pay the full command timeout.
const READ_SLICE: Duration = Duration::from_millis(50);

/// Largest handshake reply we read
const HANDSHAKE_BUFFER: usize = 64;

/// Newer firmware pads the output-channels reply past the documented layout
const TELEMETRY_BUFFER: usize = 130;

/// Marker every textual Speeduino identification reply contains
const SIGNATURE_MARKER: &[u8] = b"speeduino";

/// Backend for Speeduino ECUs
pub struct SpeeduinoBackend {
    factory: Arc<dyn TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    signature: Option<String>,
    firmware_version: Option<String>,
    last_snapshot: Option<TelemetrySnapshot>,
    settle: Duration,
    burn_delay: Duration,
    tooth_logging: bool,
}

impl SpeeduinoBackend {
    /// Create a disconnected backend over the given transport factory
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            transport: None,
            signature: None,
            firmware_version: None,
            last_snapshot: None,
            settle: CONNECT_SETTLE,
            burn_delay: DEFAULT_BURN_DELAY,
            tooth_logging: false,
        }
    }

    /// Override the post-open settle delay (tests use zero)
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Override the post-burn flash delay (tests use zero)
    pub fn with_burn_delay(mut self, delay: Duration) -> Self {
        self.burn_delay = delay;
        self
    }

    /// Whether tooth logging was started and not yet stopped
    pub fn is_tooth_logging(&self) -> bool {
        self.tooth_logging
    }

    fn transport_mut(&mut self) -> Result<&mut (dyn Transport + 'static), ProtocolError> {
        self.transport
            .as_deref_mut()
            .ok_or(ProtocolError::NotConnected)
    }

    /// Write a command (framed or plain) and read up to `expected_len`
    /// reply bytes within the command's timeout.
    fn exchange(
        &mut self,
        command: Command,
        data: &[u8],
        expected_len: usize,
    ) -> Result<Vec<u8>, ProtocolError> {
        let timeout = Duration::from_millis(command.timeout_ms());
        let expects_response = command.expects_response();
        let transport = self.transport_mut()?;

        let _ = transport.clear_buffers();

        if command.uses_envelope() {
            let frame = Frame::new(command.byte(), data.to_vec());
            transport.write_all(&frame.to_bytes())?;
        } else {
            let mut wire = Vec::with_capacity(1 + data.len());
            wire.push(command.byte());
            wire.extend_from_slice(data);
            transport.write_all(&wire)?;
        }

        if !expects_response || expected_len == 0 {
            return Ok(Vec::new());
        }

        // Firmware replies are often shorter than the caller's buffer, so
        // accumulate in slices and stop once the line goes idle after data
        let deadline = Instant::now() + timeout;
        let mut reply: Vec<u8> = Vec::new();

        while reply.len() < expected_len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let chunk = transport
                .read_with_timeout(expected_len - reply.len(), remaining.min(READ_SLICE))?;

            if chunk.is_empty() {
                if !reply.is_empty() {
                    break;
                }
                continue;
            }
            reply.extend_from_slice(&chunk);
        }

        if reply.is_empty() {
            return Err(ProtocolError::Timeout);
        }
        Ok(reply)
    }

    fn check_page_bounds(page: u8, offset: u16, length: usize) -> Result<(), ProtocolError> {
        if page >= CONFIG_PAGE_COUNT {
            return Err(ProtocolError::InvalidPage(format!(
                "page {page} out of range (0..{CONFIG_PAGE_COUNT})"
            )));
        }
        if length > MAX_PAGE_SIZE || offset as usize + length > MAX_PAGE_SIZE {
            return Err(ProtocolError::InvalidPage(format!(
                "offset {offset} + length {length} exceeds page size {MAX_PAGE_SIZE}"
            )));
        }
        Ok(())
    }

    /// Burn the given page to flash. The ECU goes quiet for the duration of
    /// the flash write, so no reply is read; we just wait it out.
    pub fn burn_page(&mut self, page: u8) -> Result<(), ProtocolError> {
        Self::check_page_bounds(page, 0, 0)?;
        self.exchange(Command::BurnPage, &[page], 0)?;
        if !self.burn_delay.is_zero() {
            std::thread::sleep(self.burn_delay);
        }
        info!(page, "page burned to flash");
        Ok(())
    }

    /// Read a whole page and validate it against the ECU-reported CRC32.
    ///
    /// A mismatch is reported as `ChecksumMismatch` and is retryable by the
    /// caller; this method never retries on its own.
    pub fn read_page_validated(
        &mut self,
        page: u8,
        length: u16,
    ) -> Result<ConfigPage, ProtocolError> {
        let expected = self.page_crc(page)?;
        let data = self.read_page(page, 0, length)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data);
        let actual = hasher.finalize();

        if actual != expected {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }

        Ok(ConfigPage {
            index: page,
            data,
            crc: Some(expected),
        })
    }

    /// Start streaming tooth log data
    pub fn start_tooth_logging(&mut self) -> Result<(), ProtocolError> {
        self.exchange(Command::StartToothLog, &[], 0)?;
        self.tooth_logging = true;
        Ok(())
    }

    /// Stop streaming tooth log data
    pub fn stop_tooth_logging(&mut self) -> Result<(), ProtocolError> {
        self.exchange(Command::StopToothLog, &[], 0)?;
        self.tooth_logging = false;
        Ok(())
    }
}

impl EcuBackend for SpeeduinoBackend {
    fn dialect(&self) -> DialectId {
        DialectId::Speeduino
    }

    fn connect(&mut self, path: &str, baud: u32) -> Result<(), ProtocolError> {
        if self.transport.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }

        debug!(path, baud, "connecting to Speeduino");
        let mut transport = self.factory.open(path, baud)?;

        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
        let _ = transport.clear_buffers();
        self.transport = Some(transport);

        // 'Q' both verifies the link and carries the firmware version
        let reply = match self.exchange(Command::QueryVersion, &[], HANDSHAKE_BUFFER) {
            Ok(reply) => reply,
            Err(e) => {
                self.disconnect();
                return Err(e);
            }
        };

        let textual = reply
            .windows(SIGNATURE_MARKER.len())
            .any(|w| w == SIGNATURE_MARKER);

        if textual {
            self.firmware_version = Some(String::from_utf8_lossy(&reply).trim().to_string());
        } else if reply.len() >= 5 {
            // USB-CDC adapters can answer in binary before the ASCII
            // identification string is flushed; a plausible-length reply
            // still counts as a live Speeduino.
            warn!(path, len = reply.len(), "binary handshake reply, version unknown");
        } else {
            self.disconnect();
            return Err(ProtocolError::ProtocolMismatch(format!(
                "device at {path} did not identify as a Speeduino"
            )));
        }

        // Signature is informative only; some firmware builds omit 'S'
        match self.exchange(Command::GetSignature, &[], HANDSHAKE_BUFFER) {
            Ok(reply) if !reply.is_empty() => {
                self.signature = Some(String::from_utf8_lossy(&reply).trim().to_string());
            }
            Ok(_) => {}
            Err(e) => warn!("signature query failed: {e}"),
        }

        info!(
            path,
            baud,
            signature = self.signature.as_deref().unwrap_or("<none>"),
            "connected to Speeduino"
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            debug!("Speeduino backend disconnected");
        }
        self.signature = None;
        self.firmware_version = None;
        self.tooth_logging = false;
    }

    fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_open())
    }

    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    fn firmware_version(&self) -> Option<&str> {
        self.firmware_version.as_deref()
    }

    fn telemetry(&mut self) -> Result<TelemetrySnapshot, ProtocolError> {
        let reply = self.exchange(Command::GetOutputChannels, &[], TELEMETRY_BUFFER)?;

        if reply.len() < OUTPUT_CHANNELS_SIZE {
            // Keep the previous snapshot; a short read is a failed poll,
            // never a partially updated one
            return Err(ProtocolError::InvalidResponse);
        }

        let snapshot = TelemetrySnapshot::decode(&reply)?;
        self.last_snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    fn last_telemetry(&self) -> Option<&TelemetrySnapshot> {
        self.last_snapshot.as_ref()
    }

    fn send_command(
        &mut self,
        command: Command,
        data: &[u8],
        expected_len: usize,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.exchange(command, data, expected_len)
    }

    fn read_page(&mut self, page: u8, offset: u16, length: u16) -> Result<Vec<u8>, ProtocolError> {
        Self::check_page_bounds(page, offset, length as usize)?;

        let mut payload = [0u8; 5];
        payload[0] = page;
        BigEndian::write_u16(&mut payload[1..3], offset);
        BigEndian::write_u16(&mut payload[3..5], length);

        let reply = self.exchange(Command::ReadPage, &payload, length as usize)?;
        if reply.len() < length as usize {
            debug!(
                page,
                got = reply.len(),
                want = length,
                "short page read reply"
            );
            return Err(ProtocolError::InvalidResponse);
        }

        Ok(reply[..length as usize].to_vec())
    }

    fn write_page(&mut self, page: u8, offset: u16, data: &[u8]) -> Result<(), ProtocolError> {
        Self::check_page_bounds(page, offset, data.len())?;

        let mut payload = Vec::with_capacity(5 + data.len());
        payload.push(page);
        let mut words = [0u8; 4];
        BigEndian::write_u16(&mut words[0..2], offset);
        BigEndian::write_u16(&mut words[2..4], data.len() as u16);
        payload.extend_from_slice(&words);
        payload.extend_from_slice(data);

        // Firmware acks with a single return code; tolerate silence since
        // older builds don't ack chunk writes at all
        match self.exchange(Command::WritePage, &payload, 1) {
            Ok(_) | Err(ProtocolError::Timeout) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn page_crc(&mut self, page: u8) -> Result<u32, ProtocolError> {
        Self::check_page_bounds(page, 0, 0)?;

        let reply = self.exchange(Command::GetPageCrc, &[page], 4)?;
        if reply.len() < 4 {
            return Err(ProtocolError::InvalidResponse);
        }
        Ok(BigEndian::read_u32(&reply[..4]))
    }
}

impl Drop for SpeeduinoBackend {
    fn drop(&mut self) {
        self.disconnect();
    }
}
