//! ECU backends
//!
//! A backend owns the live link to one ECU and speaks that ECU's dialect.
//! The connection manager only sees the [`EcuBackend`] trait, so adding a
//! dialect means adding one implementation, not touching the manager.

mod speeduino;

pub use speeduino::SpeeduinoBackend;

use crate::detect::DialectId;
use crate::protocol::{Command, ProtocolError, TelemetrySnapshot};

/// One page of ECU-resident configuration memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPage {
    /// Page index
    pub index: u8,
    /// Page contents
    pub data: Vec<u8>,
    /// CRC32 reported by the ECU for this page, when fetched
    pub crc: Option<u32>,
}

/// Uniform interface every dialect backend implements.
///
/// A backend is exclusively owned by its session; after `disconnect` no
/// caller may touch the underlying transport again.
pub trait EcuBackend: Send {
    /// Dialect this backend speaks
    fn dialect(&self) -> DialectId;

    /// Open the transport and perform the dialect's handshake
    fn connect(&mut self, path: &str, baud: u32) -> Result<(), ProtocolError>;

    /// Close the transport; idempotent
    fn disconnect(&mut self);

    /// Whether the underlying transport is open
    fn is_connected(&self) -> bool;

    /// ECU signature captured during the handshake
    fn signature(&self) -> Option<&str>;

    /// Firmware version string captured during the handshake
    fn firmware_version(&self) -> Option<&str>;

    /// Poll one telemetry snapshot. On failure the previously decoded
    /// snapshot stays available via [`Self::last_telemetry`].
    fn telemetry(&mut self) -> Result<TelemetrySnapshot, ProtocolError>;

    /// The most recent successfully decoded snapshot, if any
    fn last_telemetry(&self) -> Option<&TelemetrySnapshot>;

    /// Send a protocol command with optional payload and read up to
    /// `expected_len` reply bytes
    fn send_command(
        &mut self,
        command: Command,
        data: &[u8],
        expected_len: usize,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Read `length` bytes of a config page starting at `offset`
    fn read_page(&mut self, page: u8, offset: u16, length: u16) -> Result<Vec<u8>, ProtocolError>;

    /// Write a chunk of a config page
    fn write_page(&mut self, page: u8, offset: u16, data: &[u8]) -> Result<(), ProtocolError>;

    /// Ask the ECU for a page's CRC32
    fn page_crc(&mut self, page: u8) -> Result<u32, ProtocolError>;
}
