//! Serial protocol communication
//!
//! Transport, framing and telemetry decoding for Speeduino-compatible ECUs.
//! Plain single-byte ASCII commands coexist with a checksummed binary
//! envelope used for page access.

pub mod commands;
mod error;
pub mod frame;
pub mod serial;
pub mod telemetry;

pub use commands::Command;
pub use error::ProtocolError;
pub use frame::{crc16, Frame, START_BYTE, STOP_BYTE};
pub use serial::{
    SerialFactory, SerialTransport, Transport, TransportFactory, SUPPORTED_BAUD_RATES,
};
pub use telemetry::{TelemetrySnapshot, OUTPUT_CHANNELS_SIZE};

/// Default baud rate for ECU communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Number of config pages Speeduino firmware exposes
pub const CONFIG_PAGE_COUNT: u8 = 15;

/// Largest config page, in bytes
pub const MAX_PAGE_SIZE: usize = 1024;
