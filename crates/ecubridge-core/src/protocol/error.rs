//! Protocol errors

use thiserror::Error;

/// Errors that can occur during detection or ECU communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Permission denied opening {0}")]
    PermissionDenied(String),

    #[error("Failed to open {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("Failed to configure serial port: {0}")]
    ConfigureFailed(String),

    #[error("Timed out waiting for ECU response")]
    Timeout,

    #[error("ECU dialect mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected to ECU")]
    NotConnected,

    #[error("No backend available for dialect '{0}'")]
    UnsupportedDialect(String),

    #[error("Invalid configuration page: {0}")]
    InvalidPage(String),

    #[error("Invalid response from ECU")]
    InvalidResponse,

    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
