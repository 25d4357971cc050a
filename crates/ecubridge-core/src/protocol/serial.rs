//! Serial transport
//!
//! Low-level serial port access for ECU probing and communication.
//! This layer is mechanism only: open/configure, bounded reads, full
//! writes and close. Retry and protocol logic live above it.

use serialport::SerialPort;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::ProtocolError;

/// Poll interval for non-blocking reads, matching the responsiveness the
/// connection loop needs without spinning a core.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Internal timeout handed to the serialport crate. Reads are driven by
/// `bytes_to_read()` polling, so this only bounds the rare blocking call.
const PORT_IO_TIMEOUT: Duration = Duration::from_millis(100);

/// Candidate device paths probed during detection. Paths that do not exist
/// on the running host are skipped.
const DEVICE_PATH_CANDIDATES: &[&str] = &[
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    "/dev/ttyUSB2",
    "/dev/ttyUSB3",
    "/dev/ttyACM0",
    "/dev/ttyACM1",
    "/dev/ttyACM2",
    "/dev/ttyACM3",
    "/dev/ttyS0",
    "/dev/ttyS1",
    "/dev/ttyS2",
    "/dev/ttyS3",
    // Raspberry Pi onboard UARTs
    "/dev/ttyAMA0",
    "/dev/ttyAMA1",
];

/// Baud rates the library supports for manual connections
pub const SUPPORTED_BAUD_RATES: &[u32] = &[9600, 19200, 38400, 57600, 115200, 230400];

/// A byte-stream transport to an ECU.
///
/// `SerialTransport` is the production implementation; tests drive the
/// detection engine and backends with synthetic implementations.
pub trait Transport: Send {
    /// Write all bytes or fail. Partial writes are treated as failure.
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError>;

    /// Read up to `max_len` bytes, returning whatever accumulated before
    /// `timeout` elapsed. An empty result is not an error.
    fn read_with_timeout(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Discard any buffered input/output
    fn clear_buffers(&mut self) -> Result<(), ProtocolError>;

    /// Whether the underlying device is still open
    fn is_open(&self) -> bool;

    /// Close the transport; idempotent
    fn close(&mut self);
}

/// Opens transports and enumerates candidate devices.
///
/// The detection engine and connection manager only see this trait, so a
/// whole scan can run against mock hardware in tests.
pub trait TransportFactory: Send + Sync {
    /// Open a transport at the given path and baud rate
    fn open(&self, path: &str, baud: u32) -> Result<Box<dyn Transport>, ProtocolError>;

    /// Enumerate candidate device paths, deterministically ordered.
    /// Failure here is a scan-infrastructure error, not "no ECU found".
    fn enumerate(&self) -> Result<Vec<String>, ProtocolError>;

    /// Whether a device path exists on this host
    fn exists(&self, path: &str) -> bool;
}

/// Helper used to sort device names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// Production factory backed by the `serialport` crate and the host's /dev tree
#[derive(Debug, Default, Clone)]
pub struct SerialFactory;

impl SerialFactory {
    /// Create a new factory
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for SerialFactory {
    fn open(&self, path: &str, baud: u32) -> Result<Box<dyn Transport>, ProtocolError> {
        Ok(Box::new(SerialTransport::open(path, baud)?))
    }

    fn enumerate(&self) -> Result<Vec<String>, ProtocolError> {
        // Merge the serialport API's view with the fixed candidate list;
        // the API misses some CDC-ACM adapters on older kernels.
        let mut names: BTreeSet<String> = BTreeSet::new();

        for info in serialport::available_ports()
            .unwrap_or_default()
            .into_iter()
        {
            names.insert(info.port_name);
        }

        for candidate in DEVICE_PATH_CANDIDATES {
            if Path::new(candidate).exists() {
                names.insert((*candidate).to_string());
            }
        }

        let mut v: Vec<String> = names.into_iter().collect();
        v.sort_by_key(|n| port_sort_key(n));
        Ok(v)
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }
}

/// A serial connection configured for ECU communication (8N1, raw)
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    path: String,
}

impl SerialTransport {
    /// Open and configure a serial device at the given baud rate
    pub fn open(path: &str, baud: u32) -> Result<Self, ProtocolError> {
        let mut port = serialport::new(path, baud)
            .timeout(PORT_IO_TIMEOUT)
            .open()
            .map_err(|e| classify_open_error(path, &e))?;

        configure_port(port.as_mut())?;

        debug!(path, baud, "serial port opened");
        Ok(Self {
            port: Some(port),
            path: path.to_string(),
        })
    }

    /// Device path this transport was opened on
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Map a serialport open failure onto the error taxonomy
fn classify_open_error(path: &str, err: &serialport::Error) -> ProtocolError {
    match &err.kind {
        serialport::ErrorKind::NoDevice => ProtocolError::DeviceNotFound(path.to_string()),
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            ProtocolError::DeviceNotFound(path.to_string())
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            ProtocolError::PermissionDenied(path.to_string())
        }
        _ => ProtocolError::OpenFailed {
            path: path.to_string(),
            reason: err.to_string(),
        },
    }
}

/// Configure a serial port for ECU communication: 8 data bits, no parity,
/// one stop bit, no flow control.
fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| ProtocolError::ConfigureFailed(e.to_string()))?;
    port.set_parity(serialport::Parity::None)
        .map_err(|e| ProtocolError::ConfigureFailed(e.to_string()))?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(|e| ProtocolError::ConfigureFailed(e.to_string()))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| ProtocolError::ConfigureFailed(e.to_string()))?;

    // Keep DTR asserted so Arduino-based ECUs don't bootloader-reset when
    // the port is opened. Not all adapters support it, so failure is soft.
    if let Err(e) = port.write_data_terminal_ready(true) {
        warn!("failed to assert DTR: {e}");
    }
    if let Err(e) = port.write_request_to_send(true) {
        warn!("failed to assert RTS: {e}");
    }

    Ok(())
}

impl Transport for SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let port = self.port.as_mut().ok_or(ProtocolError::NotConnected)?;
        port.write_all(data)
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        port.flush()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        Ok(())
    }

    fn read_with_timeout(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let port = self.port.as_mut().ok_or(ProtocolError::NotConnected)?;

        let mut accumulated = Vec::new();
        let mut buffer = [0u8; 512];
        let start = Instant::now();

        while accumulated.len() < max_len {
            if start.elapsed() >= timeout {
                break;
            }

            let available = port
                .bytes_to_read()
                .map_err(|e| ProtocolError::SerialError(e.to_string()))?
                as usize;

            if available == 0 {
                std::thread::sleep(READ_POLL_INTERVAL);
                continue;
            }

            let want = available.min(buffer.len()).min(max_len - accumulated.len());
            match port.read(&mut buffer[..want]) {
                Ok(0) => break,
                Ok(n) => accumulated.extend_from_slice(&buffer[..n]),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    continue;
                }
                Err(e) => return Err(ProtocolError::SerialError(e.to_string())),
            }
        }

        Ok(accumulated)
    }

    fn clear_buffers(&mut self) -> Result<(), ProtocolError> {
        let port = self.port.as_mut().ok_or(ProtocolError::NotConnected)?;
        port.clear(serialport::ClearBuffer::All)
            .map_err(|e| ProtocolError::SerialError(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(path = %self.path, "serial port closed");
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
