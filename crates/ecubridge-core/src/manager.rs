//! Connection management
//!
//! Holds the single active ECU connection behind a uniform interface and
//! dispatches to the dialect-specific backend. The session mutex is held
//! only for pointer/field swaps; backends carry their own lock so serial
//! I/O never blocks manager state reads.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::detect::{CancelToken, DetectionEngine, DetectionResult, DialectId};
use crate::ecu::{EcuBackend, SpeeduinoBackend};
use crate::protocol::{
    Command, ProtocolError, SerialFactory, TelemetrySnapshot, TransportFactory,
};

/// Shared handle to a live backend. The manager lock is dropped before the
/// backend lock is taken, so a scan or telemetry poll in one thread never
/// blocks `is_connected` or `get_current` in another.
type SharedBackend = Arc<Mutex<Box<dyn EcuBackend>>>;

/// The active connection: where it is, what it speaks, and its backend
struct ConnectionSession {
    dialect: DialectId,
    device_path: String,
    baud_rate: u32,
    display_name: String,
    backend: SharedBackend,
}

/// Snapshot of the current session's metadata for callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Dialect of the connected ECU
    pub dialect: DialectId,
    /// Device path of the connection
    pub device_path: String,
    /// Baud rate of the connection
    pub baud_rate: u32,
    /// Human-readable ECU name
    pub display_name: String,
}

/// Manages at most one ECU connection at a time
pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    engine: DetectionEngine,
    session: Mutex<Option<ConnectionSession>>,
}

impl ConnectionManager {
    /// Create a manager over real serial hardware
    pub fn new() -> Self {
        Self::with_factory(Arc::new(SerialFactory::new()))
    }

    /// Create a manager over a custom transport factory (tests, simulators)
    pub fn with_factory(factory: Arc<dyn TransportFactory>) -> Self {
        let engine = DetectionEngine::new(factory.clone());
        Self {
            factory,
            engine,
            session: Mutex::new(None),
        }
    }

    /// Create a manager with a pre-configured detection engine
    pub fn with_engine(factory: Arc<dyn TransportFactory>, engine: DetectionEngine) -> Self {
        Self {
            factory,
            engine,
            session: Mutex::new(None),
        }
    }

    /// The detection engine, for direct scan access
    pub fn engine(&self) -> &DetectionEngine {
        &self.engine
    }

    /// Token that aborts an in-flight sweep between probe tuples
    pub fn cancel_token(&self) -> CancelToken {
        self.engine.cancel_token()
    }

    /// Scan all candidate devices (detection surface passthrough)
    pub fn scan_all(&self) -> Result<Vec<DetectionResult>, ProtocolError> {
        self.engine.scan_all()
    }

    /// Construct the backend for a dialect. This is the only place that
    /// knows which dialects have an implementation.
    fn make_backend(&self, dialect: DialectId) -> Result<Box<dyn EcuBackend>, ProtocolError> {
        match dialect {
            DialectId::Speeduino => Ok(Box::new(SpeeduinoBackend::new(self.factory.clone()))),
            other => Err(ProtocolError::UnsupportedDialect(other.name().to_string())),
        }
    }

    /// Scan everything, pick the best hit, and connect to it
    pub fn auto_connect(&self) -> Result<DetectionResult, ProtocolError> {
        let results = self.engine.scan_all()?;
        let best = self.engine.get_best(&results).ok_or_else(|| {
            ProtocolError::DeviceNotFound("no ECU detected on any serial device".to_string())
        })?;

        self.connect_to(&best)?;
        Ok(best)
    }

    /// Probe exactly one (path, baud) pair and connect if an ECU answers.
    /// Nonexistent paths fail fast without a transport ever being opened.
    pub fn manual_connect(&self, path: &str, baud: u32) -> Result<DetectionResult, ProtocolError> {
        if !self.factory.exists(path) {
            return Err(ProtocolError::DeviceNotFound(path.to_string()));
        }

        let hit = self.engine.test_one(path, baud).ok_or_else(|| {
            ProtocolError::ProtocolMismatch(format!("no ECU identified at {path} ({baud} baud)"))
        })?;

        self.connect_to(&hit)?;
        Ok(hit)
    }

    /// Connect to a specific detection result.
    ///
    /// An existing connection is torn down first. On failure the manager
    /// stays cleanly disconnected; a half-open session is never stored.
    pub fn connect_to(&self, result: &DetectionResult) -> Result<(), ProtocolError> {
        self.disconnect();

        let mut backend = self.make_backend(result.dialect)?;

        // Connect outside the session lock; this can block for seconds
        backend.connect(&result.device_path, result.baud_rate)?;

        let session = ConnectionSession {
            dialect: result.dialect,
            device_path: result.device_path.clone(),
            baud_rate: result.baud_rate,
            display_name: result.display_name.clone(),
            backend: Arc::new(Mutex::new(backend)),
        };

        *self.session.lock().unwrap() = Some(session);
        info!(
            dialect = %result.dialect,
            path = %result.device_path,
            baud = result.baud_rate,
            "connected"
        );
        Ok(())
    }

    /// Tear down the active connection, if any; idempotent
    pub fn disconnect(&self) {
        let session = self.session.lock().unwrap().take();
        if let Some(session) = session {
            // Backend teardown happens outside the manager lock
            session.backend.lock().unwrap().disconnect();
            info!(path = %session.device_path, "disconnected");
        }
    }

    /// Whether a session exists AND its transport is actually open.
    /// A stale session whose link dropped reports `false` here.
    pub fn is_connected(&self) -> bool {
        match self.shared_backend() {
            Some(backend) => backend.lock().unwrap().is_connected(),
            None => false,
        }
    }

    /// Metadata of the current session, if one exists
    pub fn get_current(&self) -> Option<SessionInfo> {
        self.session.lock().unwrap().as_ref().map(|s| SessionInfo {
            dialect: s.dialect,
            device_path: s.device_path.clone(),
            baud_rate: s.baud_rate,
            display_name: s.display_name.clone(),
        })
    }

    /// ECU signature, or `None` when disconnected
    pub fn get_signature(&self) -> Option<String> {
        let backend = self.shared_backend()?;
        let guard = backend.lock().unwrap();
        guard.signature().map(str::to_string)
    }

    /// Firmware version, or `None` when disconnected
    pub fn get_firmware_version(&self) -> Option<String> {
        let backend = self.shared_backend()?;
        let guard = backend.lock().unwrap();
        guard.firmware_version().map(str::to_string)
    }

    /// Poll one telemetry snapshot.
    ///
    /// `None` means "unavailable": disconnected, or the poll failed. A
    /// failed poll never yields a stale or partial snapshot.
    pub fn get_telemetry(&self) -> Option<TelemetrySnapshot> {
        let backend = self.shared_backend()?;
        let mut guard = backend.lock().unwrap();
        match guard.telemetry() {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("telemetry poll failed: {e}");
                None
            }
        }
    }

    /// Send a protocol command through the active backend
    pub fn send_command(
        &self,
        command: Command,
        data: &[u8],
        expected_len: usize,
    ) -> Result<Vec<u8>, ProtocolError> {
        let backend = self
            .shared_backend()
            .ok_or(ProtocolError::NotConnected)?;
        let mut guard = backend.lock().unwrap();
        guard.send_command(command, data, expected_len)
    }

    /// Clone the backend handle while holding the session lock as briefly
    /// as possible
    fn shared_backend(&self) -> Option<SharedBackend> {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.backend.clone())
    }

    /// Run a full auto-connect off the caller's thread, delivering the
    /// result through `on_complete`. A sweep can take several seconds, so
    /// UI callers must use this instead of [`Self::auto_connect`].
    pub fn auto_connect_background<F>(self: &Arc<Self>, on_complete: F)
    where
        F: FnOnce(Result<DetectionResult, ProtocolError>) + Send + 'static,
    {
        let manager = Arc::clone(self);
        std::thread::spawn(move || {
            on_complete(manager.auto_connect());
        });
    }

    /// Background variant of [`Self::manual_connect`]
    pub fn manual_connect_background<F>(self: &Arc<Self>, path: String, baud: u32, on_complete: F)
    where
        F: FnOnce(Result<DetectionResult, ProtocolError>) + Send + 'static,
    {
        let manager = Arc::clone(self);
        std::thread::spawn(move || {
            on_complete(manager.manual_connect(&path, baud));
        });
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}
