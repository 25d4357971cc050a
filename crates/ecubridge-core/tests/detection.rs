//! Detection sweep and connection flow tests over scripted mock hardware.
//!
//! The mock factory plays back canned per-command replies for each
//! (device, baud) pair, so full sweeps and connects run without a serial
//! port. Probe timeouts are shortened via a test catalog so silent devices
//! don't pay the production 2-second probe timeout.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use ecubridge_core::detect::{DetectionEngine, DialectId, ProbeDescriptor, PROBE_CATALOG};
use ecubridge_core::ecu::{EcuBackend, SpeeduinoBackend};
use ecubridge_core::manager::ConnectionManager;
use ecubridge_core::protocol::{
    ProtocolError, Transport, TransportFactory, OUTPUT_CHANNELS_SIZE, START_BYTE,
};

/// Replies one simulated ECU gives, keyed by command byte
type CommandReplies = HashMap<u8, Vec<u8>>;

/// A simulated device: which bauds it answers at, and with what
#[derive(Default, Clone)]
struct DeviceScript {
    replies_by_baud: HashMap<u32, CommandReplies>,
}

impl DeviceScript {
    fn silent() -> Self {
        Self::default()
    }

    fn with_reply(mut self, baud: u32, command: u8, reply: &[u8]) -> Self {
        self.replies_by_baud
            .entry(baud)
            .or_default()
            .insert(command, reply.to_vec());
        self
    }
}

struct MockTransport {
    replies: CommandReplies,
    pending: Vec<u8>,
    open: bool,
    commands: Arc<Mutex<Vec<u8>>>,
}

impl Transport for MockTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if !self.open {
            return Err(ProtocolError::NotConnected);
        }
        // Framed commands carry the command byte after the start byte
        let command = if data.len() >= 2 && data[0] == START_BYTE {
            data[1]
        } else {
            *data.first().ok_or(ProtocolError::InvalidResponse)?
        };
        self.commands.lock().unwrap().push(command);
        self.pending = self.replies.get(&command).cloned().unwrap_or_default();
        Ok(())
    }

    fn read_with_timeout(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        if !self.open {
            return Err(ProtocolError::NotConnected);
        }
        if self.pending.is_empty() {
            // A silent device makes the caller wait out its timeout
            std::thread::sleep(timeout);
            return Ok(Vec::new());
        }
        let take = self.pending.len().min(max_len);
        Ok(self.pending.drain(..take).collect())
    }

    fn clear_buffers(&mut self) -> Result<(), ProtocolError> {
        self.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[derive(Default)]
struct MockFactory {
    devices: HashMap<String, DeviceScript>,
    opens: Mutex<Vec<(String, u32)>>,
    commands: Arc<Mutex<Vec<u8>>>,
}

impl MockFactory {
    fn new() -> Self {
        Self::default()
    }

    fn with_device(mut self, path: &str, script: DeviceScript) -> Self {
        self.devices.insert(path.to_string(), script);
        self
    }

    fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    /// Every command byte written to any transport, in order
    fn command_log(&self) -> Vec<u8> {
        self.commands.lock().unwrap().clone()
    }
}

impl TransportFactory for MockFactory {
    fn open(&self, path: &str, baud: u32) -> Result<Box<dyn Transport>, ProtocolError> {
        let script = self
            .devices
            .get(path)
            .ok_or_else(|| ProtocolError::DeviceNotFound(path.to_string()))?;
        self.opens.lock().unwrap().push((path.to_string(), baud));
        Ok(Box::new(MockTransport {
            replies: script.replies_by_baud.get(&baud).cloned().unwrap_or_default(),
            pending: Vec::new(),
            open: true,
            commands: self.commands.clone(),
        }))
    }

    fn enumerate(&self) -> Result<Vec<String>, ProtocolError> {
        let mut paths: Vec<String> = self.devices.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    fn exists(&self, path: &str) -> bool {
        self.devices.contains_key(path)
    }
}

/// The production catalog with probe timeouts short enough for tests
fn fast_catalog() -> Vec<ProbeDescriptor> {
    PROBE_CATALOG
        .iter()
        .map(|probe| {
            let mut probe = probe.clone();
            probe.timeout = Duration::from_millis(50);
            probe
        })
        .collect()
}

fn fast_engine(factory: Arc<MockFactory>) -> DetectionEngine {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    DetectionEngine::new(factory)
        .with_catalog(fast_catalog())
        .with_settle(Duration::ZERO)
}

/// A plausible output-channels buffer: 4000 RPM, 85C coolant, 14.0V
fn telemetry_reply() -> Vec<u8> {
    let mut buf = vec![0u8; OUTPUT_CHANNELS_SIZE];
    buf[4] = 0x00;
    buf[5] = 0x65; // MAP 101 kPa
    buf[6] = 60; // IAT 20C after bias removal
    buf[7] = 125; // coolant 85C after bias removal
    buf[9] = 140; // 14.0V
    buf[14] = 0x0F;
    buf[15] = 0xA0; // 4000 RPM
    buf
}

fn speeduino_script() -> DeviceScript {
    DeviceScript::default()
        .with_reply(115200, b'Q', b"speeduino 202402")
        .with_reply(115200, b'S', b"Speeduino 2024.02-dev")
        .with_reply(115200, b'A', &telemetry_reply())
}

/// CRC32 check value for the b"123456789" page payload below
const PAGE_CRC32: u32 = 0xCBF4_3926;

fn page_script() -> DeviceScript {
    speeduino_script()
        .with_reply(115200, b'r', b"123456789")
        .with_reply(115200, b'd', &PAGE_CRC32.to_be_bytes())
        .with_reply(115200, b'w', &[0x00])
}

fn connected_backend(factory: Arc<MockFactory>) -> SpeeduinoBackend {
    let mut backend = SpeeduinoBackend::new(factory).with_settle(Duration::ZERO);
    backend.connect("/dev/ttyACM0", 115200).unwrap();
    backend
}

#[test]
fn test_scan_finds_speeduino_at_correct_baud() {
    let factory = Arc::new(
        MockFactory::new()
            .with_device("/dev/ttyACM0", speeduino_script())
            .with_device("/dev/ttyUSB0", DeviceScript::silent()),
    );
    let engine = fast_engine(factory);

    let results = engine.scan_all().unwrap();
    assert_eq!(results.len(), 1);

    let hit = &results[0];
    assert_eq!(hit.dialect, DialectId::Speeduino);
    assert_eq!(hit.device_path, "/dev/ttyACM0");
    assert_eq!(hit.baud_rate, 115200);
    assert_eq!(hit.confidence, 100);
    assert!(hit.signature.contains("speeduino"));
}

#[test]
fn test_scan_with_no_devices_is_empty_not_error() {
    let factory = Arc::new(MockFactory::new());
    let engine = fast_engine(factory);

    let results = engine.scan_all().unwrap();
    assert!(results.is_empty());
    assert_eq!(engine.get_best(&results), None);
}

#[test]
fn test_scan_identifies_megasquirt_marker() {
    let factory = Arc::new(MockFactory::new().with_device(
        "/dev/ttyUSB0",
        DeviceScript::default().with_reply(115200, b'Q', b"MegaSquirt-II v3.83\n"),
    ));
    let engine = fast_engine(factory);

    let results = engine.scan_all().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].dialect, DialectId::MegaSquirt2);
    assert_eq!(results[0].confidence, 100);
}

#[test]
fn test_binary_reply_on_usb_cdc_is_speeduino_fallback() {
    // Some CDC-ACM adapters deliver a binary burst before the ASCII
    // identification string; on an ACM path that still counts, below an
    // exact marker match.
    let factory = Arc::new(MockFactory::new().with_device(
        "/dev/ttyACM0",
        DeviceScript::default().with_reply(115200, b'Q', &[0x01, 0x55, 0xAA, 0x03, 0x7F, 0x10]),
    ));
    let engine = fast_engine(factory);

    let results = engine.scan_all().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].dialect, DialectId::Speeduino);
    assert_eq!(results[0].confidence, 95);
    assert!(results[0].display_name.contains("USB-CDC"));
}

#[test]
fn test_binary_reply_on_non_acm_path_is_no_hit() {
    let factory = Arc::new(MockFactory::new().with_device(
        "/dev/ttyUSB0",
        DeviceScript::default().with_reply(115200, b'Q', &[0x01, 0x55, 0xAA, 0x03, 0x7F, 0x10]),
    ));
    let engine = fast_engine(factory);

    let results = engine.scan_all().unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_first_hit_per_device_short_circuits() {
    // Device answers every dialect's probe; only one hit may be recorded
    let factory = Arc::new(
        MockFactory::new().with_device("/dev/ttyACM0", speeduino_script()),
    );
    let engine = fast_engine(factory);

    let results = engine.scan_all().unwrap();
    assert_eq!(results.len(), 1);
}

#[test]
fn test_cancelled_engine_scans_nothing_until_reset() {
    let factory = Arc::new(
        MockFactory::new().with_device("/dev/ttyACM0", speeduino_script()),
    );
    let engine = fast_engine(factory.clone());

    engine.cancel_token().cancel();
    let results = engine.scan_all().unwrap();
    assert!(results.is_empty());
    assert_eq!(factory.open_count(), 0);

    engine.cancel_token().reset();
    let results = engine.scan_all().unwrap();
    assert_eq!(results.len(), 1);
}

#[test]
fn test_auto_connect_end_to_end() {
    let factory = Arc::new(
        MockFactory::new()
            .with_device("/dev/ttyACM0", speeduino_script())
            .with_device("/dev/ttyUSB0", DeviceScript::silent()),
    );
    let engine = fast_engine(factory.clone());
    let manager = ConnectionManager::with_engine(factory, engine);

    let hit = manager.auto_connect().unwrap();
    assert_eq!(hit.dialect, DialectId::Speeduino);
    assert!(manager.is_connected());

    let info = manager.get_current().unwrap();
    assert_eq!(info.device_path, "/dev/ttyACM0");
    assert_eq!(info.baud_rate, 115200);

    let version = manager.get_firmware_version().unwrap();
    assert!(version.contains("speeduino"));
    let signature = manager.get_signature().unwrap();
    assert!(signature.contains("Speeduino"));

    let snapshot = manager.get_telemetry().unwrap();
    assert_eq!(snapshot.rpm, 4000);
    assert_eq!(snapshot.coolant_c, 85);
    assert_eq!(snapshot.map_kpa, 101);
    assert!((snapshot.battery_voltage() - 14.0).abs() < f32::EPSILON);

    manager.disconnect();
    assert!(!manager.is_connected());
    assert!(manager.get_current().is_none());
    assert!(manager.get_telemetry().is_none());
}

#[test]
fn test_auto_connect_with_nothing_attached() {
    let factory = Arc::new(MockFactory::new().with_device("/dev/ttyS0", DeviceScript::silent()));
    let engine = fast_engine(factory.clone());
    let manager = ConnectionManager::with_engine(factory, engine);

    assert!(matches!(
        manager.auto_connect(),
        Err(ProtocolError::DeviceNotFound(_))
    ));
    assert!(!manager.is_connected());
}

#[test]
fn test_manual_connect_missing_device_never_opens() {
    let factory = Arc::new(MockFactory::new().with_device("/dev/ttyACM0", speeduino_script()));
    let engine = fast_engine(factory.clone());
    let manager = ConnectionManager::with_engine(factory.clone(), engine);

    match manager.manual_connect("/dev/ttyUSB7", 115200) {
        Err(ProtocolError::DeviceNotFound(path)) => assert_eq!(path, "/dev/ttyUSB7"),
        other => panic!("expected DeviceNotFound, got {other:?}"),
    }
    assert_eq!(factory.open_count(), 0);
}

#[test]
fn test_manual_connect_wrong_baud_is_mismatch() {
    let factory = Arc::new(MockFactory::new().with_device("/dev/ttyACM0", speeduino_script()));
    let engine = fast_engine(factory.clone());
    let manager = ConnectionManager::with_engine(factory, engine);

    assert!(matches!(
        manager.manual_connect("/dev/ttyACM0", 9600),
        Err(ProtocolError::ProtocolMismatch(_))
    ));
    assert!(!manager.is_connected());
}

#[test]
fn test_manual_connect_succeeds_at_scripted_baud() {
    let factory = Arc::new(MockFactory::new().with_device("/dev/ttyACM0", speeduino_script()));
    let engine = fast_engine(factory.clone());
    let manager = ConnectionManager::with_engine(factory, engine);

    let hit = manager.manual_connect("/dev/ttyACM0", 115200).unwrap();
    assert_eq!(hit.dialect, DialectId::Speeduino);
    assert!(manager.is_connected());
}

#[test]
fn test_reconnect_replaces_previous_session() {
    let factory = Arc::new(
        MockFactory::new()
            .with_device("/dev/ttyACM0", speeduino_script())
            .with_device("/dev/ttyACM1", speeduino_script()),
    );
    let engine = fast_engine(factory.clone());
    let manager = ConnectionManager::with_engine(factory, engine);

    manager.manual_connect("/dev/ttyACM0", 115200).unwrap();
    manager.manual_connect("/dev/ttyACM1", 115200).unwrap();

    let info = manager.get_current().unwrap();
    assert_eq!(info.device_path, "/dev/ttyACM1");
    assert!(manager.is_connected());
}

#[test]
fn test_page_read_round_trip() {
    let factory = Arc::new(MockFactory::new().with_device("/dev/ttyACM0", page_script()));
    let mut backend = connected_backend(factory.clone());

    let data = backend.read_page(1, 0, 9).unwrap();
    assert_eq!(data, b"123456789");

    let crc = backend.page_crc(1).unwrap();
    assert_eq!(crc, PAGE_CRC32);

    // 'r' and 'd' must have gone out framed exactly once each
    let log = factory.command_log();
    assert_eq!(log.iter().filter(|&&c| c == b'r').count(), 1);
    assert_eq!(log.iter().filter(|&&c| c == b'd').count(), 1);
}

#[test]
fn test_page_write_acknowledged() {
    let factory = Arc::new(MockFactory::new().with_device("/dev/ttyACM0", page_script()));
    let mut backend = connected_backend(factory.clone());

    backend.write_page(1, 0, &[1, 2, 3]).unwrap();
    assert!(factory.command_log().contains(&b'w'));
}

#[test]
fn test_validated_page_read_accepts_matching_crc() {
    let factory = Arc::new(MockFactory::new().with_device("/dev/ttyACM0", page_script()));
    let mut backend = connected_backend(factory);

    let page = backend.read_page_validated(1, 9).unwrap();
    assert_eq!(page.index, 1);
    assert_eq!(page.data, b"123456789");
    assert_eq!(page.crc, Some(PAGE_CRC32));
}

#[test]
fn test_validated_page_read_crc_mismatch_is_not_retried() {
    // ECU reports a CRC that doesn't match the payload it then sends
    let script = speeduino_script()
        .with_reply(115200, b'r', b"123456789")
        .with_reply(115200, b'd', &0xDEAD_BEEFu32.to_be_bytes());
    let factory = Arc::new(MockFactory::new().with_device("/dev/ttyACM0", script));
    let mut backend = connected_backend(factory.clone());

    match backend.read_page_validated(1, 9) {
        Err(ProtocolError::ChecksumMismatch { expected, actual }) => {
            assert_eq!(expected, 0xDEAD_BEEF);
            assert_eq!(actual, PAGE_CRC32);
        }
        other => panic!("expected ChecksumMismatch, got {other:?}"),
    }

    // The mismatch is reported to the caller, never retried internally
    let log = factory.command_log();
    assert_eq!(log.iter().filter(|&&c| c == b'r').count(), 1);
    assert_eq!(log.iter().filter(|&&c| c == b'd').count(), 1);
}

#[test]
fn test_short_telemetry_reply_finishes_on_idle_gap() {
    // The 85-byte reply is shorter than the read buffer; the poll must end
    // on the idle gap after the data, not the full command timeout
    let factory = Arc::new(MockFactory::new().with_device("/dev/ttyACM0", speeduino_script()));
    let mut backend = connected_backend(factory);

    let started = Instant::now();
    let snapshot = backend.telemetry().unwrap();
    assert_eq!(snapshot.rpm, 4000);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_background_auto_connect_delivers_callback() {
    let factory = Arc::new(MockFactory::new().with_device("/dev/ttyACM0", speeduino_script()));
    let engine = fast_engine(factory.clone());
    let manager = Arc::new(ConnectionManager::with_engine(factory, engine));

    let (tx, rx) = mpsc::channel();
    manager.auto_connect_background(move |result| {
        // Callback runs on the worker thread; hand the result back
        let _ = tx.send(result);
    });

    let hit = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("callback should fire")
        .expect("auto-connect should succeed");
    assert_eq!(hit.dialect, DialectId::Speeduino);
    assert_eq!(hit.device_path, "/dev/ttyACM0");
    assert!(manager.is_connected());
}

#[test]
fn test_background_manual_connect_delivers_callback() {
    let factory = Arc::new(MockFactory::new().with_device("/dev/ttyACM0", speeduino_script()));
    let engine = fast_engine(factory.clone());
    let manager = Arc::new(ConnectionManager::with_engine(factory, engine));

    let (tx, rx) = mpsc::channel();
    manager.manual_connect_background("/dev/ttyACM0".to_string(), 115200, move |result| {
        let _ = tx.send(result);
    });

    let hit = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("callback should fire")
        .expect("manual connect should succeed");
    assert_eq!(hit.baud_rate, 115200);
    assert!(manager.is_connected());
}

#[test]
fn test_scan_deadline_caps_the_sweep() {
    let factory = Arc::new(
        MockFactory::new()
            .with_device("/dev/ttyS0", DeviceScript::silent())
            .with_device("/dev/ttyS1", DeviceScript::silent())
            .with_device("/dev/ttyS2", DeviceScript::silent()),
    );
    let engine = fast_engine(factory).with_scan_deadline(Duration::from_millis(120));

    let started = std::time::Instant::now();
    let results = engine.scan_all().unwrap();
    assert!(results.is_empty());
    // Three silent devices at ~1s each would blow way past the deadline
    assert!(started.elapsed() < Duration::from_secs(1));
}
