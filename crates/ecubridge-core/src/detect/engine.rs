//! Detection engine
//!
//! Sweeps candidate serial devices with the probe catalog to find ECUs.
//! Every (device, dialect, baud) tuple is one self-contained probe: open,
//! settle, send the identifying command, accumulate the reply, close,
//! evaluate. Per-tuple failures are "no hit"; only failure to enumerate
//! devices at all is a hard error.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::catalog::{
    default_preference, DialectId, ProbeDescriptor, PRIMARY_DIALECT, PROBE_CATALOG,
};
use crate::protocol::{ProtocolError, Transport, TransportFactory};

/// Settle delay after opening a port; USB serial adapters need a moment
/// before the first byte is safe to send.
const DEFAULT_SETTLE: Duration = Duration::from_millis(100);

/// Read slice used while accumulating a probe reply
const READ_SLICE: Duration = Duration::from_millis(50);

/// Largest probe reply we care about
const PROBE_BUFFER_SIZE: usize = 256;

/// Confidence below which a hit is never eligible for auto-connection
pub const CONFIDENCE_FLOOR: u8 = 80;

/// One identified ECU: where it is, how fast it talks, and how sure we are
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Dialect that answered
    pub dialect: DialectId,
    /// Device path the ECU answered on
    pub device_path: String,
    /// Baud rate it answered at
    pub baud_rate: u32,
    /// Human-readable name for UI lists
    pub display_name: String,
    /// Raw identification reply, lossily decoded for display
    pub signature: String,
    /// Match confidence, 0-100
    pub confidence: u8,
}

/// Cooperative cancellation flag checked between probe tuples.
///
/// Cancelling never interrupts an in-flight read; the current tuple runs to
/// completion and the sweep stops before the next one.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a fresh, un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the sweep holding this token
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clear the flag so the engine can run another sweep
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Probes serial devices against the catalog and ranks the results
pub struct DetectionEngine {
    factory: Arc<dyn TransportFactory>,
    catalog: Vec<ProbeDescriptor>,
    preference: fn(DialectId) -> i32,
    settle: Duration,
    scan_deadline: Option<Duration>,
    cancel: CancelToken,
}

impl DetectionEngine {
    /// Create an engine over the given transport factory with the built-in
    /// catalog and preference table
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            catalog: PROBE_CATALOG.to_vec(),
            preference: default_preference,
            settle: DEFAULT_SETTLE,
            scan_deadline: None,
            cancel: CancelToken::new(),
        }
    }

    /// Replace the probe catalog (mainly for tests and exotic setups)
    pub fn with_catalog(mut self, catalog: Vec<ProbeDescriptor>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Replace the dialect preference table used by [`Self::get_best`]
    pub fn with_preference(mut self, preference: fn(DialectId) -> i32) -> Self {
        self.preference = preference;
        self
    }

    /// Change the post-open settle delay
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Cap the wall time of a full sweep. Without a cap, a host with many
    /// dead ports pays every failed tuple's timeout in sequence.
    pub fn with_scan_deadline(mut self, deadline: Duration) -> Self {
        self.scan_deadline = Some(deadline);
        self
    }

    /// Token that can abort this engine's sweeps between tuples
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Scan every candidate device for ECUs.
    ///
    /// Returns an empty list when nothing answered; that is a normal
    /// outcome, not an error. The first hit on a device ends the sweep for
    /// that device (one ECU per device path).
    pub fn scan_all(&self) -> Result<Vec<DetectionResult>, ProtocolError> {
        let started = Instant::now();
        let devices = self.factory.enumerate()?;
        info!(count = devices.len(), "starting detection sweep");

        let mut results = Vec::new();

        'devices: for path in &devices {
            if self.sweep_expired(started) {
                break;
            }
            if !self.factory.exists(path) {
                continue;
            }

            for probe in &self.catalog {
                for &baud in probe.candidate_bauds {
                    if self.sweep_expired(started) {
                        break 'devices;
                    }

                    if let Some(hit) = self.probe_tuple(path, probe, baud) {
                        info!(
                            dialect = %hit.dialect,
                            path = %hit.device_path,
                            baud = hit.baud_rate,
                            confidence = hit.confidence,
                            "ECU detected"
                        );
                        results.push(hit);
                        // One ECU per device path; move on
                        continue 'devices;
                    }
                }
            }
        }

        info!(found = results.len(), "detection sweep complete");
        Ok(results)
    }

    /// Probe exactly one (path, baud) pair across every dialect that lists
    /// that baud rate. Used by manual connection.
    pub fn test_one(&self, path: &str, baud: u32) -> Option<DetectionResult> {
        if !self.factory.exists(path) {
            debug!(path, "device does not exist, skipping probe");
            return None;
        }

        for probe in &self.catalog {
            if !probe.candidate_bauds.contains(&baud) {
                debug!(dialect = %probe.dialect, baud, "baud not in candidate list");
                continue;
            }
            if let Some(hit) = self.probe_tuple(path, probe, baud) {
                return Some(hit);
            }
        }

        None
    }

    /// Pick the best hit from a scan.
    ///
    /// Hits under the confidence floor are discarded outright; the rest are
    /// ranked by confidence plus the per-dialect preference bonus, ties
    /// broken by first-seen order.
    pub fn get_best(&self, results: &[DetectionResult]) -> Option<DetectionResult> {
        let mut best: Option<&DetectionResult> = None;
        let mut best_score = i32::MIN;

        for result in results {
            if result.confidence < CONFIDENCE_FLOOR {
                debug!(
                    dialect = %result.dialect,
                    path = %result.device_path,
                    confidence = result.confidence,
                    "hit below confidence floor, skipping"
                );
                continue;
            }

            let score = result.confidence as i32 + (self.preference)(result.dialect);
            if score > best_score {
                best_score = score;
                best = Some(result);
            }
        }

        best.cloned()
    }

    fn sweep_expired(&self, started: Instant) -> bool {
        if self.cancel.is_cancelled() {
            warn!("detection sweep cancelled");
            return true;
        }
        if let Some(deadline) = self.scan_deadline {
            if started.elapsed() >= deadline {
                warn!("detection sweep hit overall deadline");
                return true;
            }
        }
        false
    }

    /// Run one probe state machine. Any failure along the way is "no hit".
    fn probe_tuple(
        &self,
        path: &str,
        probe: &ProbeDescriptor,
        baud: u32,
    ) -> Option<DetectionResult> {
        debug!(path, baud, dialect = %probe.dialect, "probing");

        let mut transport = match self.factory.open(path, baud) {
            Ok(t) => t,
            Err(e) => {
                debug!(path, baud, "open failed: {e}");
                return None;
            }
        };

        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }
        let _ = transport.clear_buffers();

        if let Err(e) = transport.write_all(&[probe.command]) {
            debug!(path, baud, "probe write failed: {e}");
            transport.close();
            return None;
        }

        let reply = self.accumulate_reply(transport.as_mut(), probe);
        transport.close();

        self.evaluate_reply(path, probe, baud, &reply)
    }

    /// Accumulate a probe reply in short read slices so we can stop as soon
    /// as a line terminator arrives or the dialect's known reply size is
    /// satisfied, instead of always paying the full timeout.
    fn accumulate_reply(&self, transport: &mut dyn Transport, probe: &ProbeDescriptor) -> Vec<u8> {
        let deadline = Instant::now() + probe.timeout;
        let mut reply: Vec<u8> = Vec::new();

        while reply.len() < PROBE_BUFFER_SIZE {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let chunk = match transport
                .read_with_timeout(PROBE_BUFFER_SIZE - reply.len(), remaining.min(READ_SLICE))
            {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("probe read failed: {e}");
                    break;
                }
            };

            if chunk.is_empty() {
                // A full idle slice after data means the reply is complete
                if !reply.is_empty() {
                    break;
                }
                continue;
            }

            reply.extend_from_slice(&chunk);

            if matches!(reply.last(), Some(b'\n') | Some(b'\r')) {
                break;
            }
            if let Some(full) = probe.full_response_len {
                if reply.len() >= full {
                    break;
                }
            }
        }

        reply
    }

    fn evaluate_reply(
        &self,
        path: &str,
        probe: &ProbeDescriptor,
        baud: u32,
        reply: &[u8],
    ) -> Option<DetectionResult> {
        if reply.len() < probe.min_response_len {
            debug!(
                path,
                baud,
                got = reply.len(),
                need = probe.min_response_len,
                "reply too short"
            );
            return None;
        }

        let marker = probe.expected_marker.as_bytes();
        let marker_found =
            !marker.is_empty() && reply.windows(marker.len()).any(|window| window == marker);

        if marker_found {
            return Some(DetectionResult {
                dialect: probe.dialect,
                device_path: path.to_string(),
                baud_rate: baud,
                display_name: probe.dialect.name().to_string(),
                signature: String::from_utf8_lossy(reply).trim().to_string(),
                confidence: 100,
            });
        }

        // USB-CDC adapters sometimes answer in binary before the ASCII
        // identification string is flushed. For the primary dialect a
        // plausible-length binary reply on an ACM path is still a hit,
        // just below an exact match.
        if probe.dialect == PRIMARY_DIALECT && path.contains("ACM") {
            debug!(path, baud, len = reply.len(), "binary reply on USB-CDC adapter");
            return Some(DetectionResult {
                dialect: probe.dialect,
                device_path: path.to_string(),
                baud_rate: baud,
                display_name: format!("{} (USB-CDC)", probe.dialect.name()),
                signature: format!("binary reply, {} bytes", reply.len()),
                confidence: 95,
            });
        }

        debug!(
            path,
            baud,
            marker = probe.expected_marker,
            "marker not found in reply"
        );
        None
    }
}
