//! ECU detection
//!
//! Blind protocol discovery: which serial device has an ECU on it, which
//! dialect it speaks, and at what baud rate.

pub mod catalog;
mod engine;

pub use catalog::{default_preference, DialectId, ProbeDescriptor, PROBE_CATALOG};
pub use engine::{CancelToken, DetectionEngine, DetectionResult, CONFIDENCE_FLOOR};
