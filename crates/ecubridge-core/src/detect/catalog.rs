//! Probe catalog
//!
//! Static descriptors for every ECU dialect the detector knows how to
//! identify: the identifying command byte, the reply marker, and the baud
//! rates worth trying, in the order worth trying them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifies one ECU dialect (vendor/firmware command set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialectId {
    /// Speeduino (TunerStudio-compatible serial protocol)
    Speeduino,
    /// MegaSquirt 1
    MegaSquirt1,
    /// MegaSquirt 2
    MegaSquirt2,
    /// MegaSquirt 3
    MegaSquirt3,
}

impl DialectId {
    /// User-facing dialect name
    pub fn name(&self) -> &'static str {
        match self {
            DialectId::Speeduino => "Speeduino",
            DialectId::MegaSquirt1 => "MegaSquirt 1",
            DialectId::MegaSquirt2 => "MegaSquirt 2",
            DialectId::MegaSquirt3 => "MegaSquirt 3",
        }
    }
}

impl std::fmt::Display for DialectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How to elicit and recognize one dialect's identification reply
#[derive(Debug, Clone)]
pub struct ProbeDescriptor {
    /// Dialect this descriptor identifies
    pub dialect: DialectId,
    /// Single probe command byte to send
    pub command: u8,
    /// Substring an identification reply must contain
    pub expected_marker: &'static str,
    /// Minimum reply length for a plausible match
    pub min_response_len: usize,
    /// Known full reply size, when the firmware's answer is fixed-length.
    /// Lets the accumulate loop stop early instead of waiting out the timeout.
    pub full_response_len: Option<usize>,
    /// Per-read timeout for this dialect
    pub timeout: Duration,
    /// Candidate baud rates, most likely first
    pub candidate_bauds: &'static [u32],
}

/// The built-in probe catalog, in probe order.
///
/// Speeduino leads because it is both the most common target and the
/// cheapest to confirm (fixed 16-byte 'Q' reply).
pub const PROBE_CATALOG: &[ProbeDescriptor] = &[
    ProbeDescriptor {
        dialect: DialectId::Speeduino,
        command: b'Q',
        // Full reply is e.g. "speeduino 202402"
        expected_marker: "speeduino",
        min_response_len: 5,
        full_response_len: Some(16),
        timeout: Duration::from_millis(2000),
        candidate_bauds: &[115200, 57600, 38400, 19200, 9600],
    },
    ProbeDescriptor {
        dialect: DialectId::MegaSquirt2,
        command: b'Q',
        expected_marker: "MegaSquirt",
        min_response_len: 10,
        full_response_len: None,
        timeout: Duration::from_millis(2000),
        candidate_bauds: &[115200, 57600, 38400, 19200, 9600],
    },
    ProbeDescriptor {
        dialect: DialectId::MegaSquirt1,
        command: b'Q',
        expected_marker: "MS1",
        min_response_len: 3,
        full_response_len: None,
        timeout: Duration::from_millis(2000),
        candidate_bauds: &[9600, 19200, 38400, 57600],
    },
    ProbeDescriptor {
        dialect: DialectId::MegaSquirt3,
        command: b'Q',
        expected_marker: "MS3",
        min_response_len: 3,
        full_response_len: None,
        timeout: Duration::from_millis(2000),
        candidate_bauds: &[115200, 57600, 38400, 19200, 9600],
    },
];

/// The dialect that gets the binary-reply fallback on USB-CDC adapters
pub const PRIMARY_DIALECT: DialectId = DialectId::Speeduino;

/// Per-dialect preference bonus added to confidence when ranking hits.
///
/// This is policy, not measurement: it encodes which dialect a user most
/// likely wants when several match. Callers may supply their own table.
pub fn default_preference(dialect: DialectId) -> i32 {
    match dialect {
        DialectId::Speeduino => 10,
        DialectId::MegaSquirt3 => 9,
        DialectId::MegaSquirt2 => 8,
        DialectId::MegaSquirt1 => 5,
    }
}
