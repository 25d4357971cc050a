//! # ECUBridge Core Library
//!
//! Serial auto-detection and connection management for Speeduino and
//! MegaSquirt-family ECUs.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Blind ECU detection across serial devices and baud rates
//! - Speeduino serial protocol (plain commands + checksummed envelope)
//! - Telemetry decoding from the firmware's output channel block
//! - A single-connection manager dispatching to dialect backends
//!
//! ## Supported ECUs
//!
//! - Speeduino (full backend)
//! - MegaSquirt 1/2/3 (detection only)
//!
//! ## Example
//!
//! ```rust,ignore
//! use ecubridge_core::manager::ConnectionManager;
//!
//! // Sweep every candidate device and connect to the best match
//! let manager = ConnectionManager::new();
//! let hit = manager.auto_connect()?;
//! println!("connected to {} at {} baud", hit.display_name, hit.baud_rate);
//!
//! // Poll live data
//! if let Some(snapshot) = manager.get_telemetry() {
//!     println!("RPM: {}", snapshot.rpm);
//! }
//! ```

pub mod detect;
pub mod ecu;
pub mod manager;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::detect::{
        CancelToken, DetectionEngine, DetectionResult, DialectId, ProbeDescriptor,
    };
    pub use crate::ecu::{ConfigPage, EcuBackend, SpeeduinoBackend};
    pub use crate::manager::{ConnectionManager, SessionInfo};
    pub use crate::protocol::{
        Command, Frame, ProtocolError, SerialFactory, TelemetrySnapshot, Transport,
        TransportFactory,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
