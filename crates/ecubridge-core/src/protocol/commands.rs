//! Protocol commands
//!
//! The Speeduino/TunerStudio-compatible command set. Most commands are a
//! single unframed ASCII byte; page access and a few extended commands ride
//! the checksummed envelope (see [`crate::protocol::frame`]).

use serde::{Deserialize, Serialize};

use super::DEFAULT_TIMEOUT_MS;

/// Commands understood by Speeduino-compatible firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Query firmware version string ('Q')
    QueryVersion,

    /// Get ECU signature ('S')
    GetSignature,

    /// Get the firmware version detail string ('V')
    GetVersionDetail,

    /// Test communication ('C')
    TestComm,

    /// Get realtime output channels ('A')
    GetOutputChannels,

    /// Read a config page chunk ('r', framed)
    ReadPage,

    /// Write a config page chunk ('w', framed)
    WritePage,

    /// Burn current page to flash ('b', framed)
    BurnPage,

    /// Get the CRC32 of a config page ('d', framed)
    GetPageCrc,

    /// Start tooth logging ('H')
    StartToothLog,

    /// Stop tooth logging ('h')
    StopToothLog,

    /// Start composite logging ('J')
    StartCompositeLog,

    /// Stop composite logging ('j')
    StopCompositeLog,

    /// Trigger a commandButton handler ('E', framed)
    ButtonCommand,

    /// Reset the ECU, used before firmware updates ('U')
    ResetEcu,

    /// Query serial capabilities ('f')
    SerialCapabilities,
}

impl Command {
    /// The single-byte wire representation
    pub fn byte(&self) -> u8 {
        match self {
            Command::QueryVersion => b'Q',
            Command::GetSignature => b'S',
            Command::GetVersionDetail => b'V',
            Command::TestComm => b'C',
            Command::GetOutputChannels => b'A',
            Command::ReadPage => b'r',
            Command::WritePage => b'w',
            Command::BurnPage => b'b',
            Command::GetPageCrc => b'd',
            Command::StartToothLog => b'H',
            Command::StopToothLog => b'h',
            Command::StartCompositeLog => b'J',
            Command::StopCompositeLog => b'j',
            Command::ButtonCommand => b'E',
            Command::ResetEcu => b'U',
            Command::SerialCapabilities => b'f',
        }
    }

    /// Whether the command must be wrapped in the checksummed envelope
    pub fn uses_envelope(&self) -> bool {
        matches!(
            self,
            Command::ReadPage
                | Command::WritePage
                | Command::BurnPage
                | Command::GetPageCrc
                | Command::ButtonCommand
        )
    }

    /// Whether a response is expected at all
    pub fn expects_response(&self) -> bool {
        !matches!(
            self,
            Command::StartToothLog
                | Command::StopToothLog
                | Command::StartCompositeLog
                | Command::StopCompositeLog
                | Command::ResetEcu
        )
    }

    /// Response timeout in milliseconds. Page and burn operations take
    /// longer than status queries, flash burns longest of all.
    pub fn timeout_ms(&self) -> u64 {
        match self {
            Command::BurnPage => 3000,
            Command::ReadPage | Command::WritePage | Command::GetPageCrc => 2000,
            _ => DEFAULT_TIMEOUT_MS,
        }
    }
}
