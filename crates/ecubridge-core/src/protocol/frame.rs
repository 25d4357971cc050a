//! Speeduino envelope encoding/decoding
//!
//! Implements the checksummed binary envelope used by page read/write and
//! extended commands:
//!
//! `[START=0x72][COMMAND:1][LENGTH:1][DATA x LENGTH][CRC_HI][CRC_LO][STOP=0x03]`
//!
//! The CRC16 digest covers COMMAND and DATA only; LENGTH is excluded.
//! Plain single-byte ASCII commands ('Q', 'S', 'A', ...) are sent unframed.

use super::ProtocolError;

/// Envelope start byte
pub const START_BYTE: u8 = 0x72;

/// Envelope stop byte
pub const STOP_BYTE: u8 = 0x03;

/// Fixed envelope overhead: start + command + length + crc (2) + stop
pub const FRAME_OVERHEAD: usize = 6;

/// Maximum DATA length a single envelope can carry
pub const MAX_FRAME_DATA: usize = 255;

/// CRC-16/MODBUS over the given bytes: initial value 0xFFFF, reflected
/// polynomial 0xA001, computed bit-by-bit without a lookup table.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// A decoded envelope: command byte plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command byte
    pub command: u8,
    /// Payload bytes (DATA field)
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a frame for the given command and payload
    pub fn new(command: u8, data: Vec<u8>) -> Self {
        Self { command, data }
    }

    /// Encode the frame into its wire representation
    pub fn to_bytes(&self) -> Vec<u8> {
        debug_assert!(self.data.len() <= MAX_FRAME_DATA);

        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.push(START_BYTE);
        bytes.push(self.command);
        bytes.push(self.data.len() as u8);
        bytes.extend_from_slice(&self.data);

        // Digest domain is command + data; the length byte stays out of it
        let mut digest = Vec::with_capacity(1 + self.data.len());
        digest.push(self.command);
        digest.extend_from_slice(&self.data);
        let crc = crc16(&digest);

        bytes.push((crc >> 8) as u8);
        bytes.push((crc & 0xFF) as u8);
        bytes.push(STOP_BYTE);
        bytes
    }

    /// Decode an envelope from raw bytes, verifying framing and CRC
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(ProtocolError::InvalidResponse);
        }

        if bytes[0] != START_BYTE || bytes[bytes.len() - 1] != STOP_BYTE {
            return Err(ProtocolError::InvalidResponse);
        }

        let command = bytes[1];
        let length = bytes[2] as usize;

        if bytes.len() != FRAME_OVERHEAD + length {
            return Err(ProtocolError::InvalidResponse);
        }

        let data = bytes[3..3 + length].to_vec();

        let received_crc = ((bytes[3 + length] as u16) << 8) | bytes[4 + length] as u16;

        let mut digest = Vec::with_capacity(1 + length);
        digest.push(command);
        digest.extend_from_slice(&data);
        let expected_crc = crc16(&digest);

        if received_crc != expected_crc {
            return Err(ProtocolError::ChecksumMismatch {
                expected: expected_crc as u32,
                actual: received_crc as u32,
            });
        }

        Ok(Self { command, data })
    }

    /// Total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_OVERHEAD + self.data.len()
    }
}
