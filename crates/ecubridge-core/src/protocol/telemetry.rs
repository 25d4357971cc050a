//! Telemetry decoding
//!
//! The 'A' command returns one fixed-layout output-channels buffer. Every
//! field lives at a documented byte offset; multi-byte fields are big-endian.
//! A short buffer is a decode failure, never a partial snapshot.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Minimum output-channels response length the decoder accepts
pub const OUTPUT_CHANNELS_SIZE: usize = 85;

/// Bias added by the firmware to temperature channels before transmission
const TEMPERATURE_OFFSET: i16 = 40;

/// One decoded set of live output channels
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Seconds counter (wraps at 255)
    pub secl: u8,
    /// Status bits 1
    pub status1: u8,
    /// Engine status bits
    pub engine: u8,
    /// Dwell time
    pub dwell: u8,
    /// Manifold absolute pressure, kPa (low resolution)
    pub map_kpa: u16,
    /// Intake air temperature, degrees C (bias removed)
    pub iat_c: i16,
    /// Coolant temperature, degrees C (bias removed)
    pub coolant_c: i16,
    /// Battery voltage correction
    pub bat_correction: u8,
    /// Battery voltage multiplied by 10
    pub battery10: u8,
    /// Primary O2 sensor reading
    pub o2: u8,
    /// EGO correction
    pub ego_correction: u8,
    /// IAT correction
    pub iat_correction: u8,
    /// Warmup enrichment correction
    pub wue_correction: u8,
    /// Engine RPM
    pub rpm: u16,
    /// Acceleration enrichment correction
    pub tae_correction: u8,
    /// Gamma enrichment
    pub gamma_enrich: u8,
    /// Volumetric efficiency
    pub ve: u8,
    /// AFR target 1
    pub afr_target: u8,
    /// Pulse width 1
    pub pw1: u8,
    /// TPS rate of change
    pub tps_dot: u8,
    /// Ignition advance, degrees
    pub advance: u8,
    /// Throttle position, percent
    pub tps: u8,
    /// Main loop frequency
    pub loops_per_second: u16,
    /// Free RAM on the controller
    pub free_ram: u16,
    /// Boost target
    pub boost_target: u8,
    /// Boost duty cycle
    pub boost_duty: u8,
    /// Spark status bits
    pub spark: u8,
    /// RPM rate of change
    pub rpm_dot: u16,
    /// Ethanol percentage (flex fuel)
    pub ethanol_pct: u8,
    /// Flex fuel correction
    pub flex_correction: u8,
    /// Flex ignition correction
    pub flex_ign_correction: u8,
    /// Idle load
    pub idle_load: u8,
    /// Test outputs status
    pub test_outputs: u8,
    /// Secondary O2 sensor reading
    pub o2_2: u8,
    /// Barometric pressure, kPa
    pub baro: u8,
}

impl TelemetrySnapshot {
    /// Decode one output-channels buffer.
    ///
    /// Returns `InvalidResponse` for anything shorter than
    /// [`OUTPUT_CHANNELS_SIZE`]; callers keep their previous snapshot in
    /// that case.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < OUTPUT_CHANNELS_SIZE {
            return Err(ProtocolError::InvalidResponse);
        }

        Ok(Self {
            secl: data[0],
            status1: data[1],
            engine: data[2],
            dwell: data[3],
            map_kpa: BigEndian::read_u16(&data[4..6]),
            iat_c: data[6] as i16 - TEMPERATURE_OFFSET,
            coolant_c: data[7] as i16 - TEMPERATURE_OFFSET,
            bat_correction: data[8],
            battery10: data[9],
            o2: data[10],
            ego_correction: data[11],
            iat_correction: data[12],
            wue_correction: data[13],
            rpm: BigEndian::read_u16(&data[14..16]),
            tae_correction: data[16],
            gamma_enrich: data[17],
            ve: data[18],
            afr_target: data[19],
            pw1: data[20],
            tps_dot: data[21],
            advance: data[22],
            tps: data[23],
            loops_per_second: BigEndian::read_u16(&data[24..26]),
            free_ram: BigEndian::read_u16(&data[26..28]),
            boost_target: data[28],
            boost_duty: data[29],
            spark: data[30],
            rpm_dot: BigEndian::read_u16(&data[31..33]),
            ethanol_pct: data[33],
            flex_correction: data[34],
            flex_ign_correction: data[35],
            idle_load: data[36],
            test_outputs: data[37],
            o2_2: data[38],
            baro: data[39],
        })
    }

    /// Battery voltage in volts
    pub fn battery_voltage(&self) -> f32 {
        self.battery10 as f32 / 10.0
    }

    /// AFR from the primary O2 channel (stored as AFR x 10)
    pub fn afr(&self) -> f32 {
        self.o2 as f32 / 10.0
    }
}
