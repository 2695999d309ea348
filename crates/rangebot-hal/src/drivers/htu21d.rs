//! Humidity / temperature sensor (HTU21D / SHT21-class), hold-master mode.
//!
//! Each measurement is a single write-read: the command byte, then a 3-byte
//! reply `[msb, lsb, crc]`.  The two low bits of `lsb` are status bits (bit 1
//! set = humidity frame) and are cleared before conversion and CRC checking.
//!
//! Some firmware revisions send the humidity CRC XORed with `0x62`; enable
//! [`Htu21dConfig::humidity_crc_quirk`] for those parts.

use rangebot_types::{EventPayload, SensorError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bus::I2cDevice;
use crate::device::PolledDevice;

pub const DEFAULT_ADDRESS: u16 = 0x40;

pub const CMD_TEMPERATURE_HOLD: u8 = 0xE3;
pub const CMD_HUMIDITY_HOLD: u8 = 0xE5;

const STATUS_MASK: u16 = 0xFFFC;
const STATUS_HUMIDITY: u8 = 0x02;

/// `x^8 + x^5 + x^4 + 1`
pub const CRC_POLYNOMIAL: u16 = 0x0131;
pub const HUMIDITY_CRC_XOR: u8 = 0x62;

// Magnus-form partial pressure constants.
const DEW_A: f64 = 8.1332;
const DEW_B: f64 = 1762.39;
const DEW_C: f64 = 235.66;

/// CRC-8 of a 16-bit value with generator polynomial 0x131.
pub fn crc8(data: u16) -> u8 {
    let mut remainder = u32::from(data) << 8;
    for bit in (0..16).rev() {
        if remainder & (1 << (8 + bit)) != 0 {
            remainder ^= u32::from(CRC_POLYNOMIAL) << bit;
        }
    }
    remainder as u8
}

/// `true` when `crc` is the CRC-8 of `data`.
pub fn validate_checksum(data: u16, crc: u8) -> bool {
    crc8(data) == crc
}

pub fn temperature_celsius(raw: u16) -> f64 {
    175.72 * f64::from(raw) / 65536.0 - 46.85
}

pub fn relative_humidity(raw: u16) -> f64 {
    125.0 * f64::from(raw) / 65536.0 - 6.0
}

/// Dew point from the uncompensated relative humidity and temperature.
pub fn dew_point_celsius(temperature_c: f64, relative_humidity: f64) -> f64 {
    let partial_pressure = 10f64.powf(DEW_A - DEW_B / (temperature_c + DEW_C));
    let ratio = (relative_humidity * partial_pressure / 100.0).log10() - DEW_A;
    -(DEW_B / ratio + DEW_C)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Htu21dConfig {
    /// XOR the humidity CRC with 0x62 before validating.
    pub humidity_crc_quirk: bool,
    pub poll_interval_ms: u64,
}

impl Default for Htu21dConfig {
    fn default() -> Self {
        Self {
            humidity_crc_quirk: false,
            poll_interval_ms: 30_000,
        }
    }
}

/// One validated climate sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    pub temperature_c: f64,
    pub relative_humidity: f64,
    pub dew_point_c: f64,
}

pub struct Htu21d {
    id: String,
    device: I2cDevice,
    config: Htu21dConfig,
}

impl Htu21d {
    pub fn new(device: I2cDevice, config: Htu21dConfig) -> Self {
        Self {
            id: super::device_id("htu21d", device.address()),
            device,
            config,
        }
    }

    /// Raw 16-bit temperature with status bits cleared.
    pub fn raw_temperature(&self) -> Result<u16, SensorError> {
        self.measure(CMD_TEMPERATURE_HOLD, false, 0)
    }

    /// Raw 16-bit humidity with status bits cleared.
    pub fn raw_humidity(&self) -> Result<u16, SensorError> {
        let xor = if self.config.humidity_crc_quirk {
            HUMIDITY_CRC_XOR
        } else {
            0
        };
        self.measure(CMD_HUMIDITY_HOLD, true, xor)
    }

    pub fn read_climate(&self) -> Result<Climate, SensorError> {
        let temperature_c = temperature_celsius(self.raw_temperature()?);
        let relative_humidity = relative_humidity(self.raw_humidity()?);
        Ok(Climate {
            temperature_c,
            relative_humidity,
            dew_point_c: dew_point_celsius(temperature_c, relative_humidity),
        })
    }

    fn measure(&self, command: u8, humidity: bool, crc_xor: u8) -> Result<u16, SensorError> {
        let mut frame = [0u8; 3];
        self.device.write_read(&[command], &mut frame)?;

        if (frame[1] & STATUS_HUMIDITY != 0) != humidity {
            warn!(device = %self.id, command, "status bit does not match the requested measurement");
            return Err(SensorError::bus(
                self.device.label(),
                format!("unexpected status bits 0x{:02x}", frame[1] & 0x03),
            ));
        }

        let value = u16::from_be_bytes([frame[0], frame[1]]) & STATUS_MASK;
        let received = frame[2] ^ crc_xor;
        if !validate_checksum(value, received) {
            return Err(SensorError::Checksum {
                device: self.device.label().to_string(),
                expected: received,
                computed: crc8(value),
            });
        }
        debug!(device = %self.id, command, value, "measurement validated");
        Ok(value)
    }
}

impl PolledDevice for Htu21d {
    fn id(&self) -> &str {
        &self.id
    }

    fn poll(&self) -> Result<Vec<EventPayload>, SensorError> {
        let climate = self.read_climate()?;
        Ok(vec![EventPayload::ClimateReceived {
            temperature_c: climate.temperature_c,
            relative_humidity: climate.relative_humidity,
            dew_point_c: climate.dew_point_c,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SharedBus;
    use crate::sim::{SimBus, SimHtu21d};
    use rangebot_types::ErrorKind;

    fn sensor(sim_device: SimHtu21d, config: Htu21dConfig) -> Htu21d {
        let mut sim = SimBus::new();
        sim.attach(DEFAULT_ADDRESS, sim_device);
        let bus = SharedBus::new("I2C1", sim);
        Htu21d::new(bus.open(DEFAULT_ADDRESS).unwrap(), config)
    }

    #[test]
    fn crc8_datasheet_vectors() {
        assert_eq!(crc8(0x683A), 0x7C);
        assert_eq!(crc8(0x4E85), 0x6B);
    }

    #[test]
    fn quirk_corrected_crc_validates_and_single_bit_flips_fail() {
        let data = 0x4E84;
        let sent = crc8(data) ^ HUMIDITY_CRC_XOR;
        assert!(validate_checksum(data, sent ^ HUMIDITY_CRC_XOR));
        for bit in 0..8 {
            assert!(!validate_checksum(data, (sent ^ HUMIDITY_CRC_XOR) ^ (1 << bit)));
        }
    }

    #[test]
    fn conversions() {
        assert!((temperature_celsius(0x683A & 0xFFFC) - 24.69).abs() < 0.01);
        assert!((relative_humidity(0x4E85 & 0xFFFC) - 32.33).abs() < 0.01);
        let dew = dew_point_celsius(25.0, 50.0);
        assert!((dew - 13.9).abs() < 0.2, "dew point {dew}");
    }

    #[test]
    fn read_climate_with_quirk() {
        let htu = sensor(
            SimHtu21d::new(0x683A, 0x4E85, HUMIDITY_CRC_XOR),
            Htu21dConfig {
                humidity_crc_quirk: true,
                ..Htu21dConfig::default()
            },
        );
        let climate = htu.read_climate().unwrap();
        assert!((climate.temperature_c - 24.69).abs() < 0.01);
        assert!((climate.relative_humidity - 32.33).abs() < 0.01);
        assert!(climate.dew_point_c < climate.temperature_c);
    }

    #[test]
    fn quirk_mismatch_is_checksum_error() {
        let htu = sensor(
            SimHtu21d::new(0x683A, 0x4E85, HUMIDITY_CRC_XOR),
            Htu21dConfig::default(),
        );
        assert_eq!(htu.poll().unwrap_err().kind(), ErrorKind::Checksum);
    }

    #[test]
    fn poll_publishes_climate() {
        let htu = sensor(SimHtu21d::new(0x683A, 0x4E85, 0), Htu21dConfig::default());
        let events = htu.poll().unwrap();
        assert!(matches!(events.as_slice(), [EventPayload::ClimateReceived { .. }]));
    }
}
