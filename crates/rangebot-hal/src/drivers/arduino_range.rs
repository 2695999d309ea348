//! Range sensor behind an I2C-slave microcontroller bridge.
//!
//! The bridge times an ultrasonic echo itself; every read returns the last
//! round-trip duration in microseconds as 2 bytes, little-endian.

use rangebot_types::{EventPayload, SensorError};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::bus::I2cDevice;
use crate::converter::echo_duration_to_cm;
use crate::device::PolledDevice;

pub const DEFAULT_ADDRESS: u16 = 0x08;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArduinoRangeConfig {
    pub poll_interval_ms: u64,
}

impl Default for ArduinoRangeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
        }
    }
}

pub struct ArduinoRange {
    id: String,
    device: I2cDevice,
}

impl ArduinoRange {
    pub fn new(device: I2cDevice) -> Self {
        Self {
            id: super::device_id("arduino", device.address()),
            device,
        }
    }

    /// Last echo duration in microseconds.
    pub fn read_duration(&self) -> Result<u16, SensorError> {
        let mut buffer = [0u8; 2];
        self.device.read(&mut buffer)?;
        let duration = u16::from_le_bytes(buffer);
        trace!(device = %self.id, duration_us = duration, "echo duration");
        Ok(duration)
    }
}

impl PolledDevice for ArduinoRange {
    fn id(&self) -> &str {
        &self.id
    }

    fn poll(&self) -> Result<Vec<EventPayload>, SensorError> {
        let duration = self.read_duration()?;
        Ok(vec![EventPayload::ProximityReceived {
            raw_value: i32::from(duration),
            distance: Some(echo_duration_to_cm(f64::from(duration))),
        }])
    }
}
