//! Combined IR proximity / ambient-light sensor (VCNL4000-class).
//!
//! Both measurements share the command register at 0x80: the on-demand
//! trigger bits and the data-ready bits live side by side, so a trigger must
//! read the register and OR in only its own bit.
//!
//! ```text
//!   0x80  bit 7 config lock | 6 als ready | 5 prox ready | 4 als od | 3 prox od
//! ```

use std::time::Duration;

use rangebot_types::{AmbientReading, EventPayload, ProximityReading, SensorError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bus::I2cDevice;
use crate::converter::{RawValueConverter, ReciprocalConverter};
use crate::device::{PolledDevice, wait_until};

// ────────────────────────────────────────────────────────────────────────────
// Register map
// ────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_ADDRESS: u16 = 0x13;

pub const REG_COMMAND: u8 = 0x80;
pub const REG_PRODUCT_ID: u8 = 0x81;
pub const REG_IR_LED: u8 = 0x83;
pub const REG_AMBIENT_PARAMETER: u8 = 0x84;
pub const REG_AMBIENT_DATA: u8 = 0x85;
pub const REG_PROXIMITY_DATA: u8 = 0x87;
pub const REG_SIGNAL_FREQUENCY: u8 = 0x89;
pub const REG_PROXIMITY_ADJUST: u8 = 0x8A;

pub const MEASURE_AMBIENT: u8 = 0x10;
pub const MEASURE_PROXIMITY: u8 = 0x08;
pub const AMBIENT_READY: u8 = 0x40;
pub const PROXIMITY_READY: u8 = 0x20;

/// IR LED current is programmed in 10 mA steps up to 200 mA.
pub const MAX_IR_CURRENT_TENS_MA: u8 = 20;

/// The two measurements sharing the command register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurement {
    Proximity,
    Ambient,
}

impl Measurement {
    fn trigger_bit(self) -> u8 {
        match self {
            Measurement::Proximity => MEASURE_PROXIMITY,
            Measurement::Ambient => MEASURE_AMBIENT,
        }
    }

    fn ready_bit(self) -> u8 {
        match self {
            Measurement::Proximity => PROXIMITY_READY,
            Measurement::Ambient => AMBIENT_READY,
        }
    }

    fn result_register(self) -> u8 {
        match self {
            Measurement::Proximity => REG_PROXIMITY_DATA,
            Measurement::Ambient => REG_AMBIENT_DATA,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Measurement::Proximity => "proximity ready",
            Measurement::Ambient => "ambient ready",
        }
    }
}

/// IR LED modulation frequency for proximity measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalFrequency {
    Mhz3_125,
    Mhz1_5625,
    Khz781_25,
    Khz390_625,
}

impl SignalFrequency {
    fn bits(self) -> u8 {
        match self {
            SignalFrequency::Mhz3_125 => 0,
            SignalFrequency::Mhz1_5625 => 1,
            SignalFrequency::Khz781_25 => 2,
            SignalFrequency::Khz390_625 => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Vcnl4000Config {
    /// IR LED current in units of 10 mA (max 20).
    pub ir_current_tens_ma: u8,
    /// Budget for a ready bit to appear after a trigger.
    pub ready_timeout_ms: u64,
    /// Sleep between ready-bit checks.
    pub ready_check_interval_ms: u64,
    pub poll_interval_ms: u64,
    /// Also measure ambient light on every poll.
    pub measure_ambient: bool,
    pub converter: ReciprocalConverter,
}

impl Default for Vcnl4000Config {
    fn default() -> Self {
        Self {
            ir_current_tens_ma: 20,
            ready_timeout_ms: 100,
            ready_check_interval_ms: 1,
            poll_interval_ms: 100,
            measure_ambient: true,
            converter: ReciprocalConverter::default(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Driver
// ────────────────────────────────────────────────────────────────────────────

pub struct Vcnl4000 {
    id: String,
    device: I2cDevice,
    config: Vcnl4000Config,
}

impl Vcnl4000 {
    /// Wrap `device` and program the configured IR LED current.
    ///
    /// # Errors
    ///
    /// [`SensorError::Range`] for a current above
    /// [`MAX_IR_CURRENT_TENS_MA`]; [`SensorError::Bus`] if the write fails.
    pub fn new(device: I2cDevice, config: Vcnl4000Config) -> Result<Self, SensorError> {
        let sensor = Self {
            id: super::device_id("vcnl4000", device.address()),
            device,
            config,
        };
        sensor.set_ir_led_current(sensor.config.ir_current_tens_ma)?;
        info!(device = %sensor.id, ir_current_ma = u32::from(sensor.config.ir_current_tens_ma) * 10, "proximity sensor ready");
        Ok(sensor)
    }

    pub fn set_ir_led_current(&self, tens_of_ma: u8) -> Result<(), SensorError> {
        if tens_of_ma > MAX_IR_CURRENT_TENS_MA {
            return Err(SensorError::range(
                "ir_led_current",
                tens_of_ma,
                "[0, 20] x 10 mA",
            ));
        }
        self.device.write_register(REG_IR_LED, tens_of_ma)
    }

    pub fn product_id(&self) -> Result<u8, SensorError> {
        self.device.read_register(REG_PRODUCT_ID)
    }

    pub fn set_signal_frequency(&self, frequency: SignalFrequency) -> Result<(), SensorError> {
        self.device
            .write_register(REG_SIGNAL_FREQUENCY, frequency.bits())
    }

    pub fn set_proximity_modulator_timing(&self, value: u8) -> Result<(), SensorError> {
        self.device.write_register(REG_PROXIMITY_ADJUST, value)
    }

    pub fn set_ambient_parameter(&self, value: u8) -> Result<(), SensorError> {
        self.device.write_register(REG_AMBIENT_PARAMETER, value)
    }

    /// Start an on-demand measurement: read the command register, OR in the
    /// trigger bit, write it back.  Both steps run under one bus lock.
    pub fn trigger(&self, kind: Measurement) -> Result<(), SensorError> {
        self.device.transaction(|bus, address| {
            let mut current = [0u8; 1];
            bus.write_read(address, &[REG_COMMAND], &mut current)?;
            bus.write(address, &[REG_COMMAND, current[0] | kind.trigger_bit()])
        })
    }

    pub fn is_ready(&self, kind: Measurement) -> Result<bool, SensorError> {
        Ok(self.device.read_register(REG_COMMAND)? & kind.ready_bit() != 0)
    }

    pub fn read_result(&self, kind: Measurement) -> Result<u16, SensorError> {
        self.device.read_register_pair(kind.result_register())
    }

    /// Trigger, wait for the ready bit, read the result.
    ///
    /// # Errors
    ///
    /// [`SensorError::Timeout`] when the ready bit is not observed within
    /// `ready_timeout_ms`.
    pub fn measure(&self, kind: Measurement) -> Result<u16, SensorError> {
        self.trigger(kind)?;
        let timeout = Duration::from_millis(self.config.ready_timeout_ms);
        let interval = Duration::from_millis(self.config.ready_check_interval_ms);
        if !wait_until(timeout, interval, || self.is_ready(kind))? {
            warn!(device = %self.id, ?kind, "ready bit never set");
            return Err(SensorError::Timeout {
                device: self.id.clone(),
                what: kind.name().to_string(),
                waited_ms: self.config.ready_timeout_ms,
            });
        }
        self.read_result(kind)
    }

    pub fn read_proximity(&self) -> Result<ProximityReading, SensorError> {
        Ok(ProximityReading {
            raw_value: i32::from(self.measure(Measurement::Proximity)?),
        })
    }

    pub fn read_ambient(&self) -> Result<AmbientReading, SensorError> {
        Ok(AmbientReading {
            raw_value: i32::from(self.measure(Measurement::Ambient)?),
        })
    }

    /// Millimetres for a raw proximity count, when it lies on the curve.
    pub fn distance(&self, reading: ProximityReading) -> Option<f64> {
        if !reading.is_ready() {
            return None;
        }
        self.config.converter.convert(reading.raw_value)
    }
}

impl PolledDevice for Vcnl4000 {
    fn id(&self) -> &str {
        &self.id
    }

    fn poll(&self) -> Result<Vec<EventPayload>, SensorError> {
        let proximity = self.read_proximity()?;
        let ambient = if self.config.measure_ambient {
            Some(self.read_ambient()?)
        } else {
            None
        };

        debug!(device = %self.id, raw = proximity.raw_value, "proximity measured");
        let mut events = vec![EventPayload::ProximityReceived {
            raw_value: proximity.raw_value,
            distance: self.distance(proximity),
        }];
        if let Some(ambient) = ambient {
            events.push(EventPayload::AmbientLightReceived {
                raw_value: ambient.raw_value,
            });
        }
        Ok(events)
    }
}
