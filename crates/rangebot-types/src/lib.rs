use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Sentinel raw value meaning "the device did not report ready within its
/// timeout".  Never a valid measurement.
pub const NOT_READY: i32 = -1;

/// One polled ADC channel conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReading {
    /// Raw 16-bit conversion register contents.
    pub raw_value: i32,
    /// Single-ended input channel (0-3).
    pub channel: u8,
    /// 7-bit slave address of the converter that produced the reading.
    pub device_address: u16,
}

impl ChannelReading {
    /// Convert the raw conversion code to volts for a converter whose
    /// programmable-gain amplifier spans `±full_scale_volts`.
    ///
    /// The conversion register holds a two's-complement value, so codes above
    /// `0x7FFF` are negative input voltages.
    pub fn volts(&self, full_scale_volts: f64) -> f64 {
        let signed = self.raw_value as u16 as i16;
        f64::from(signed) * full_scale_volts / 32768.0
    }
}

/// A single proximity / range measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximityReading {
    /// Raw register value, or [`NOT_READY`].
    pub raw_value: i32,
}

impl ProximityReading {
    /// A reading that was never observed ready.
    pub fn not_ready() -> Self {
        Self {
            raw_value: NOT_READY,
        }
    }

    /// `true` unless this is the [`NOT_READY`] sentinel.
    pub fn is_ready(&self) -> bool {
        self.raw_value != NOT_READY
    }
}

/// A single ambient-light measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmbientReading {
    /// Raw register value, or [`NOT_READY`].
    pub raw_value: i32,
}

impl AmbientReading {
    /// A reading that was never observed ready.
    pub fn not_ready() -> Self {
        Self {
            raw_value: NOT_READY,
        }
    }

    /// `true` unless this is the [`NOT_READY`] sentinel.
    pub fn is_ready(&self) -> bool {
        self.raw_value != NOT_READY
    }
}

/// Unified event wrapper for everything published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Identifier of the publishing device or component, e.g. `"srf08@0x70"`.
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` in a fresh envelope stamped with the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Everything a device or the sweep can report to its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// One ADC channel finished converting.
    ChannelReadingDone(ChannelReading),
    /// A proximity or range sensor produced a reading.  `distance` is the
    /// converted physical value when the device has a converter.
    ProximityReceived { raw_value: i32, distance: Option<f64> },
    /// The ambient-light channel produced a reading.
    AmbientLightReceived { raw_value: i32 },
    /// The humidity/temperature sensor produced a validated pair.
    ClimateReceived {
        temperature_c: f64,
        relative_humidity: f64,
        dew_point_c: f64,
    },
    /// The sweep paired a servo angle with a range reading.
    PositionFound {
        angle: i32,
        distance: Option<f64>,
        raw_value: i32,
    },
    /// A device cycle or sweep step failed.
    SensorException { message: String, cause: SensorError },
}

/// Distinguishing class of a [`SensorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Bus,
    Timeout,
    Checksum,
    Range,
}

/// Error taxonomy shared by every driver, the scheduler, and the sweep.
///
/// Only [`SensorError::Range`] is raised before any bus traffic; the other
/// classes happen during an I/O cycle.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SensorError {
    #[error("Bus error on {device}: {details}")]
    Bus { device: String, details: String },

    #[error("Timeout on {device}: {what} not observed within {waited_ms} ms")]
    Timeout {
        device: String,
        what: String,
        waited_ms: u64,
    },

    #[error("Checksum mismatch on {device}: received 0x{expected:02X}, computed 0x{computed:02X}")]
    Checksum {
        device: String,
        expected: u8,
        computed: u8,
    },

    #[error("Range error: {parameter} = {value} is outside {supported}")]
    Range {
        parameter: String,
        value: String,
        supported: String,
    },
}

impl SensorError {
    /// The [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SensorError::Bus { .. } => ErrorKind::Bus,
            SensorError::Timeout { .. } => ErrorKind::Timeout,
            SensorError::Checksum { .. } => ErrorKind::Checksum,
            SensorError::Range { .. } => ErrorKind::Range,
        }
    }

    /// Shorthand for a [`SensorError::Range`] rejection.
    pub fn range(
        parameter: impl Into<String>,
        value: impl ToString,
        supported: impl Into<String>,
    ) -> Self {
        SensorError::Range {
            parameter: parameter.into(),
            value: value.to_string(),
            supported: supported.into(),
        }
    }

    /// Shorthand for a [`SensorError::Bus`] failure.
    pub fn bus(device: impl Into<String>, details: impl ToString) -> Self {
        SensorError::Bus {
            device: device.into(),
            details: details.to_string(),
        }
    }
}
