//! Raw-value → physical-distance converters.
//!
//! A driver holds an optional `Box<dyn RawValueConverter>` and attaches the
//! converted value to the events it publishes.  Converters never fail; a raw
//! value outside the curve's domain yields `None`.

use serde::{Deserialize, Serialize};

/// Maps a raw sensor register value to a physical distance.
pub trait RawValueConverter: Send + Sync {
    fn convert(&self, raw_value: i32) -> Option<f64>;
}

/// Reciprocal curve `dx / (raw - dy)` in millimetres, the characteristic of
/// an IR proximity sensor whose counts approach the offset `dy` at infinity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReciprocalConverter {
    pub dx: f64,
    pub dy: f64,
}

impl Default for ReciprocalConverter {
    fn default() -> Self {
        Self {
            dx: 5250.0,
            dy: 2370.0,
        }
    }
}

impl RawValueConverter for ReciprocalConverter {
    fn convert(&self, raw_value: i32) -> Option<f64> {
        let span = f64::from(raw_value) - self.dy;
        (raw_value >= 0 && span > 0.0).then(|| self.dx / span)
    }
}

/// Power-law curve `(factor / raw)^(1 / exponent)` in centimetres, used for
/// analog IR rangers sampled through the ADC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerLawConverter {
    pub factor: f64,
    pub exponent: f64,
}

impl Default for PowerLawConverter {
    fn default() -> Self {
        Self {
            factor: 4_221_057.491,
            exponent: 1.268_14,
        }
    }
}

impl RawValueConverter for PowerLawConverter {
    fn convert(&self, raw_value: i32) -> Option<f64> {
        if raw_value <= 0 || self.exponent == 0.0 {
            return None;
        }
        Some((self.factor / f64::from(raw_value)).powf(1.0 / self.exponent))
    }
}

/// Round-trip echo duration in microseconds → one-way distance in cm
/// (sound covers 1 cm in 29.1 µs).
pub fn echo_duration_to_cm(duration_us: f64) -> f64 {
    (duration_us / 2.0) / 29.1
}

/// Round-trip echo pulse width in milliseconds → one-way distance in mm.
pub fn echo_width_to_mm(width_ms: f64) -> f64 {
    170.145 * width_ms
}
