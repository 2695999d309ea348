//! Pulse-echo ultrasonic ranger on two GPIO lines (HC-SR04-class).
//!
//! A 10 µs trigger pulse starts a measurement; the echo line is then held
//! high for the round-trip time of the ping.  Both edges are awaited with a
//! bounded polling loop that yields between checks, and the pulse width is
//! measured with the monotonic clock.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rangebot_types::{EventPayload, SensorError};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::converter::echo_width_to_mm;
use crate::device::PolledDevice;

/// One digital GPIO line.
pub trait GpioPin: Send {
    fn set(&mut self, high: bool) -> Result<(), SensorError>;
    fn is_high(&mut self) -> Result<bool, SensorError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Hcsr04Config {
    pub trigger_pulse_us: u64,
    /// Budget for each echo edge.
    pub echo_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for Hcsr04Config {
    fn default() -> Self {
        Self {
            trigger_pulse_us: 10,
            echo_timeout_ms: 40,
            poll_interval_ms: 250,
        }
    }
}

struct Pins {
    trigger: Box<dyn GpioPin>,
    echo: Box<dyn GpioPin>,
}

pub struct Hcsr04 {
    id: String,
    pins: Mutex<Pins>,
    config: Hcsr04Config,
}

impl Hcsr04 {
    /// `name` identifies the sensor, e.g. the trigger/echo pin numbers.
    pub fn new(
        name: &str,
        trigger: impl GpioPin + 'static,
        echo: impl GpioPin + 'static,
        config: Hcsr04Config,
    ) -> Self {
        Self {
            id: format!("hcsr04@{name}"),
            pins: Mutex::new(Pins {
                trigger: Box::new(trigger),
                echo: Box::new(echo),
            }),
            config,
        }
    }

    /// Fire one ping and return the echo pulse width.
    pub fn echo_width(&self) -> Result<Duration, SensorError> {
        let mut pins = self
            .pins
            .lock()
            .map_err(|_| SensorError::bus(self.id.clone(), "gpio lock poisoned"))?;

        pins.trigger.set(true)?;
        spin_for(Duration::from_micros(self.config.trigger_pulse_us));
        pins.trigger.set(false)?;

        let timeout = Duration::from_millis(self.config.echo_timeout_ms);
        self.await_level(pins.echo.as_mut(), true, timeout)?;
        let rising = Instant::now();
        self.await_level(pins.echo.as_mut(), false, timeout)?;
        Ok(rising.elapsed())
    }

    fn await_level(
        &self,
        echo: &mut dyn GpioPin,
        high: bool,
        timeout: Duration,
    ) -> Result<(), SensorError> {
        let deadline = Instant::now() + timeout;
        while echo.is_high()? != high {
            if Instant::now() >= deadline {
                return Err(SensorError::Timeout {
                    device: self.id.clone(),
                    what: if high { "echo rising edge" } else { "echo falling edge" }.to_string(),
                    waited_ms: self.config.echo_timeout_ms,
                });
            }
            std::thread::yield_now();
        }
        Ok(())
    }
}

/// Sub-millisecond delays are below the sleep granularity.
fn spin_for(duration: Duration) {
    let until = Instant::now() + duration;
    while Instant::now() < until {
        std::hint::spin_loop();
    }
}

impl PolledDevice for Hcsr04 {
    fn id(&self) -> &str {
        &self.id
    }

    fn poll(&self) -> Result<Vec<EventPayload>, SensorError> {
        let width = self.echo_width()?;
        let width_ms = width.as_secs_f64() * 1000.0;
        trace!(device = %self.id, width_us = width.as_micros() as u64, "echo measured");
        Ok(vec![EventPayload::ProximityReceived {
            raw_value: i32::try_from(width.as_micros()).unwrap_or(i32::MAX),
            distance: Some(echo_width_to_mm(width_ms)),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::sim_echo_pins;
    use rangebot_types::ErrorKind;

    #[test]
    fn pulse_width_becomes_distance() {
        let (trigger, echo) = sim_echo_pins(Some((Duration::from_millis(1), Duration::from_millis(5))));
        let sensor = Hcsr04::new("23/24", trigger, echo, Hcsr04Config::default());
        let events = sensor.poll().unwrap();
        match events.as_slice() {
            [EventPayload::ProximityReceived { raw_value, distance }] => {
                assert!(*raw_value >= 4_000, "width {raw_value} µs");
                let mm = distance.unwrap();
                assert!(mm >= 170.145 * 4.0 && mm < 170.145 * 50.0, "distance {mm}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_echo_times_out() {
        let (trigger, echo) = sim_echo_pins(None);
        let sensor = Hcsr04::new(
            "23/24",
            trigger,
            echo,
            Hcsr04Config {
                echo_timeout_ms: 5,
                ..Hcsr04Config::default()
            },
        );
        let err = sensor.poll().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("rising edge"));
    }
}
