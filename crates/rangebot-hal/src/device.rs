//! The seams between drivers and the components that drive them.
//!
//! Every driver that can be polled implements [`PolledDevice`]; the servo
//! controller implements [`PwmOutput`].  The scheduler and the sweep only
//! ever talk to these traits, so a driver can be swapped for a simulated one
//! without touching scheduling or sweep logic.

use std::time::{Duration, Instant};

use rangebot_types::{EventPayload, SensorError};

/// A device with a periodic read cycle.
pub trait PolledDevice: Send + Sync {
    /// Stable identifier, e.g. `"srf08@0x70"`.  Used as the event source and
    /// the scheduler job key.
    fn id(&self) -> &str;

    /// Run one complete read cycle.
    ///
    /// Returns the data events produced by the cycle (possibly none).  An
    /// `Err` is converted by the caller into one `SensorException` event.
    ///
    /// # Errors
    ///
    /// Any [`SensorError`] raised during the cycle's bus I/O.
    fn poll(&self) -> Result<Vec<EventPayload>, SensorError>;
}

/// A multi-channel PWM output stage driving position-controlled servos.
///
/// Positions are expressed as on/off ticks of a 12-bit period; the value
/// 4096 in either slot is the constant-on / constant-off encoding.
pub trait PwmOutput: Send + Sync {
    /// Put every output into a known, fully-off state.
    fn reset(&self) -> Result<(), SensorError>;

    /// Program the output frequency shared by every channel.
    fn set_frequency(&self, hz: u32) -> Result<(), SensorError>;

    /// Program one channel's on and off ticks.
    fn set_channel_pwm(&self, channel: u8, on: u16, off: u16) -> Result<(), SensorError>;
}

/// Poll `check` until it returns `true` or `timeout` elapses, sleeping
/// `interval` between attempts.
///
/// Returns `Ok(false)` on expiry; errors from `check` are propagated
/// immediately.  `check` always runs at least once.
pub fn wait_until(
    timeout: Duration,
    interval: Duration,
    mut check: impl FnMut() -> Result<bool, SensorError>,
) -> Result<bool, SensorError> {
    let deadline = Instant::now() + timeout;
    loop {
        if check()? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(interval);
    }
}
