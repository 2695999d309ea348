//! 16-channel, 12-bit PWM servo controller (PCA9685-class).
//!
//! Every output shares one frequency, set through the PRESCALE register,
//! which only accepts writes while the oscillator is asleep.  Each channel
//! has four byte registers (ON_L, ON_H, OFF_L, OFF_H) starting at
//! `0x06 + 4 * channel`; bit 4 of the high bytes (tick 4096) selects a
//! constant-on or constant-off output instead of a pulse.
//!
//! Register writes are never retried.  A failure is logged here and returned,
//! so a failed four-register channel update must be re-issued in full.

use std::time::Duration;

use rangebot_types::SensorError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bus::I2cDevice;
use crate::device::PwmOutput;

// ────────────────────────────────────────────────────────────────────────────
// Register map
// ────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_ADDRESS: u16 = 0x40;
pub const CHANNEL_COUNT: u8 = 16;

pub const REG_MODE1: u8 = 0x00;
pub const REG_MODE2: u8 = 0x01;
pub const REG_LED0_ON_L: u8 = 0x06;
pub const REG_ALL_LED_ON_L: u8 = 0xFA;
pub const REG_PRESCALE: u8 = 0xFE;

/// Constant-output encoding for either edge.
pub const FULL: u16 = 4096;
/// Highest pulse tick.
pub const MAX_TICK: u16 = 4095;

pub const MIN_FREQUENCY_HZ: u32 = 24;
pub const MAX_FREQUENCY_HZ: u32 = 1526;
const OSCILLATOR_HZ: f64 = 25_000_000.0;

/// MODE1 bit patterns: `(keep mask, set bits)`.
pub mod mode1 {
    pub const DEFAULT_CONFIG: u8 = 0x00;
    pub const SLEEP: (u8, u8) = (0x7F, 0x10);
    pub const WAKE: (u8, u8) = (0x6F, 0x00);
    pub const RESTART: u8 = 0x80;
    pub const ALLCALL: (u8, u8) = (0x7E, 0x01);
    pub const SUBADR1: (u8, u8) = (0x77, 0x08);
    pub const SUBADR2: (u8, u8) = (0x7B, 0x04);
    pub const SUBADR3: (u8, u8) = (0x7D, 0x02);
}

/// Secondary I2C addresses the controller can answer on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAddress {
    One,
    Two,
    Three,
}

impl SubAddress {
    fn mask(self) -> (u8, u8) {
        match self {
            SubAddress::One => mode1::SUBADR1,
            SubAddress::Two => mode1::SUBADR2,
            SubAddress::Three => mode1::SUBADR3,
        }
    }
}

/// PRESCALE value for `hz`, or `None` outside `[24, 1526]` Hz.
pub fn prescale_for(hz: u32) -> Option<u8> {
    if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
        return None;
    }
    let divider = (OSCILLATOR_HZ / (4096.0 * f64::from(hz))).round() as i64 - 1;
    u8::try_from(divider).ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Pca9685Config {
    /// Pause after each sleep/wake transition (datasheet minimum 5 ms).
    pub settle_ms: u64,
}

impl Default for Pca9685Config {
    fn default() -> Self {
        Self { settle_ms: 10 }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Driver
// ────────────────────────────────────────────────────────────────────────────

pub struct Pca9685 {
    id: String,
    device: I2cDevice,
    config: Pca9685Config,
}

impl Pca9685 {
    pub fn new(device: I2cDevice, config: Pca9685Config) -> Self {
        Self {
            id: super::device_id("pca9685", device.address()),
            device,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ── Device configuration ────────────────────────────────────────────────

    /// Program the shared output frequency.
    ///
    /// Sequence: sleep → PRESCALE → wake → restart.
    ///
    /// # Errors
    ///
    /// [`SensorError::Range`] for `hz` outside `[24, 1526]`, before any I/O.
    pub fn set_frequency(&self, hz: u32) -> Result<(), SensorError> {
        let prescale = prescale_for(hz).ok_or_else(|| {
            SensorError::range("pwm_frequency_hz", hz, "[24, 1526]")
        })?;
        self.sleep()?;
        self.write_register(REG_PRESCALE, prescale)?;
        self.wake()?;
        self.restart()?;
        info!(device = %self.id, hz, prescale, "pwm frequency set");
        Ok(())
    }

    /// Frequency implied by the current PRESCALE register.
    pub fn pwm_update_rate(&self) -> Result<u32, SensorError> {
        let prescale = u32::from(self.device.read_register(REG_PRESCALE)?);
        Ok(25_000_000 / ((prescale + 1) * 4096))
    }

    /// Oscillator off; outputs hold.
    pub fn sleep(&self) -> Result<(), SensorError> {
        self.update_mode1(mode1::SLEEP)?;
        self.settle();
        Ok(())
    }

    /// Oscillator on.
    pub fn wake(&self) -> Result<(), SensorError> {
        self.update_mode1(mode1::WAKE)?;
        self.settle();
        Ok(())
    }

    /// Resume the outputs that were active before sleep.
    pub fn restart(&self) -> Result<(), SensorError> {
        let current = self.device.read_register(REG_MODE1)?;
        self.write_register(REG_MODE1, current | mode1::RESTART)?;
        self.settle();
        Ok(())
    }

    /// All channels fully off, MODE1 back to its default configuration.
    pub fn reset(&self) -> Result<(), SensorError> {
        self.set_all_pwm(0, FULL)?;
        self.write_register(REG_MODE1, mode1::DEFAULT_CONFIG)?;
        debug!(device = %self.id, "controller reset");
        Ok(())
    }

    pub fn set_all_call(&self, enable: bool) -> Result<(), SensorError> {
        self.set_mode1_flag(mode1::ALLCALL, enable)
    }

    pub fn set_sub_address(&self, sub: SubAddress, enable: bool) -> Result<(), SensorError> {
        self.set_mode1_flag(sub.mask(), enable)
    }

    pub fn mode1(&self) -> Result<u8, SensorError> {
        self.device.read_register(REG_MODE1)
    }

    pub fn mode2(&self) -> Result<u8, SensorError> {
        self.device.read_register(REG_MODE2)
    }

    // ── Channel control ─────────────────────────────────────────────────────

    /// Program one channel.  Each tick is 0–4095, or 4096 for constant.
    ///
    /// Four single-register writes; not atomic.
    pub fn set_channel_pwm(&self, channel: u8, on: u16, off: u16) -> Result<(), SensorError> {
        check_channel(channel)?;
        check_tick("on", on)?;
        check_tick("off", off)?;
        self.write_ticks(REG_LED0_ON_L + 4 * channel, on, off)
    }

    /// Program every channel at once through the ALL_LED registers.
    pub fn set_all_pwm(&self, on: u16, off: u16) -> Result<(), SensorError> {
        check_tick("on", on)?;
        check_tick("off", off)?;
        self.write_ticks(REG_ALL_LED_ON_L, on, off)
    }

    /// Read back a channel's `(on, off)` ticks.
    pub fn channel_pwm(&self, channel: u8) -> Result<(u16, u16), SensorError> {
        check_channel(channel)?;
        let base = REG_LED0_ON_L + 4 * channel;
        let mut ticks = [0u16; 2];
        for (slot, register) in ticks.iter_mut().zip([base, base + 2]) {
            let low = self.device.read_register(register)?;
            let high = self.device.read_register(register + 1)?;
            *slot = u16::from_le_bytes([low, high]);
        }
        Ok((ticks[0], ticks[1]))
    }

    pub fn set_full_on(&self, channel: u8) -> Result<(), SensorError> {
        self.set_channel_pwm(channel, FULL, 0)
    }

    pub fn set_full_off(&self, channel: u8) -> Result<(), SensorError> {
        self.set_channel_pwm(channel, 0, FULL)
    }

    pub fn set_full(&self, channel: u8, on: bool) -> Result<(), SensorError> {
        if on {
            self.set_full_on(channel)
        } else {
            self.set_full_off(channel)
        }
    }

    /// 0 → fully off, 100 → fully on, otherwise a pulse ending at
    /// `round(4095 * percent / 100)`.  Any other value (negative, above 100,
    /// NaN) is ignored without bus traffic.
    pub fn set_duty_cycle(&self, channel: u8, percent: f64) -> Result<(), SensorError> {
        const EPSILON: f64 = 0.0001;
        if percent.abs() < EPSILON {
            return self.set_full_off(channel);
        }
        if (percent - 100.0).abs() < EPSILON {
            return self.set_full_on(channel);
        }
        if !(percent > 0.0 && percent < 100.0) {
            debug!(device = %self.id, channel, percent, "duty cycle out of range; ignored");
            return Ok(());
        }
        let off = (f64::from(MAX_TICK) * percent / 100.0).round() as u16;
        self.set_channel_pwm(channel, 0, off)
    }

    // ── Register access ─────────────────────────────────────────────────────

    fn write_ticks(&self, base: u8, on: u16, off: u16) -> Result<(), SensorError> {
        let [on_low, on_high] = on.to_le_bytes();
        let [off_low, off_high] = off.to_le_bytes();
        self.write_register(base, on_low)?;
        self.write_register(base + 1, on_high)?;
        self.write_register(base + 2, off_low)?;
        self.write_register(base + 3, off_high)
    }

    fn update_mode1(&self, (keep, set): (u8, u8)) -> Result<(), SensorError> {
        let current = self.device.read_register(REG_MODE1)?;
        self.write_register(REG_MODE1, (current & keep) | set)
    }

    fn set_mode1_flag(&self, (keep, bit): (u8, u8), enable: bool) -> Result<(), SensorError> {
        self.update_mode1((keep, if enable { bit } else { 0 }))
    }

    fn write_register(&self, register: u8, value: u8) -> Result<(), SensorError> {
        self.device
            .write_register(register, value)
            .inspect_err(|e| warn!(device = %self.id, register, value, error = %e, "register write failed"))
    }

    fn settle(&self) {
        std::thread::sleep(Duration::from_millis(self.config.settle_ms));
    }
}

fn check_channel(channel: u8) -> Result<(), SensorError> {
    if channel >= CHANNEL_COUNT {
        return Err(SensorError::range("channel", channel, "[0, 15]"));
    }
    Ok(())
}

fn check_tick(edge: &str, tick: u16) -> Result<(), SensorError> {
    if tick > FULL {
        return Err(SensorError::range(
            format!("{edge}_tick"),
            tick,
            "[0, 4095] or 4096",
        ));
    }
    Ok(())
}

impl PwmOutput for Pca9685 {
    fn reset(&self) -> Result<(), SensorError> {
        Pca9685::reset(self)
    }

    fn set_frequency(&self, hz: u32) -> Result<(), SensorError> {
        Pca9685::set_frequency(self, hz)
    }

    fn set_channel_pwm(&self, channel: u8, on: u16, off: u16) -> Result<(), SensorError> {
        Pca9685::set_channel_pwm(self, channel, on, off)
    }
}
