//! Four-channel 16-bit ADC (ADS1115-class), single-shot single-ended reads.
//!
//! A conversion is one 3-byte config write (pointer 0x01 + big-endian config
//! word), a fixed conversion delay, then a pointer-0x00 write-read of the
//! big-endian result.

use std::time::Duration;

use rangebot_types::{ChannelReading, EventPayload, SensorError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::bus::I2cDevice;
use crate::device::PolledDevice;

// ────────────────────────────────────────────────────────────────────────────
// Register map
// ────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_ADDRESS: u16 = 0x48;

pub const POINTER_CONVERT: u8 = 0x00;
pub const POINTER_CONFIG: u8 = 0x01;

pub const CONFIG_OS_SINGLE: u16 = 0x8000;
pub const CONFIG_MUX_SINGLE: [u16; 4] = [0x4000, 0x5000, 0x6000, 0x7000];
pub const CONFIG_MODE_SINGLE: u16 = 0x0100;
/// Comparator disabled; traditional, active-low, non-latching are all 0.
pub const CONFIG_CQUE_NONE: u16 = 0x0003;

/// Highest single-ended input.
pub const MAX_CHANNEL: u8 = 3;

/// Programmable-gain amplifier setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gain {
    /// ±6.144 V
    #[default]
    TwoThirds,
    /// ±4.096 V
    One,
    /// ±2.048 V
    Two,
    /// ±1.024 V
    Four,
    /// ±0.512 V
    Eight,
    /// ±0.256 V
    Sixteen,
}

impl Gain {
    /// PGA field of the config word.
    pub fn bits(self) -> u16 {
        match self {
            Gain::TwoThirds => 0x0000,
            Gain::One => 0x0200,
            Gain::Two => 0x0400,
            Gain::Four => 0x0600,
            Gain::Eight => 0x0800,
            Gain::Sixteen => 0x0A00,
        }
    }

    pub fn full_scale_volts(self) -> f64 {
        match self {
            Gain::TwoThirds => 6.144,
            Gain::One => 4.096,
            Gain::Two => 2.048,
            Gain::Four => 1.024,
            Gain::Eight => 0.512,
            Gain::Sixteen => 0.256,
        }
    }
}

/// Conversion rate; the DR field of the config word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataRate {
    Sps8,
    Sps16,
    Sps32,
    Sps64,
    #[default]
    Sps128,
    Sps250,
    Sps475,
    Sps860,
}

impl DataRate {
    pub fn bits(self) -> u16 {
        match self {
            DataRate::Sps8 => 0x0000,
            DataRate::Sps16 => 0x0020,
            DataRate::Sps32 => 0x0040,
            DataRate::Sps64 => 0x0060,
            DataRate::Sps128 => 0x0080,
            DataRate::Sps250 => 0x00A0,
            DataRate::Sps475 => 0x00C0,
            DataRate::Sps860 => 0x00E0,
        }
    }

    pub fn samples_per_second(self) -> u16 {
        match self {
            DataRate::Sps8 => 8,
            DataRate::Sps16 => 16,
            DataRate::Sps32 => 32,
            DataRate::Sps64 => 64,
            DataRate::Sps128 => 128,
            DataRate::Sps250 => 250,
            DataRate::Sps475 => 475,
            DataRate::Sps860 => 860,
        }
    }
}

/// ADC driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ads1115Config {
    /// Bit `n` set = report channel `n` on every poll.
    pub channel_mask: u8,
    pub gain: Gain,
    pub data_rate: DataRate,
    /// Wait between the config write and the result read.
    pub conversion_delay_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for Ads1115Config {
    fn default() -> Self {
        Self {
            channel_mask: 0b0001,
            gain: Gain::default(),
            data_rate: DataRate::default(),
            conversion_delay_ms: 10,
            poll_interval_ms: 250,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Driver
// ────────────────────────────────────────────────────────────────────────────

pub struct Ads1115 {
    id: String,
    device: I2cDevice,
    config: Ads1115Config,
}

impl Ads1115 {
    pub fn new(device: I2cDevice, config: Ads1115Config) -> Self {
        Self {
            id: super::device_id("ads1115", device.address()),
            device,
            config,
        }
    }

    pub fn config(&self) -> &Ads1115Config {
        &self.config
    }

    /// The config word that starts a single-shot conversion on `channel`,
    /// or `None` for a channel the converter does not have.
    pub fn config_word(&self, channel: u8) -> Option<u16> {
        let mux = *CONFIG_MUX_SINGLE.get(usize::from(channel))?;
        Some(
            CONFIG_CQUE_NONE
                | self.config.data_rate.bits()
                | CONFIG_MODE_SINGLE
                | self.config.gain.bits()
                | mux
                | CONFIG_OS_SINGLE,
        )
    }

    /// Convert one single-ended channel.
    ///
    /// Returns `Ok(None)` without touching the bus when `channel > 3`.
    pub fn read_single_ended(&self, channel: u8) -> Result<Option<ChannelReading>, SensorError> {
        let Some(config) = self.config_word(channel) else {
            debug!(device = %self.id, channel, "unsupported channel; no conversion");
            return Ok(None);
        };

        let [high, low] = config.to_be_bytes();
        self.device.write(&[POINTER_CONFIG, high, low])?;
        std::thread::sleep(Duration::from_millis(self.config.conversion_delay_ms));
        let raw = self.device.read_register_pair(POINTER_CONVERT)?;

        trace!(device = %self.id, channel, raw, "conversion complete");
        Ok(Some(ChannelReading {
            raw_value: i32::from(raw),
            channel,
            device_address: self.device.address(),
        }))
    }
}

impl PolledDevice for Ads1115 {
    fn id(&self) -> &str {
        &self.id
    }

    /// Convert every masked channel.
    ///
    /// A failed channel becomes a `SensorException` next to the readings of
    /// the channels that converted.  The cycle fails only when no channel
    /// did.
    fn poll(&self) -> Result<Vec<EventPayload>, SensorError> {
        let mut events = Vec::new();
        let mut converted = false;
        let mut first_error = None;
        for channel in (0..=MAX_CHANNEL).filter(|c| self.config.channel_mask & (1 << c) != 0) {
            match self.read_single_ended(channel) {
                Ok(Some(reading)) => {
                    converted = true;
                    events.push(EventPayload::ChannelReadingDone(reading));
                }
                Ok(None) => {}
                Err(cause) => {
                    warn!(device = %self.id, channel, error = %cause, "channel conversion failed");
                    if first_error.is_none() {
                        first_error = Some(cause.clone());
                    }
                    events.push(EventPayload::SensorException {
                        message: format!("conversion of channel {channel} on {} failed", self.id),
                        cause,
                    });
                }
            }
        }
        match first_error {
            Some(cause) if !converted => Err(cause),
            _ => Ok(events),
        }
    }
}
