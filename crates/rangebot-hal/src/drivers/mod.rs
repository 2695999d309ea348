//! Device drivers, one parameterized driver per device family.
//!
//! Each driver owns an [`I2cDevice`][crate::bus::I2cDevice] handle (or a GPIO
//! pair for the pulse-echo ranger) plus a `serde` config struct with
//! datasheet defaults, and implements
//! [`PolledDevice`][crate::device::PolledDevice] where it has a read cycle.
//! The servo controller has no read cycle; it is commanded directly.

pub mod ads1115;
pub mod arduino_range;
pub mod hcsr04;
pub mod htu21d;
pub mod pca9685;
pub mod srf08;
pub mod vcnl4000;

/// `"<family>@0x<address>"`, the event source and scheduler key of a device.
pub(crate) fn device_id(family: &str, address: u16) -> String {
    format!("{family}@0x{address:02x}")
}
