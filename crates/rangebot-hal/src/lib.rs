//! `rangebot-hal` – Hardware Abstraction Layer
//!
//! Register-level drivers for the robot's I2C peripherals and the bus layer
//! they share.
//!
//! # Modules
//!
//! - [`bus`] – [`I2cBus`][bus::I2cBus], [`SharedBus`][bus::SharedBus],
//!   [`BusProvider`][bus::BusProvider] and [`I2cDevice`][bus::I2cDevice]:
//!   one lock per physical bus, devices opened by `(bus name, address)`.
//! - [`device`] – the [`PolledDevice`][device::PolledDevice] and
//!   [`PwmOutput`][device::PwmOutput] seams, plus the bounded
//!   [`wait_until`][device::wait_until] ready-flag poller.
//! - [`drivers`] – ADC, proximity/ambient, ultrasonic, humidity, servo
//!   controller, bridge and GPIO pulse-echo drivers.
//! - [`converter`] – raw value → distance curves.
//! - [`sim`] – in-process simulated bus and devices for tests and dry runs.

pub mod bus;
pub mod converter;
pub mod device;
pub mod drivers;
pub mod sim;

pub use bus::{BusError, BusProvider, I2cBus, I2cDevice, SharedBus};
pub use converter::{PowerLawConverter, RawValueConverter, ReciprocalConverter};
pub use device::{PolledDevice, PwmOutput, wait_until};
