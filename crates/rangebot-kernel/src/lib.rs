//! `rangebot-kernel` – Scheduling & Health
//!
//! Drives every device's read cycle and keeps track of which devices have
//! gone quiet.
//!
//! # Modules
//!
//! - [`scheduler`] – [`PollingScheduler`][scheduler::PollingScheduler]:
//!   one periodic timer per device, each cycle run on the blocking pool and
//!   its results published on the event bus.  A failing device becomes a
//!   `SensorException` event and never halts the others.
//! - [`guard`] – [`PollGuard`][guard::PollGuard]: the per-device
//!   re-entrancy flag that makes a tick skip while the previous cycle of the
//!   same device is still running.
//! - [`health`] – [`DeviceWatchdog`][health::DeviceWatchdog]: heartbeats on
//!   every successful cycle; lists devices silent past their budget.

pub mod guard;
pub mod health;
pub mod scheduler;

pub use guard::{PollGuard, PollPermit};
pub use health::{DeviceHealth, DeviceWatchdog};
pub use scheduler::{MAX_INTERVAL, MIN_INTERVAL, PollingScheduler};
