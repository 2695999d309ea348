//! `rangebot-runtime` – the sweep and process-level plumbing.
//!
//! # Modules
//!
//! - [`sweep`] – [`SweepCoordinator`][sweep::SweepCoordinator]: drives a
//!   servo-mounted range sensor back and forth across its arc, pairing each
//!   fresh range reading with the angle it was taken at and publishing
//!   `PositionFound` events on its own event bus.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber (compact or JSON, filtered by `RUST_LOG`).

pub mod sweep;
pub mod telemetry;

pub use sweep::{Direction, RangeSample, Step, SweepConfig, SweepCoordinator, SweepPhase};
pub use telemetry::init_tracing;
