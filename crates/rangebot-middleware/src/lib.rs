//! `rangebot-middleware` – event routing between drivers, the sweep, and
//! whoever is listening (loggers, telemetry, UIs).
//!
//! # Modules
//!
//! - [`bus`] – topic-partitioned publish/subscribe event bus built on Tokio
//!   broadcast channels, with an explicit [`EventBus::unsubscribe_all`].

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
