//! [`DeviceWatchdog`] – per-device liveness tracking.
//!
//! The scheduler registers every device with a silence budget and
//! heartbeats it after each successful cycle.  A device that keeps failing,
//! or whose cycles keep being skipped, stops heartbeating and shows up in
//! [`DeviceWatchdog::stale_devices`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Liveness of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    /// A cycle succeeded within the budget.
    Live,
    /// No successful cycle within the budget.
    Stale,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct Entry {
    last_success: Instant,
    budget: Duration,
}

// ────────────────────────────────────────────────────────────────────────────
// DeviceWatchdog
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use std::time::Duration;
/// use rangebot_kernel::health::{DeviceHealth, DeviceWatchdog};
///
/// let mut wd = DeviceWatchdog::new();
/// wd.register("srf08@0x70", Duration::from_secs(1));
/// wd.heartbeat("srf08@0x70");
///
/// assert_eq!(wd.health("srf08@0x70"), DeviceHealth::Live);
/// ```
#[derive(Default)]
pub struct DeviceWatchdog {
    devices: HashMap<String, Entry>,
}

impl DeviceWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `device_id`.  The clock starts now; re-registering resets it.
    pub fn register(&mut self, device_id: &str, budget: Duration) {
        self.devices.insert(
            device_id.to_string(),
            Entry {
                last_success: Instant::now(),
                budget,
            },
        );
    }

    /// Stop tracking `device_id`.
    pub fn deregister(&mut self, device_id: &str) {
        self.devices.remove(device_id);
    }

    /// Record a successful cycle.  Unknown ids are ignored.
    pub fn heartbeat(&mut self, device_id: &str) {
        if let Some(entry) = self.devices.get_mut(device_id) {
            entry.last_success = Instant::now();
        }
    }

    /// Unknown devices are [`DeviceHealth::Stale`].
    pub fn health(&self, device_id: &str) -> DeviceHealth {
        match self.devices.get(device_id) {
            Some(entry) if entry.last_success.elapsed() <= entry.budget => DeviceHealth::Live,
            _ => DeviceHealth::Stale,
        }
    }

    /// Ids of every tracked device past its budget, sorted.
    pub fn stale_devices(&self) -> Vec<String> {
        let mut stale: Vec<String> = self
            .devices
            .iter()
            .filter(|(_, entry)| entry.last_success.elapsed() > entry.budget)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Time since the last successful cycle of `device_id`.
    pub fn silence(&self, device_id: &str) -> Option<Duration> {
        self.devices
            .get(device_id)
            .map(|entry| entry.last_success.elapsed())
    }
}
