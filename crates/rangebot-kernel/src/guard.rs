//! [`PollGuard`] – per-device re-entrancy flag.
//!
//! A tick calls [`PollGuard::try_enter`]; if the previous cycle still holds
//! the [`PollPermit`] the tick is skipped and counted.  The permit clears the
//! flag when dropped, so the guard is released on success, on error, and on
//! panic alike.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One guard per device instance; never shared between devices.
#[derive(Debug, Default)]
pub struct PollGuard {
    busy: AtomicBool,
    skipped: AtomicU64,
}

impl PollGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the device for one cycle.
    ///
    /// Returns `None` (and counts a skipped tick) while another permit is
    /// alive.
    pub fn try_enter(self: &Arc<Self>) -> Option<PollPermit> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(PollPermit {
                guard: Arc::clone(self),
            })
        } else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Ticks rejected because a cycle was still running.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Proof that the holder owns the device's current cycle.
#[derive(Debug)]
pub struct PollPermit {
    guard: Arc<PollGuard>,
}

impl Drop for PollPermit {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_enter_is_rejected_until_permit_drops() {
        let guard = PollGuard::new();
        let permit = guard.try_enter().expect("first enter");
        assert!(guard.is_busy());
        assert!(guard.try_enter().is_none());
        assert_eq!(guard.skipped(), 1);

        drop(permit);
        assert!(!guard.is_busy());
        assert!(guard.try_enter().is_some());
    }

    #[test]
    fn permit_releases_on_panic() {
        let guard = PollGuard::new();
        let inner = Arc::clone(&guard);
        let result = std::thread::spawn(move || {
            let _permit = inner.try_enter().expect("enter");
            panic!("cycle blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(!guard.is_busy());
    }

    #[test]
    fn guards_are_independent() {
        let a = PollGuard::new();
        let b = PollGuard::new();
        let _held = a.try_enter().expect("a");
        assert!(b.try_enter().is_some());
    }
}
