//! [`PollingScheduler`] – one periodic timer per device.
//!
//! Each scheduled device gets its own tokio task ticking at the device's
//! interval.  A tick claims the device's [`PollGuard`]; if the previous cycle
//! still holds it the tick is dropped (no queueing, no overlap).  The cycle
//! itself runs on the blocking pool because drivers sleep through conversion
//! delays and ready-bit polling.
//!
//! Cycle results go to the shared [`EventBus`]: every returned payload is
//! published under the device's id, and an error becomes exactly one
//! `SensorException`.  Nothing a device does can stop another device's timer.
//!
//! Cancellation is cooperative.  [`PollingScheduler::stop`] ends the timer
//! and drops the scheduler's handle on the device at once; a cycle already
//! running on the blocking pool finishes first and then drops its own.
//! Guards outlive their jobs: a device stopped or replaced mid-cycle is
//! re-scheduled against the same guard, so the new timer skips until the old
//! cycle is done.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rangebot_hal::PolledDevice;
use rangebot_middleware::EventBus;
use rangebot_types::{Event, EventPayload, SensorError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::guard::PollGuard;
use crate::health::DeviceWatchdog;

/// Fastest supported poll interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(5);
/// Slowest supported poll interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(30);

/// A device is stale after this many intervals without a successful cycle.
const STALE_AFTER_INTERVALS: u32 = 4;

struct Job {
    handle: JoinHandle<()>,
    guard: Arc<PollGuard>,
    interval: Duration,
}

/// Owns every device timer.  Dropping the scheduler stops them all.
pub struct PollingScheduler {
    bus: EventBus,
    jobs: Mutex<HashMap<String, Job>>,
    /// One guard per device id for the scheduler's lifetime.
    guards: Mutex<HashMap<String, Arc<PollGuard>>>,
    watchdog: Arc<Mutex<DeviceWatchdog>>,
}

impl PollingScheduler {
    /// Create a scheduler publishing every cycle's events on `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            jobs: Mutex::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
            watchdog: Arc::new(Mutex::new(DeviceWatchdog::new())),
        }
    }

    /// Start polling `device` every `interval`.
    ///
    /// The first cycle runs immediately.  Scheduling an id that is already
    /// scheduled replaces the previous job.  Must be called from within a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// [`SensorError::Range`] when `interval` is outside
    /// [`MIN_INTERVAL`]..=[`MAX_INTERVAL`].
    pub fn schedule(
        &self,
        device: Arc<dyn PolledDevice>,
        interval: Duration,
    ) -> Result<(), SensorError> {
        if !(MIN_INTERVAL..=MAX_INTERVAL).contains(&interval) {
            return Err(SensorError::range(
                "poll_interval_ms",
                interval.as_millis(),
                "[5, 30000]",
            ));
        }

        let id = device.id().to_string();
        let guard = Arc::clone(
            lock(&self.guards)
                .entry(id.clone())
                .or_insert_with(PollGuard::new),
        );
        lock(&self.watchdog).register(&id, interval * STALE_AFTER_INTERVALS);

        let handle = tokio::spawn(run_timer(
            device,
            interval,
            Arc::clone(&guard),
            self.bus.clone(),
            Arc::clone(&self.watchdog),
        ));

        let previous = lock(&self.jobs).insert(
            id.clone(),
            Job {
                handle,
                guard,
                interval,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
            debug!(device = %id, "replaced existing poll job");
        }
        info!(device = %id, interval_ms = interval.as_millis() as u64, "device scheduled");
        Ok(())
    }

    /// Cancel `device_id`'s timer and release the scheduler's handle on it.
    ///
    /// Returns `false` when the id was not scheduled.
    pub fn stop(&self, device_id: &str) -> bool {
        let Some(job) = lock(&self.jobs).remove(device_id) else {
            return false;
        };
        job.handle.abort();
        lock(&self.watchdog).deregister(device_id);
        info!(device = %device_id, skipped_ticks = job.guard.skipped(), "device stopped");
        true
    }

    /// Cancel every timer.
    pub fn stop_all(&self) {
        let ids: Vec<String> = lock(&self.jobs).keys().cloned().collect();
        for id in ids {
            self.stop(&id);
        }
    }

    pub fn is_scheduled(&self, device_id: &str) -> bool {
        lock(&self.jobs).contains_key(device_id)
    }

    /// Scheduled ids with their intervals, sorted by id.
    pub fn scheduled(&self) -> Vec<(String, Duration)> {
        let mut jobs: Vec<(String, Duration)> = lock(&self.jobs)
            .iter()
            .map(|(id, job)| (id.clone(), job.interval))
            .collect();
        jobs.sort();
        jobs
    }

    /// Ticks skipped because the device's previous cycle was still running,
    /// counted across every job scheduled under this id.
    pub fn skipped_ticks(&self, device_id: &str) -> Option<u64> {
        lock(&self.jobs)
            .get(device_id)
            .map(|job| job.guard.skipped())
    }

    /// Scheduled devices without a successful cycle for
    /// `4 × interval`, sorted by id.
    pub fn stale_devices(&self) -> Vec<String> {
        lock(&self.watchdog).stale_devices()
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        for job in lock(&self.jobs).values() {
            job.handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ────────────────────────────────────────────────────────────────────────────
// Timer task and cycle
// ────────────────────────────────────────────────────────────────────────────

async fn run_timer(
    device: Arc<dyn PolledDevice>,
    interval: Duration,
    guard: Arc<PollGuard>,
    bus: EventBus,
    watchdog: Arc<Mutex<DeviceWatchdog>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(permit) = guard.try_enter() else {
            trace!(device = %device.id(), "previous cycle still running; tick skipped");
            continue;
        };

        let device = Arc::clone(&device);
        let bus = bus.clone();
        let watchdog = Arc::clone(&watchdog);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run_cycle(device.as_ref(), &bus, &watchdog);
        });
    }
}

/// Run one read cycle and publish its outcome.
fn run_cycle(device: &dyn PolledDevice, bus: &EventBus, watchdog: &Mutex<DeviceWatchdog>) {
    let id = device.id();
    match device.poll() {
        Ok(payloads) => {
            trace!(device = %id, events = payloads.len(), "cycle complete");
            for payload in payloads {
                bus.publish(Event::new(id, payload));
            }
            lock(watchdog).heartbeat(id);
        }
        Err(cause) => {
            warn!(device = %id, kind = ?cause.kind(), error = %cause, "poll cycle failed");
            bus.publish(Event::new(
                id,
                EventPayload::SensorException {
                    message: format!("poll cycle of {id} failed"),
                    cause,
                },
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangebot_middleware::Topic;
    use rangebot_types::{ErrorKind, ProximityReading};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test device: sleeps `work` per cycle, tracks concurrency, and fails
    /// the cycles listed in `fail_on`.
    struct ProbeDevice {
        id: String,
        work: Duration,
        fail_on: Vec<usize>,
        cycles: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ProbeDevice {
        fn new(id: &str, work: Duration, fail_on: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                work,
                fail_on,
                cycles: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn cycles(&self) -> usize {
            self.cycles.load(Ordering::SeqCst)
        }
    }

    impl PolledDevice for ProbeDevice {
        fn id(&self) -> &str {
            &self.id
        }

        fn poll(&self) -> Result<Vec<EventPayload>, SensorError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.work);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let cycle = self.cycles.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.contains(&cycle) {
                return Err(SensorError::Timeout {
                    device: self.id.clone(),
                    what: "proximity ready".to_string(),
                    waited_ms: 1,
                });
            }
            let reading = ProximityReading {
                raw_value: cycle as i32,
            };
            Ok(vec![EventPayload::ProximityReceived {
                raw_value: reading.raw_value,
                distance: None,
            }])
        }
    }

    #[tokio::test]
    async fn interval_outside_supported_range_is_rejected() {
        let scheduler = PollingScheduler::new(EventBus::default());
        let device = ProbeDevice::new("probe", Duration::ZERO, vec![]);
        for interval in [Duration::from_millis(4), Duration::from_secs(31)] {
            let err = scheduler
                .schedule(device.clone(), interval)
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Range);
        }
        assert!(!scheduler.is_scheduled("probe"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_cycle_causes_ticks_to_be_skipped_not_overlapped() {
        let scheduler = PollingScheduler::new(EventBus::default());
        let device = ProbeDevice::new("slow", Duration::from_millis(60), vec![]);
        scheduler
            .schedule(device.clone(), Duration::from_millis(10))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop("slow");

        assert_eq!(device.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(device.cycles() >= 2);
        assert!(device.cycles() <= 5, "cycles = {}", device.cycles());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rescheduling_waits_for_the_running_cycle() {
        let scheduler = PollingScheduler::new(EventBus::default());
        let device = ProbeDevice::new("slow", Duration::from_millis(200), vec![]);
        scheduler
            .schedule(device.clone(), Duration::from_millis(30))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        scheduler
            .schedule(device.clone(), Duration::from_millis(30))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(device.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(scheduler.skipped_ticks("slow").unwrap() > 0);

        assert!(scheduler.stop("slow"));
        scheduler
            .schedule(device.clone(), Duration::from_millis(30))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop_all();
        assert_eq!(device.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn skipped_ticks_are_counted() {
        let scheduler = PollingScheduler::new(EventBus::default());
        let device = ProbeDevice::new("slow", Duration::from_millis(50), vec![]);
        scheduler
            .schedule(device.clone(), Duration::from_millis(5))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(scheduler.skipped_ticks("slow").unwrap() > 0);
        assert_eq!(scheduler.skipped_ticks("unknown"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_cycle_publishes_one_exception_and_no_data() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut faults = bus.subscribe_to(Topic::Faults);
        let mut readings = bus.subscribe_to(Topic::Readings);
        let scheduler = PollingScheduler::new(bus.clone());
        let device = ProbeDevice::new("vcnl4000@0x13", Duration::ZERO, vec![0]);
        scheduler.schedule(device.clone(), Duration::from_secs(30))?;

        let fault = tokio::time::timeout(Duration::from_secs(1), faults.recv()).await??;
        assert_eq!(fault.source, "vcnl4000@0x13");
        match fault.payload {
            EventPayload::SensorException { cause, .. } => {
                assert_eq!(cause.kind(), ErrorKind::Timeout)
            }
            other => panic!("unexpected {other:?}"),
        }

        // The 30 s interval guarantees only the first cycle has run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(device.cycles(), 1);
        assert!(faults.try_recv().is_err());
        assert!(readings.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_device_does_not_halt_others() {
        let bus = EventBus::default();
        let mut readings = bus.subscribe_to(Topic::Readings);
        let scheduler = PollingScheduler::new(bus.clone());
        let broken = ProbeDevice::new("broken", Duration::ZERO, (0..1000).collect());
        let healthy = ProbeDevice::new("healthy", Duration::ZERO, vec![]);
        scheduler.schedule(broken.clone(), Duration::from_millis(5)).unwrap();
        scheduler.schedule(healthy.clone(), Duration::from_millis(5)).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(broken.cycles() > 1, "broken device keeps being polled");
        let event = readings.recv().await.unwrap();
        assert_eq!(event.source, "healthy");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_cancels_timer_and_releases_device() {
        let scheduler = PollingScheduler::new(EventBus::default());
        let device = ProbeDevice::new("srf08@0x70", Duration::ZERO, vec![]);
        scheduler
            .schedule(device.clone(), Duration::from_millis(5))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(scheduler.stop("srf08@0x70"));
        assert!(!scheduler.stop("srf08@0x70"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_stop = device.cycles();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(device.cycles(), after_stop);
        assert_eq!(Arc::strong_count(&device), 1, "scheduler released its handle");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_device_goes_stale() {
        let scheduler = PollingScheduler::new(EventBus::default());
        let broken = ProbeDevice::new("broken", Duration::ZERO, (0..1000).collect());
        let healthy = ProbeDevice::new("healthy", Duration::ZERO, vec![]);
        scheduler.schedule(broken, Duration::from_millis(5)).unwrap();
        scheduler.schedule(healthy, Duration::from_millis(5)).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(scheduler.stale_devices(), vec!["broken".to_string()]);

        scheduler.stop_all();
        assert!(scheduler.scheduled().is_empty());
        assert!(scheduler.stale_devices().is_empty());
    }
}
