//! [`SweepCoordinator`] – back-and-forth scan of a servo-mounted range sensor.
//!
//! # State machine
//!
//! ```text
//!   Idle ──start()──▶ Sweeping(Incrementing) ◀──▶ Sweeping(Decrementing)
//!                            │                          │
//!                            └────────stop()────────────┴──▶ Stopped
//! ```
//!
//! Every fresh range reading advances the servo one step (nominally 5°) in
//! the current direction, clamped to `[min, max]`.  The direction flips
//! exactly when a clamp is hit.  The reading is paired with the angle of the
//! position it was *captured* at and published as `PositionFound`.
//!
//! Only one advance is ever in flight: a reading that arrives while the
//! previous advance (servo write plus step settle) is still running is
//! dropped.  A failed servo write publishes a `SensorException` and leaves
//! the committed position and direction untouched, so the next reading
//! retries the same step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rangebot_hal::PwmOutput;
use rangebot_middleware::{EventBus, Topic};
use rangebot_types::{Event, EventPayload, NOT_READY, SensorError};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Nominal angular step between two readings.
const STEP_DEGREES: f64 = 5.0;
/// Full arc covered by `[min, max]`.
const ARC_DEGREES: f64 = 180.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// PWM channel the sweep servo is wired to.
    pub channel: u8,
    /// Off-tick of the servo at 0°.
    pub min: u16,
    /// Off-tick of the servo at 180°.
    pub max: u16,
    pub pwm_frequency_hz: u32,
    /// Wait after moving to `min` in [`SweepCoordinator::start`].
    pub start_settle_ms: u64,
    /// Wait after every step before the next reading is accepted.
    pub step_settle_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            min: 250,
            max: 800,
            pwm_frequency_hz: 60,
            start_settle_ms: 500,
            step_settle_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incrementing,
    Decrementing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    Idle,
    Sweeping(Direction),
    Stopped,
}

/// A range reading as the sweep consumes it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeSample {
    pub raw_value: i32,
    pub distance: Option<f64>,
}

impl RangeSample {
    /// Extract a sample from a `ProximityReceived` payload.
    pub fn from_payload(payload: &EventPayload) -> Option<Self> {
        match payload {
            EventPayload::ProximityReceived {
                raw_value,
                distance,
            } => Some(Self {
                raw_value: *raw_value,
                distance: *distance,
            }),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.raw_value != NOT_READY
    }
}

/// What [`SweepCoordinator::on_reading`] did with a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The servo moved to `position`; the reading was published at `angle`.
    Advanced { position: u16, angle: i32 },
    /// Another advance was still in flight.
    Busy,
    /// The reading carried the not-ready sentinel.
    NotReady,
    /// The sweep is idle or stopped.
    Inactive,
    /// The servo write failed; nothing was committed.
    Failed,
}

/// Next position and direction from `position`, stepping `step` toward the
/// bound `direction` points at.
pub fn next_position(
    position: u16,
    direction: Direction,
    step: u16,
    min: u16,
    max: u16,
) -> (u16, Direction) {
    match direction {
        Direction::Incrementing => {
            let next = position.saturating_add(step);
            if next >= max {
                (max, Direction::Decrementing)
            } else {
                (next, Direction::Incrementing)
            }
        }
        Direction::Decrementing => {
            let next = position.saturating_sub(step);
            if next <= min {
                (min, Direction::Incrementing)
            } else {
                (next, Direction::Decrementing)
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

struct SweepState {
    phase: SweepPhase,
    position: u16,
}

/// Clears the in-flight flag however the advance ends.
struct Advancing<'a>(&'a AtomicBool);

impl Drop for Advancing<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ────────────────────────────────────────────────────────────────────────────
// SweepCoordinator
// ────────────────────────────────────────────────────────────────────────────

pub struct SweepCoordinator {
    id: String,
    pwm: Arc<dyn PwmOutput>,
    config: SweepConfig,
    step: u16,
    units_per_degree: f64,
    advancing: AtomicBool,
    state: Mutex<SweepState>,
    events: EventBus,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SweepCoordinator {
    /// # Errors
    ///
    /// [`SensorError::Range`] when `min >= max`, `max` exceeds the 12-bit
    /// tick range, or the arc is too narrow for a non-zero 5° step.
    pub fn new(pwm: Arc<dyn PwmOutput>, config: SweepConfig) -> Result<Arc<Self>, SensorError> {
        if config.max > 4095 {
            return Err(SensorError::range("sweep.max", config.max, "[1, 4095]"));
        }
        if config.min >= config.max {
            return Err(SensorError::range(
                "sweep.min",
                config.min,
                format!("[0, {})", config.max),
            ));
        }
        let units_per_degree = f64::from(config.max - config.min) / ARC_DEGREES;
        let step = (units_per_degree * STEP_DEGREES).floor() as u16;
        if step == 0 {
            return Err(SensorError::range(
                "sweep.max - sweep.min",
                config.max - config.min,
                "at least 36 ticks",
            ));
        }

        Ok(Arc::new(Self {
            id: format!("sweep@ch{}", config.channel),
            pwm,
            step,
            units_per_degree,
            advancing: AtomicBool::new(false),
            state: Mutex::new(SweepState {
                phase: SweepPhase::Idle,
                position: config.min,
            }),
            events: EventBus::default(),
            listener: Mutex::new(None),
            config,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Outgoing `PositionFound` and `SensorException` events.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Ticks moved per reading.
    pub fn step_size(&self) -> u16 {
        self.step
    }

    /// Angle in degrees of a servo position, 0 at `min` and 180 at `max`.
    pub fn angle_of(&self, position: u16) -> i32 {
        (f64::from(i32::from(position) - i32::from(self.config.min)) / self.units_per_degree)
            .round() as i32
    }

    pub fn phase(&self) -> SweepPhase {
        lock(&self.state).phase
    }

    /// Last committed servo position.
    pub fn position(&self) -> u16 {
        lock(&self.state).position
    }

    /// Reset the controller, program its frequency, park the servo at `min`
    /// and wait for it to settle.  Blocks for `start_settle_ms`.
    ///
    /// Also restarts a stopped sweep.
    ///
    /// # Errors
    ///
    /// Any [`SensorError`] from the PWM output; the sweep stays in its
    /// previous phase.
    pub fn start(&self) -> Result<(), SensorError> {
        self.pwm.reset()?;
        self.pwm.set_frequency(self.config.pwm_frequency_hz)?;
        self.pwm
            .set_channel_pwm(self.config.channel, 0, self.config.min)?;
        std::thread::sleep(Duration::from_millis(self.config.start_settle_ms));

        let mut state = lock(&self.state);
        state.position = self.config.min;
        state.phase = SweepPhase::Sweeping(Direction::Incrementing);
        info!(
            sweep = %self.id,
            min = self.config.min,
            max = self.config.max,
            step = self.step,
            "sweep started"
        );
        Ok(())
    }

    /// Advance the servo in response to a fresh range reading.
    ///
    /// Blocks for `step_settle_ms` after a successful move; readings arriving
    /// meanwhile return [`Step::Busy`].
    pub fn on_reading(&self, sample: RangeSample) -> Step {
        if !matches!(self.phase(), SweepPhase::Sweeping(_)) {
            return Step::Inactive;
        }
        if self
            .advancing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(sweep = %self.id, "advance in flight; reading dropped");
            return Step::Busy;
        }
        let _advancing = Advancing(&self.advancing);

        let step = {
            let mut state = lock(&self.state);
            self.advance(&mut state, sample)
        };

        if matches!(step, Step::Advanced { .. }) {
            std::thread::sleep(Duration::from_millis(self.config.step_settle_ms));
        }
        step
    }

    fn advance(&self, state: &mut SweepState, sample: RangeSample) -> Step {
        let SweepPhase::Sweeping(direction) = state.phase else {
            return Step::Inactive;
        };
        if !sample.is_ready() {
            return Step::NotReady;
        }
        let captured_at = state.position;
        let (next, next_direction) = next_position(
            captured_at,
            direction,
            self.step,
            self.config.min,
            self.config.max,
        );

        if let Err(cause) = self.pwm.set_channel_pwm(self.config.channel, 0, next) {
            warn!(sweep = %self.id, position = next, error = %cause, "servo step failed");
            self.events.publish(Event::new(
                self.id.as_str(),
                EventPayload::SensorException {
                    message: format!("moving servo to {next} failed"),
                    cause,
                },
            ));
            return Step::Failed;
        }

        state.position = next;
        state.phase = SweepPhase::Sweeping(next_direction);
        if next_direction != direction {
            debug!(sweep = %self.id, ?next_direction, "sweep reversed");
        }

        let angle = self.angle_of(captured_at);
        self.events.publish(Event::new(
            self.id.as_str(),
            EventPayload::PositionFound {
                angle,
                distance: sample.distance,
                raw_value: sample.raw_value,
            },
        ));
        Step::Advanced {
            position: next,
            angle,
        }
    }

    /// Feed the sweep from `source`'s readings on `readings`.
    ///
    /// Each reading is handled on the blocking pool without waiting for the
    /// previous one, so readings that land during an advance are dropped
    /// rather than queued.  Must be called from within a Tokio runtime.
    /// Replaces any previous listener.
    pub fn follow(self: &Arc<Self>, readings: &EventBus, source: &str) {
        let mut rx = readings.subscribe_to(Topic::Readings);
        let source = source.to_string();
        let coordinator = Arc::clone(self);

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.next_event().await {
                if event.source != source {
                    continue;
                }
                let Some(sample) = RangeSample::from_payload(&event.payload) else {
                    continue;
                };
                let coordinator = Arc::clone(&coordinator);
                tokio::task::spawn_blocking(move || coordinator.on_reading(sample));
            }
            debug!(source = %source, "range source detached");
        });

        if let Some(previous) = lock(&self.listener).replace(handle) {
            previous.abort();
        }
    }

    /// Stop sweeping and detach every subscriber of [`Self::events`].
    ///
    /// Readings arriving afterwards never move the servo.  An advance already
    /// past its phase check completes.
    pub fn stop(&self) {
        lock(&self.state).phase = SweepPhase::Stopped;
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        let detached = self.events.unsubscribe_all();
        info!(sweep = %self.id, detached, "sweep stopped");
    }
}

impl Drop for SweepCoordinator {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangebot_hal::drivers::pca9685::Pca9685;
    use rangebot_hal::sim::{SimBus, SimRegisterDevice};
    use rangebot_hal::{BusProvider, SharedBus};
    use rangebot_types::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    /// Records every servo command; fails the writes listed in `fail_on`
    /// (counted over `set_channel_pwm` calls).
    #[derive(Default)]
    struct RecordingServo {
        commands: Mutex<Vec<(u8, u16, u16)>>,
        calls: AtomicUsize,
        fail_on: Vec<usize>,
        frequency: Mutex<Option<u32>>,
        resets: AtomicUsize,
    }

    impl RecordingServo {
        fn failing_on(fail_on: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                fail_on,
                ..Self::default()
            })
        }

        fn positions(&self) -> Vec<u16> {
            lock(&self.commands).iter().map(|(_, _, off)| *off).collect()
        }
    }

    impl PwmOutput for RecordingServo {
        fn reset(&self) -> Result<(), SensorError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn set_frequency(&self, hz: u32) -> Result<(), SensorError> {
            *lock(&self.frequency) = Some(hz);
            Ok(())
        }

        fn set_channel_pwm(&self, channel: u8, on: u16, off: u16) -> Result<(), SensorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.contains(&call) {
                return Err(SensorError::bus("pca9685@0x40", "nack at 0x40"));
            }
            lock(&self.commands).push((channel, on, off));
            Ok(())
        }
    }

    fn quick_config() -> SweepConfig {
        SweepConfig {
            start_settle_ms: 0,
            step_settle_ms: 0,
            ..SweepConfig::default()
        }
    }

    fn sample(raw_value: i32) -> RangeSample {
        RangeSample {
            raw_value,
            distance: Some(f64::from(raw_value) / 10.0),
        }
    }

    #[test]
    fn step_size_and_angles_for_default_arc() {
        let sweep = SweepCoordinator::new(RecordingServo::failing_on(vec![]), quick_config()).unwrap();
        assert_eq!(sweep.step_size(), 15);
        assert_eq!(sweep.angle_of(250), 0);
        assert_eq!(sweep.angle_of(265), 5);
        assert_eq!(sweep.angle_of(525), 90);
        assert_eq!(sweep.angle_of(800), 180);
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        let servo = RecordingServo::failing_on(vec![]);
        for (min, max) in [(800, 250), (400, 400), (250, 270), (0, 5000)] {
            let config = SweepConfig {
                min,
                max,
                ..quick_config()
            };
            let err = SweepCoordinator::new(servo.clone(), config).err().unwrap();
            assert_eq!(err.kind(), ErrorKind::Range, "min={min} max={max}");
        }
    }

    #[test]
    fn next_position_clamps_and_flips_at_bounds() {
        use Direction::*;
        assert_eq!(next_position(250, Incrementing, 15, 250, 800), (265, Incrementing));
        assert_eq!(next_position(790, Incrementing, 15, 250, 800), (800, Decrementing));
        assert_eq!(next_position(785, Incrementing, 15, 250, 800), (800, Decrementing));
        assert_eq!(next_position(800, Decrementing, 15, 250, 800), (785, Decrementing));
        assert_eq!(next_position(260, Decrementing, 15, 250, 800), (250, Incrementing));
    }

    #[test]
    fn start_programs_controller_and_parks_at_min() {
        let servo = RecordingServo::failing_on(vec![]);
        let sweep = SweepCoordinator::new(servo.clone(), quick_config()).unwrap();
        assert_eq!(sweep.phase(), SweepPhase::Idle);
        assert_eq!(sweep.on_reading(sample(100)), Step::Inactive);

        sweep.start().unwrap();
        assert_eq!(servo.resets.load(Ordering::SeqCst), 1);
        assert_eq!(*lock(&servo.frequency), Some(60));
        assert_eq!(lock(&servo.commands).as_slice(), &[(0, 0, 250)]);
        assert_eq!(sweep.phase(), SweepPhase::Sweeping(Direction::Incrementing));
        assert_eq!(sweep.position(), 250);
    }

    #[test]
    fn full_sweep_stays_in_bounds_and_reverses() {
        let servo = RecordingServo::failing_on(vec![]);
        let sweep = SweepCoordinator::new(servo.clone(), quick_config()).unwrap();
        sweep.start().unwrap();

        for i in 0..80 {
            assert!(matches!(sweep.on_reading(sample(i)), Step::Advanced { .. }));
        }

        let positions = servo.positions();
        assert!(positions.iter().all(|p| (250..=800).contains(p)));
        assert_eq!(&positions[..4], &[250, 265, 280, 295]);
        // 250 + 36 steps = 790, then clamped to 800.
        assert_eq!(positions[36], 790);
        assert_eq!(positions[37], 800);
        assert_eq!(positions[38], 785);
        // 800 - 36 steps = 260, then clamped to 250.
        assert_eq!(positions[73], 260);
        assert_eq!(positions[74], 250);
        assert_eq!(positions[75], 265);
        assert_eq!(sweep.phase(), SweepPhase::Sweeping(Direction::Incrementing));
    }

    #[tokio::test]
    async fn reading_is_published_with_angle_where_it_was_captured() {
        let servo = RecordingServo::failing_on(vec![]);
        let sweep = SweepCoordinator::new(servo, quick_config()).unwrap();
        let mut found = sweep.events().subscribe_to(Topic::Sweep);
        sweep.start().unwrap();

        assert_eq!(
            sweep.on_reading(sample(420)),
            Step::Advanced {
                position: 265,
                angle: 0
            }
        );
        assert_eq!(
            sweep.on_reading(sample(430)),
            Step::Advanced {
                position: 280,
                angle: 5
            }
        );

        let first = found.try_recv().unwrap();
        assert_eq!(first.source, "sweep@ch0");
        match first.payload {
            EventPayload::PositionFound {
                angle,
                distance,
                raw_value,
            } => {
                assert_eq!(angle, 0);
                assert_eq!(raw_value, 420);
                assert_eq!(distance, Some(42.0));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(found.try_recv().is_ok());
        assert!(found.try_recv().is_err());
    }

    #[test]
    fn not_ready_reading_does_not_move_servo() {
        let servo = RecordingServo::failing_on(vec![]);
        let sweep = SweepCoordinator::new(servo.clone(), quick_config()).unwrap();
        sweep.start().unwrap();
        assert_eq!(sweep.on_reading(sample(NOT_READY)), Step::NotReady);
        assert_eq!(servo.positions(), vec![250]);
        assert_eq!(sweep.position(), 250);

        // The next ready reading is paired on its own; nothing is carried over.
        let mut found = sweep.events().subscribe_to(Topic::Sweep);
        assert!(matches!(sweep.on_reading(sample(310)), Step::Advanced { .. }));
        match found.try_recv().unwrap().payload {
            EventPayload::PositionFound { raw_value, .. } => assert_eq!(raw_value, 310),
            other => panic!("unexpected {other:?}"),
        }
        assert!(found.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_step_publishes_fault_and_sweep_continues() {
        // Call 0 is the park at min; call 1 is the first step.
        let servo = RecordingServo::failing_on(vec![1]);
        let sweep = SweepCoordinator::new(servo.clone(), quick_config()).unwrap();
        let mut faults = sweep.events().subscribe_to(Topic::Faults);
        let mut found = sweep.events().subscribe_to(Topic::Sweep);
        sweep.start().unwrap();

        assert_eq!(sweep.on_reading(sample(1)), Step::Failed);
        assert_eq!(sweep.position(), 250);
        let fault = faults.try_recv().unwrap();
        assert!(matches!(
            fault.payload,
            EventPayload::SensorException { ref cause, .. } if cause.kind() == ErrorKind::Bus
        ));
        assert!(found.try_recv().is_err(), "no position published for a failed step");

        assert_eq!(
            sweep.on_reading(sample(2)),
            Step::Advanced {
                position: 265,
                angle: 0
            }
        );
    }

    #[test]
    fn stop_is_terminal_and_detaches_subscribers() {
        let servo = RecordingServo::failing_on(vec![]);
        let sweep = SweepCoordinator::new(servo.clone(), quick_config()).unwrap();
        let _sub = sweep.events().subscribe_to(Topic::Sweep);
        sweep.start().unwrap();
        sweep.on_reading(sample(1));

        sweep.stop();
        assert_eq!(sweep.phase(), SweepPhase::Stopped);
        assert_eq!(sweep.events().subscriber_count(Topic::Sweep), 0);
        assert_eq!(sweep.on_reading(sample(2)), Step::Inactive);
        assert_eq!(servo.positions(), vec![250, 265]);
    }

    #[test]
    fn concurrent_reading_during_advance_is_dropped() {
        let servo = RecordingServo::failing_on(vec![]);
        let sweep = SweepCoordinator::new(
            servo.clone(),
            SweepConfig {
                step_settle_ms: 100,
                ..quick_config()
            },
        )
        .unwrap();
        sweep.start().unwrap();

        let first = {
            let sweep = Arc::clone(&sweep);
            std::thread::spawn(move || sweep.on_reading(sample(1)))
        };
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(sweep.on_reading(sample(2)), Step::Busy);

        assert!(matches!(first.join().unwrap(), Step::Advanced { .. }));
        assert_eq!(servo.positions(), vec![250, 265]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn follow_drives_pca9685_from_matching_source() -> Result<(), Box<dyn std::error::Error>> {
        let mut sim = SimBus::new();
        let controller = SimRegisterDevice::pca9685();
        let registers = controller.registers();
        sim.attach(0x40, controller);
        let mut provider = BusProvider::new();
        provider.register(SharedBus::new("I2C1", sim));
        let pca = Pca9685::new(provider.open("I2C1", 0x40)?, Default::default());

        let sweep = SweepCoordinator::new(Arc::new(pca), quick_config())?;
        let mut found = sweep.events().subscribe_to(Topic::Sweep);
        let readings = EventBus::default();
        tokio::task::spawn_blocking({
            let sweep = Arc::clone(&sweep);
            move || sweep.start()
        })
        .await??;
        sweep.follow(&readings, "srf08@0x70");
        tokio::task::yield_now().await;

        readings.publish(Event::new(
            "vcnl4000@0x13",
            EventPayload::ProximityReceived {
                raw_value: 7,
                distance: None,
            },
        ));
        readings.publish(Event::new(
            "srf08@0x70",
            EventPayload::ProximityReceived {
                raw_value: 123,
                distance: Some(123.0),
            },
        ));

        let event = tokio::time::timeout(Duration::from_secs(1), found.recv()).await??;
        assert!(matches!(
            event.payload,
            EventPayload::PositionFound { angle: 0, raw_value: 123, .. }
        ));
        // Channel 0 off-tick registers hold the new position.
        let off = u16::from(registers.get(0x08)) | (u16::from(registers.get(0x09)) << 8);
        assert_eq!(off, 265);

        sweep.stop();
        Ok(())
    }

    #[test]
    fn config_deserializes_with_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let config: SweepConfig = toml::from_str("channel = 3\nmin = 300\n")?;
        assert_eq!(config.channel, 3);
        assert_eq!(config.min, 300);
        assert_eq!(config.max, 800);
        assert_eq!(config.pwm_frequency_hz, 60);
        Ok(())
    }
}
