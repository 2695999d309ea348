//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the publisher.  Publishing never blocks and never fails: a device poll
//! cycle must not stall because nobody is listening.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Readings`] | ADC channel conversions, proximity, ambient light, climate |
//! | [`Topic::Sweep`] | Angle-tagged distances from the sweep |
//! | [`Topic::Faults`] | `SensorException` events from any device or the sweep |
//!
//! # Detaching subscribers
//!
//! [`EventBus::unsubscribe_all`] swaps every topic channel for a fresh one.
//! Existing receivers observe [`broadcast::error::RecvError::Closed`] once
//! they drain what was already queued, and later publishes only reach
//! receivers created afterwards.

use std::sync::{Arc, PoisonError, RwLock};

use rangebot_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes of the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Raw and converted sensor readings.
    Readings,
    /// `PositionFound` events from the sweep.
    Sweep,
    /// `SensorException` events.
    Faults,
}

impl Topic {
    /// The lane a payload is routed to by [`EventBus::publish`].
    pub fn for_payload(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::ChannelReadingDone(_)
            | EventPayload::ProximityReceived { .. }
            | EventPayload::AmbientLightReceived { .. }
            | EventPayload::ClimateReceived { .. } => Topic::Readings,
            EventPayload::PositionFound { .. } => Topic::Sweep,
            EventPayload::SensorException { .. } => Topic::Faults,
        }
    }
}

#[derive(Debug)]
struct Channels {
    readings: broadcast::Sender<Event>,
    sweep: broadcast::Sender<Event>,
    faults: broadcast::Sender<Event>,
}

impl Channels {
    fn new(capacity: usize) -> Self {
        let (readings, _) = broadcast::channel(capacity);
        let (sweep, _) = broadcast::channel(capacity);
        let (faults, _) = broadcast::channel(capacity);
        Self {
            readings,
            sweep,
            faults,
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Readings => &self.readings,
            Topic::Sweep => &self.sweep,
            Topic::Faults => &self.faults,
        }
    }

    fn receiver_count(&self) -> usize {
        self.readings.receiver_count() + self.sweep.receiver_count() + self.faults.receiver_count()
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    channels: Arc<RwLock<Channels>>,
    capacity: usize,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(Channels::new(capacity))),
            capacity,
        }
    }

    /// Publish `event` on the lane matching its payload.
    ///
    /// Returns the number of receivers handed the event; `0` when nobody is
    /// listening, which is a normal condition.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::for_payload(&event.payload);
        self.publish_to(topic, event)
    }

    /// Publish `event` to an explicit [`Topic`] lane.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        match channels.sender(topic).send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                debug!(?topic, source = %event.source, "no subscribers; event dropped");
                0
            }
        }
    }

    /// Subscribe to a specific [`Topic`] lane.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        TopicReceiver {
            topic,
            receiver: channels.sender(topic).subscribe(),
        }
    }

    /// Number of live receivers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.sender(topic).receiver_count()
    }

    /// Detach every current subscriber on every topic.
    ///
    /// Returns the number of receivers that were detached.
    pub fn unsubscribe_all(&self) -> usize {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let detached = channels.receiver_count();
        *channels = Channels::new(self.capacity);
        debug!(detached, "event bus subscribers detached");
        detached
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] lane.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(RecvError::Lagged(n))` – the subscriber fell behind and `n`
    ///   messages were dropped.
    /// * `Err(RecvError::Closed)` – the bus detached this subscriber.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Wait for the next event, skipping over lag gaps.
    ///
    /// Returns `None` once the subscriber has been detached.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "TopicReceiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangebot_types::{ChannelReading, SensorError};
    use std::time::Duration;

    fn reading_event(source: &str) -> Event {
        Event::new(
            source,
            EventPayload::ChannelReadingDone(ChannelReading {
                raw_value: 1234,
                channel: 0,
                device_address: 0x48,
            }),
        )
    }

    fn fault_event(source: &str) -> Event {
        Event::new(
            source,
            EventPayload::SensorException {
                message: "poll failed".to_string(),
                cause: SensorError::bus(source, "nack"),
            },
        )
    }

    #[tokio::test]
    async fn publish_routes_by_payload() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut readings = bus.subscribe_to(Topic::Readings);
        let mut faults = bus.subscribe_to(Topic::Faults);

        let reading = reading_event("ads1115@0x48");
        let fault = fault_event("vcnl4000@0x13");
        assert_eq!(bus.publish(reading.clone()), 1);
        assert_eq!(bus.publish(fault.clone()), 1);

        assert_eq!(readings.recv().await?.id, reading.id);
        assert_eq!(faults.recv().await?.id, fault.id);
        Ok(())
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe_to(Topic::Readings);
        let mut rx2 = bus.subscribe_to(Topic::Readings);

        let event = reading_event("ads1115@0x48");
        assert_eq!(bus.publish(event.clone()), 2);

        assert_eq!(rx1.recv().await?.id, event.id);
        assert_eq!(rx2.recv().await?.id, event.id);
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(reading_event("ads1115@0x48")), 0);
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_other_topic_events() {
        let bus = EventBus::default();
        let mut sweep_sub = bus.subscribe_to(Topic::Sweep);

        bus.publish(reading_event("ads1115@0x48"));

        let result = tokio::time::timeout(Duration::from_millis(50), sweep_sub.recv()).await;
        assert!(result.is_err(), "Sweep subscriber must not receive a reading");
    }

    #[tokio::test]
    async fn unsubscribe_all_closes_existing_receivers() {
        let bus = EventBus::default();
        let mut readings = bus.subscribe_to(Topic::Readings);
        let _faults = bus.subscribe_to(Topic::Faults);
        assert_eq!(bus.subscriber_count(Topic::Readings), 1);

        assert_eq!(bus.unsubscribe_all(), 2);
        assert_eq!(bus.subscriber_count(Topic::Readings), 0);

        // Later publishes reach nobody, and the old receiver sees Closed.
        assert_eq!(bus.publish(reading_event("ads1115@0x48")), 0);
        assert!(readings.next_event().await.is_none());
    }

    #[tokio::test]
    async fn new_subscribers_after_unsubscribe_all_still_work() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let clone = bus.clone();
        bus.unsubscribe_all();

        let mut rx = clone.subscribe_to(Topic::Faults);
        let event = fault_event("srf08@0x70");
        assert_eq!(bus.publish(event.clone()), 1);
        assert_eq!(rx.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::Readings);

        for _ in 0..1_000 {
            bus.publish(reading_event("flood"));
        }

        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
        // next_event skips the gap and keeps delivering.
        assert!(slow.next_event().await.is_some());
    }
}
