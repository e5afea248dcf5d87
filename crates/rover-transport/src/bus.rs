//! Typed, lane-based publish/subscribe event bus for relay observers.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every event without any single subscriber blocking
//! the others, and the relay never waits on a slow UI.
//!
//! # Lanes
//!
//! | Lane | Typical traffic |
//! |---|---|
//! | [`Lane::Connection`] | Connection-state transitions and connect failures |
//! | [`Lane::Telemetry`] | Every applied telemetry snapshot update |
//! | [`Lane::Commands`] | Commands that reached the broker |

use rover_types::Event;
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Session supervisor state changes.
    Connection,
    /// Per-vehicle telemetry updates.
    Telemetry,
    /// Outbound commands accepted by the broker.
    Commands,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    connection: broadcast::Sender<Event>,
    telemetry: broadcast::Sender<Event>,
    commands: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every lane independently.
    pub fn new(capacity: usize) -> Self {
        let (connection, _) = broadcast::channel(capacity);
        let (telemetry, _) = broadcast::channel(capacity);
        let (commands, _) = broadcast::channel(capacity);
        Self {
            connection,
            telemetry,
            commands,
        }
    }

    /// Publish `event` on `lane`.
    ///
    /// Returns the number of subscribers that were handed the event; `0`
    /// when nobody is listening, which is a normal condition.
    pub fn publish_to(&self, lane: Lane, event: Event) -> usize {
        self.lane_sender(lane).send(event).unwrap_or(0)
    }

    /// Subscribe to a single lane.
    pub fn subscribe_to(&self, lane: Lane) -> LaneReceiver {
        LaneReceiver {
            lane,
            receiver: self.lane_sender(lane).subscribe(),
        }
    }

    /// Number of live subscribers on `lane`.
    pub fn subscriber_count(&self, lane: Lane) -> usize {
        self.lane_sender(lane).receiver_count()
    }

    fn lane_sender(&self, lane: Lane) -> &broadcast::Sender<Event> {
        match lane {
            Lane::Connection => &self.connection,
            Lane::Telemetry => &self.telemetry,
            Lane::Commands => &self.commands,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Lane`].
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct LaneReceiver {
    lane: Lane,
    receiver: broadcast::Receiver<Event>,
}

impl LaneReceiver {
    /// Wait for the next event on this lane.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` events were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Wait for the next event, skipping over lag gaps.
    ///
    /// Returns `None` once the bus is closed.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lane = ?self.lane, lagged_by = n, "LaneReceiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll for an already-buffered event.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// The [`Lane`] this receiver is bound to.
    pub fn lane(&self) -> Lane {
        self.lane
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rover_types::{ConnectionState, EventPayload};

    fn make_event(source: &str) -> Event {
        Event::new(
            source,
            EventPayload::ConnectionChanged {
                from: ConnectionState::Connecting,
                to: ConnectionState::Connected,
            },
        )
    }

    #[tokio::test]
    async fn lane_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut first = bus.subscribe_to(Lane::Connection);
        let mut second = bus.subscribe_to(Lane::Connection);

        let event = make_event("rover-relay::test");
        assert_eq!(bus.publish_to(Lane::Connection, event.clone()), 2);

        assert_eq!(first.recv().await?.id, event.id);
        assert_eq!(second.recv().await?.id, event.id);
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish_to(Lane::Telemetry, make_event("test")), 0);
    }

    /// A subscriber on `Commands` must not see events published to
    /// `Connection`.
    #[tokio::test]
    async fn lanes_are_isolated() {
        let bus = EventBus::default();
        let mut commands = bus.subscribe_to(Lane::Commands);
        let _connection = bus.subscribe_to(Lane::Connection);

        bus.publish_to(Lane::Connection, make_event("supervisor"));

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), commands.recv()).await;
        assert!(result.is_err(), "Commands lane must not receive a Connection event");
    }

    #[tokio::test]
    async fn next_skips_lag_and_keeps_delivering() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe_to(Lane::Telemetry);

        for _ in 0..32 {
            bus.publish_to(Lane::Telemetry, make_event("flood"));
        }
        let last = make_event("last");
        bus.publish_to(Lane::Telemetry, last.clone());

        let mut seen_last = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), slow.next()).await
        {
            if event.id == last.id {
                seen_last = true;
                break;
            }
        }
        assert!(seen_last, "lagged subscriber must still reach the newest event");
    }

    #[test]
    fn subscriber_count_tracks_receivers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(Lane::Connection), 0);
        let rx = bus.subscribe_to(Lane::Connection);
        assert_eq!(bus.subscriber_count(Lane::Connection), 1);
        assert_eq!(rx.lane(), Lane::Connection);
        drop(rx);
        assert_eq!(bus.subscriber_count(Lane::Connection), 0);
    }
}
