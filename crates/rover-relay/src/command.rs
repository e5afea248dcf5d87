//! [`CommandChannel`] – operator intent to sequenced command messages.
//!
//! A submission passes these gates, in order:
//!
//! 1. the cached connection state must be
//!    [`Connected`][ConnectionState::Connected];
//! 2. the speed must fit `0..=255` (STOP is forced to 0 and never fails);
//! 3. a repeat of the same kind for the same vehicle within the debounce
//!    window is dropped, except STOP;
//! 4. the vehicle's next sequence number is assigned and the message is
//!    published with a timeout.
//!
//! Each vehicle has its own async lock held from step 3 through the publish,
//! so there is at most one command in flight per vehicle and sequence numbers
//! reach the broker in increasing order.  A sequence number is consumed once
//! assigned, even when the publish then fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rover_transport::{EventBus, Lane, TopicScheme, Transport};
use rover_types::{
    Command, CommandKind, ConnectionState, Event, EventPayload, PublishError, QoS, SubmitError,
    VehicleId,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SOURCE: &str = "rover-relay::command";

/// Timing and delivery knobs of a [`CommandChannel`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPolicy {
    /// Repeats of one kind closer together than this are dropped.
    pub debounce: Duration,
    pub publish_timeout: Duration,
    pub qos: QoS,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            publish_timeout: Duration::from_secs(5),
            qos: QoS::AtMostOnce,
        }
    }
}

#[derive(Debug, Default)]
struct VehicleLane {
    last_sequence: u64,
    /// When each kind was last accepted by the broker.
    last_sent: HashMap<CommandKind, Instant>,
}

pub struct CommandChannel {
    transport: Arc<dyn Transport>,
    topics: TopicScheme,
    policy: CommandPolicy,
    state: watch::Receiver<ConnectionState>,
    lanes: Mutex<HashMap<VehicleId, Arc<tokio::sync::Mutex<VehicleLane>>>>,
    bus: EventBus,
}

impl CommandChannel {
    /// `state` is the supervisor's cached connection state.
    pub fn new(
        transport: Arc<dyn Transport>,
        topics: TopicScheme,
        policy: CommandPolicy,
        state: watch::Receiver<ConnectionState>,
        bus: EventBus,
    ) -> Self {
        Self {
            transport,
            topics,
            policy,
            state,
            lanes: Mutex::new(HashMap::new()),
            bus,
        }
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    /// Validate, sequence and publish one command to `vehicle`.
    ///
    /// Returns the command as it was published.  Failures are reported to
    /// the caller and never retried.
    pub async fn submit(
        &self,
        vehicle: &VehicleId,
        kind: CommandKind,
        speed: i32,
    ) -> Result<Command, SubmitError> {
        let state = *self.state.borrow();
        if state != ConnectionState::Connected {
            return Err(SubmitError::NotConnected(state));
        }

        let speed = if kind.is_stop() {
            0
        } else {
            u8::try_from(speed).map_err(|_| SubmitError::InvalidSpeed(speed))?
        };

        let lane = self.lane(vehicle);
        let mut lane = lane.lock().await;
        let now = Instant::now();

        if !kind.is_stop() {
            if let Some(last) = lane.last_sent.get(&kind) {
                if now.duration_since(*last) < self.policy.debounce {
                    debug!(vehicle = %vehicle, command = %kind, "Debounced");
                    return Err(SubmitError::Debounced {
                        vehicle: vehicle.clone(),
                        kind,
                    });
                }
            }
        }

        let sequence = lane
            .last_sequence
            .checked_add(1)
            .ok_or_else(|| SubmitError::SequenceExhausted(vehicle.clone()))?;
        lane.last_sequence = sequence;

        let command = Command {
            vehicle_id: vehicle.clone(),
            kind,
            speed,
            sequence,
            issued_at: Utc::now(),
        };
        let message = command.to_message();
        let payload = serde_json::to_vec(&message).map_err(|e| SubmitError::Encode(e.to_string()))?;
        let topic = self.topics.command_topic(vehicle);

        let published = tokio::time::timeout(
            self.policy.publish_timeout,
            self.transport.publish(&topic, payload, self.policy.qos),
        )
        .await
        .unwrap_or(Err(PublishError::Timeout));

        if let Err(err) = published {
            warn!(vehicle = %vehicle, command = %kind, sequence, error = %err, "Command publish failed");
            return Err(err.into());
        }

        lane.last_sent.insert(kind, now);
        info!(vehicle = %vehicle, command = %kind, speed, sequence, topic = %topic, "Command sent");
        self.bus
            .publish_to(Lane::Commands, Event::new(SOURCE, EventPayload::CommandSent(message)));
        Ok(command)
    }

    /// Highest sequence number assigned to `vehicle` so far.
    pub async fn last_sequence(&self, vehicle: &VehicleId) -> Option<u64> {
        let lane = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vehicle)
            .cloned()?;
        let last = lane.lock().await.last_sequence;
        (last > 0).then_some(last)
    }

    #[cfg(test)]
    async fn seed_sequence(&self, vehicle: &VehicleId, last: u64) {
        self.lane(vehicle).lock().await.last_sequence = last;
    }

    fn lane(&self, vehicle: &VehicleId) -> Arc<tokio::sync::Mutex<VehicleLane>> {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(vehicle.clone())
            .or_default()
            .clone()
    }
}
