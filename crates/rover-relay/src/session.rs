//! [`Session`] – the relay as seen by a UI collaborator.
//!
//! A `Session` is an explicitly owned object: build it once, call
//! [`connect`][Session::connect], and hold it for as long as the operator
//! surface lives.  It wires one [`SessionSupervisor`], one
//! [`CommandChannel`] and one [`TelemetryChannel`] to a shared transport and
//! event bus.
//!
//! Dropping a `Session` inside a running Tokio runtime stops supervision the
//! same way [`disconnect`][Session::disconnect] does, except that the
//! teardown finishes in the background instead of being awaited.
//!
//! # Example
//!
//! ```rust,no_run
//! use rover_relay::{RelayConfig, Session};
//! use rover_types::{CommandKind, VehicleId};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::with_mqtt(RelayConfig::default());
//! let mut changes = session.subscribe_to_state_changes();
//! session.connect().await?;
//! while let Some(event) = changes.next().await {
//!     println!("{:?}", event.payload);
//!     if session.connection_state() == rover_types::ConnectionState::Connected {
//!         break;
//!     }
//! }
//! session
//!     .submit_command(&VehicleId::new("A"), CommandKind::Forward, 150)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rover_transport::{EventBus, Lane, LaneReceiver, MqttTransport, Transport};
use rover_types::{
    Command, CommandKind, ConnectionState, SubmitError, SubscribeError, TelemetrySnapshot,
    VehicleId,
};
use tokio::sync::watch;
use tracing::info;

use crate::backoff::BackoffPolicy;
use crate::command::CommandChannel;
use crate::config::RelayConfig;
use crate::supervisor::SessionSupervisor;
use crate::telemetry::{IngestStats, TelemetryChannel};

pub struct Session {
    config: RelayConfig,
    bus: EventBus,
    supervisor: SessionSupervisor,
    commands: CommandChannel,
    telemetry: Arc<TelemetryChannel>,
}

impl Session {
    /// Build a session over `transport`.  Nothing connects until
    /// [`connect`][Self::connect].
    pub fn new(config: RelayConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_backoff(config, transport, BackoffPolicy::default())
    }

    pub fn with_backoff(
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        backoff: BackoffPolicy,
    ) -> Self {
        let bus = EventBus::default();
        let topics = config.topic_scheme();
        let telemetry = Arc::new(TelemetryChannel::new(
            topics.clone(),
            config.stale_threshold(),
            bus.clone(),
        ));
        let supervisor = SessionSupervisor::new(
            Arc::clone(&transport),
            config.broker(),
            Arc::clone(&telemetry),
            bus.clone(),
            backoff,
        );
        let commands = CommandChannel::new(
            transport,
            topics,
            config.command_policy(),
            supervisor.watch_state(),
            bus.clone(),
        );
        Self {
            config,
            bus,
            supervisor,
            commands,
            telemetry,
        }
    }

    /// A session over a live MQTT broker.
    pub fn with_mqtt(config: RelayConfig) -> Self {
        Self::new(config, Arc::new(MqttTransport::new()))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Start supervising the broker connection.  Returns as soon as the
    /// supervisor is running; progress is reported through
    /// [`subscribe_to_state_changes`][Self::subscribe_to_state_changes].
    pub async fn connect(&self) -> Result<(), SubscribeError> {
        info!(
            host = %self.config.broker_host,
            port = self.config.broker_port,
            tls = self.config.use_tls,
            "Connecting session"
        );
        self.supervisor.start().await
    }

    /// Disconnect and stop reconnecting.  No background work remains once
    /// this returns.
    pub async fn disconnect(&self) {
        self.supervisor.stop().await;
    }

    pub async fn submit_command(
        &self,
        vehicle: &VehicleId,
        kind: CommandKind,
        speed: i32,
    ) -> Result<Command, SubmitError> {
        self.commands.submit(vehicle, kind, speed).await
    }

    pub fn current_snapshot(&self, vehicle: &VehicleId) -> Option<TelemetrySnapshot> {
        self.telemetry.snapshot(vehicle)
    }

    pub fn snapshots(&self) -> Vec<TelemetrySnapshot> {
        self.telemetry.snapshots()
    }

    /// Staleness of `vehicle` against the configured threshold.
    pub fn is_stale(&self, vehicle: &VehicleId, now: DateTime<Utc>) -> bool {
        self.telemetry
            .is_stale(vehicle, now, self.telemetry.stale_threshold())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.watch_state()
    }

    /// Connection transitions and connect failures.
    pub fn subscribe_to_state_changes(&self) -> LaneReceiver {
        self.bus.subscribe_to(Lane::Connection)
    }

    /// Every applied telemetry update.
    pub fn subscribe_to_telemetry(&self) -> LaneReceiver {
        self.bus.subscribe_to(Lane::Telemetry)
    }

    /// Every command accepted by the broker.
    pub fn subscribe_to_commands(&self) -> LaneReceiver {
        self.bus.subscribe_to(Lane::Commands)
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.telemetry.stats()
    }

    pub async fn last_sequence(&self, vehicle: &VehicleId) -> Option<u64> {
        self.commands.last_sequence(vehicle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rover_transport::LoopbackTransport;
    use rover_types::{CommandMessage, ConnectError, EventPayload};

    fn session(config: RelayConfig) -> (Session, LoopbackTransport) {
        let broker = LoopbackTransport::new();
        let session = Session::new(config, Arc::new(broker.clone()));
        (session, broker)
    }

    async fn connected(session: &Session) {
        session.connect().await.unwrap();
        let mut state = session.watch_connection_state();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn forward_reaches_vehicle_topic() {
        let config = RelayConfig {
            per_vehicle_topics: true,
            ..RelayConfig::default()
        };
        let (session, broker) = session(config);
        connected(&session).await;

        session
            .submit_command(&VehicleId::new("A"), CommandKind::Forward, 150)
            .await
            .unwrap();

        let published = broker.published_on("A/command");
        assert_eq!(published.len(), 1);
        let message: CommandMessage = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(message.command, CommandKind::Forward);
        assert_eq!(message.speed, 150);
        assert_eq!(message.sequence, 1);
        session.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn commands_rejected_before_connect_and_after_disconnect() {
        let (session, broker) = session(RelayConfig::default());
        let a = VehicleId::new("A");
        assert_eq!(
            session.submit_command(&a, CommandKind::Stop, 0).await,
            Err(SubmitError::NotConnected(ConnectionState::Disconnected))
        );

        connected(&session).await;
        session.disconnect().await;
        assert_eq!(
            session.submit_command(&a, CommandKind::Stop, 0).await,
            Err(SubmitError::NotConnected(ConnectionState::Disconnected))
        );
        assert!(broker.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_flows_to_snapshot_and_observers() {
        let (session, broker) = session(RelayConfig::default());
        connected(&session).await;
        let mut updates = session.subscribe_to_telemetry();

        let arrival = Utc::now();
        assert!(broker.inject_at(
            "esp32car/status",
            br#"{"vehicle_id":"A","wifi_rssi":-62,"uptime_ms":3661000,"timestamp_ms":5}"#.to_vec(),
            arrival,
        ));
        updates.recv().await.unwrap();

        let a = VehicleId::new("A");
        let snap = session.current_snapshot(&a).unwrap();
        assert_eq!(snap.uptime_ms, Some(3_661_000));
        assert_eq!(snap.wifi_rssi, Some(-62));
        assert!(!session.is_stale(&a, arrival + chrono::Duration::seconds(30)));
        assert!(session.is_stale(&a, arrival + chrono::Duration::seconds(31)));
        assert!(session.is_stale(&VehicleId::new("B"), arrival));
        assert_eq!(session.ingest_stats().applied, 1);
        session.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_session_closes_the_broker_connection() {
        let (session, broker) = session(RelayConfig::default());
        connected(&session).await;
        let mut state = session.watch_connection_state();
        assert!(broker.is_connected());

        drop(session);
        let _ = state.wait_for(|s| *s == ConnectionState::Disconnected).await;
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
        assert!(!broker.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn state_changes_are_observable() {
        let (session, broker) = session(RelayConfig::default());
        broker.fail_next_connects([ConnectError::AuthRejected("denied".into())]);
        let mut changes = session.subscribe_to_state_changes();

        session.connect().await.unwrap();
        let mut seen = Vec::new();
        while let Some(event) = changes.next().await {
            match event.payload {
                EventPayload::ConnectionChanged { to, .. } => {
                    seen.push(to);
                    if to == ConnectionState::Disconnected {
                        break;
                    }
                }
                EventPayload::ConnectFailed { fatal, .. } => assert!(fatal),
                _ => {}
            }
        }
        assert_eq!(
            seen,
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn sent_commands_are_published_to_observers() {
        let (session, _broker) = session(RelayConfig::default());
        connected(&session).await;
        let mut sent = session.subscribe_to_commands();

        session
            .submit_command(&VehicleId::broadcast(), CommandKind::Left, 90)
            .await
            .unwrap();
        match sent.recv().await.unwrap().payload {
            EventPayload::CommandSent(message) => assert_eq!(message.speed, 90),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(session.last_sequence(&VehicleId::broadcast()).await, Some(1));
        session.disconnect().await;
    }
}
