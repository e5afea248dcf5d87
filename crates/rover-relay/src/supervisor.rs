//! [`SessionSupervisor`] – sole owner of the broker connection lifecycle.
//!
//! ```text
//! DISCONNECTED ─start─▶ CONNECTING ─ok─▶ CONNECTED ─drop─▶ RECONNECTING
//!       ▲                   │  ▲                              │
//!       │           AuthRejected└──────── backoff elapsed ────┘
//!       └───────────────────┘
//! ```
//!
//! One background task runs the state machine.  While connected it spawns a
//! delivery task that drains the transport's inbound stream into the
//! [`TelemetryChannel`]; the reconnect timer runs in the supervisor task and
//! never blocks delivery.  Every transition is stored in a `watch` channel
//! (read by the command channel without polling) and published on
//! [`Lane::Connection`].
//!
//! [`SessionSupervisor::stop`] cancels the delivery task and any pending
//! reconnect timer, closes the transport, and only returns once the
//! background task has exited.  Dropping the supervisor drops the stop
//! sender, which the task treats as a stop request.

use std::sync::Arc;

use futures_util::StreamExt;
use rover_transport::{BrokerConfig, EventBus, InboundStream, Lane, Transport};
use rover_types::{ConnectionState, Event, EventPayload, SubscribeError};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::telemetry::TelemetryChannel;

const SOURCE: &str = "rover-relay::supervisor";

struct Core {
    transport: Arc<dyn Transport>,
    broker: BrokerConfig,
    telemetry: Arc<TelemetryChannel>,
    bus: EventBus,
    policy: BackoffPolicy,
    state: watch::Sender<ConnectionState>,
}

impl Core {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        info!(from = %previous, to = %next, "Connection state changed");
        self.bus.publish_to(
            Lane::Connection,
            Event::new(
                SOURCE,
                EventPayload::ConnectionChanged {
                    from: previous,
                    to: next,
                },
            ),
        );
    }

    fn connect_failed(&self, reason: String, fatal: bool) {
        self.bus.publish_to(
            Lane::Connection,
            Event::new(SOURCE, EventPayload::ConnectFailed { reason, fatal }),
        );
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SessionSupervisor {
    core: Arc<Core>,
    running: Mutex<Option<Running>>,
}

impl SessionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        broker: BrokerConfig,
        telemetry: Arc<TelemetryChannel>,
        bus: EventBus,
        policy: BackoffPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            core: Arc::new(Core {
                transport,
                broker,
                telemetry,
                bus,
                policy,
                state,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.core.state.borrow()
    }

    /// A receiver that always holds the current state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    /// Register the telemetry subscriptions and start connecting.
    ///
    /// Returns once the background task is running; observe the state to
    /// learn the outcome.  Calling `start` while a session is already being
    /// supervised does nothing.
    pub async fn start(&self) -> Result<(), SubscribeError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!("Supervisor already running");
            return Ok(());
        }

        for pattern in self.core.telemetry.topics().telemetry_patterns() {
            self.core.transport.subscribe(&pattern).await?;
        }

        self.core.set_state(ConnectionState::Connecting);
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(supervise(Arc::clone(&self.core), stop_rx));
        *running = Some(Running { stop, handle });
        Ok(())
    }

    /// Tear the session down.  No supervisor work remains once this returns.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.stop.send(true);
        if let Err(err) = running.handle.await {
            warn!(error = %err, "Supervisor task ended abnormally");
            self.core.transport.disconnect().await;
            self.core.set_state(ConnectionState::Disconnected);
        }
    }
}

/// Resolves once a stop has been requested or the requester is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|requested| *requested).await;
}

async fn supervise(core: Arc<Core>, mut stop: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(core.policy.clone());

    loop {
        core.set_state(ConnectionState::Connecting);
        let attempt = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break,
            result = core.transport.connect(&core.broker) => result,
        };

        match attempt {
            Ok(inbound) => {
                core.set_state(ConnectionState::Connected);
                let connected_at = Instant::now();
                let mut delivery = tokio::spawn(deliver(inbound, Arc::clone(&core.telemetry)));
                tokio::select! {
                    biased;
                    _ = stop_requested(&mut stop) => {
                        delivery.abort();
                        let _ = delivery.await;
                        break;
                    }
                    _ = &mut delivery => {
                        warn!(host = %core.broker.host, "Broker connection lost");
                    }
                }
                backoff.connection_lost(connected_at.elapsed());
            }
            Err(err) if err.is_fatal() => {
                warn!(host = %core.broker.host, error = %err, "Connect failed; not retrying");
                core.connect_failed(err.to_string(), true);
                break;
            }
            Err(err) => {
                warn!(host = %core.broker.host, error = %err, "Connect failed");
                core.connect_failed(err.to_string(), false);
            }
        }

        core.set_state(ConnectionState::Reconnecting);
        let delay = backoff.next_delay();
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = backoff.attempt(),
            "Reconnect scheduled"
        );
        tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    core.transport.disconnect().await;
    core.set_state(ConnectionState::Disconnected);
}

async fn deliver(mut inbound: InboundStream, telemetry: Arc<TelemetryChannel>) {
    while let Some(message) = inbound.next().await {
        // Malformed payloads are logged by the channel itself.
        let _ = telemetry.ingest(&message.topic, &message.payload, message.arrival_time);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::telemetry::DEFAULT_STALE_THRESHOLD;
    use rover_transport::{LoopbackTransport, TopicScheme};
    use rover_types::{ConnectError, VehicleId};

    struct Fixture {
        broker: LoopbackTransport,
        bus: EventBus,
        telemetry: Arc<TelemetryChannel>,
        supervisor: SessionSupervisor,
    }

    fn fixture() -> Fixture {
        let broker = LoopbackTransport::new();
        let bus = EventBus::default();
        let telemetry = Arc::new(TelemetryChannel::new(
            TopicScheme::default(),
            DEFAULT_STALE_THRESHOLD,
            bus.clone(),
        ));
        let supervisor = SessionSupervisor::new(
            Arc::new(broker.clone()),
            BrokerConfig::default(),
            Arc::clone(&telemetry),
            bus.clone(),
            BackoffPolicy::default(),
        );
        Fixture {
            broker,
            bus,
            telemetry,
            supervisor,
        }
    }

    async fn wait_for(supervisor: &SessionSupervisor, state: ConnectionState) {
        let mut rx = supervisor.watch_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_delivers_telemetry() {
        let f = fixture();
        f.supervisor.start().await.unwrap();
        wait_for(&f.supervisor, ConnectionState::Connected).await;
        assert_eq!(
            f.broker.subscriptions(),
            vec!["esp32car/battery".to_string(), "esp32car/status".to_string()]
        );

        let mut updates = f.bus.subscribe_to(Lane::Telemetry);
        assert!(f.broker.inject(
            "esp32car/status",
            br#"{"vehicle_id":"A","uptime_ms":3661000,"timestamp_ms":1}"#.to_vec()
        ));
        updates.recv().await.unwrap();
        assert_eq!(
            f.telemetry.snapshot(&VehicleId::new("A")).unwrap().uptime_ms,
            Some(3_661_000)
        );
        f.supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_is_fatal() {
        let f = fixture();
        let mut events = f.bus.subscribe_to(Lane::Connection);
        f.broker
            .fail_next_connects([ConnectError::AuthRejected("bad password".into())]);

        f.supervisor.start().await.unwrap();
        wait_for(&f.supervisor, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(f.broker.connect_attempts(), 1);

        let mut saw_fatal = false;
        while let Ok(event) = events.try_recv() {
            if let EventPayload::ConnectFailed { fatal, .. } = event.payload {
                saw_fatal = fatal;
            }
            if let EventPayload::ConnectionChanged { to, .. } = event.payload {
                assert_ne!(to, ConnectionState::Reconnecting);
            }
        }
        assert!(saw_fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_follow_backoff_schedule() {
        let f = fixture();
        f.broker.fail_next_connects(std::iter::repeat_n(ConnectError::Timeout, 7));

        f.supervisor.start().await.unwrap();
        wait_for(&f.supervisor, ConnectionState::Connected).await;

        let times = f.broker.connect_times();
        assert_eq!(times.len(), 8);
        let nominal = [1.0, 2.0, 4.0, 8.0, 16.0, 30.0, 30.0];
        for (pair, nominal) in times.windows(2).zip(nominal) {
            let gap = pair[1].duration_since(pair[0]).as_secs_f64();
            assert!(gap >= nominal * 0.8 - 0.01, "gap {gap} below {nominal}");
            assert!(gap <= (nominal * 1.2_f64).min(30.0) + 0.01, "gap {gap} above {nominal}");
        }
        f.supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_reconnects_with_subscriptions() {
        let f = fixture();
        f.supervisor.start().await.unwrap();
        wait_for(&f.supervisor, ConnectionState::Connected).await;

        let mut states = f.supervisor.watch_state();
        f.broker.drop_connection();
        states
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        states
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(f.broker.connect_attempts(), 2);

        let mut updates = f.bus.subscribe_to(Lane::Telemetry);
        assert!(f.broker.inject(
            "esp32car/battery",
            br#"{"vehicle_id":"A","battery_percentage":50,"battery_voltage":3.7,"charging":true,"timestamp_ms":9}"#.to_vec()
        ));
        updates.recv().await.unwrap();
        assert_eq!(
            f.telemetry.snapshot(&VehicleId::new("A")).unwrap().charging,
            Some(true)
        );
        f.supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_reconnect() {
        let f = fixture();
        f.broker.fail_next_connects(std::iter::repeat_n(ConnectError::Timeout, 100));

        f.supervisor.start().await.unwrap();
        wait_for(&f.supervisor, ConnectionState::Reconnecting).await;
        f.supervisor.stop().await;

        assert_eq!(f.supervisor.state(), ConnectionState::Disconnected);
        let attempts = f.broker.connect_attempts();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(f.broker.connect_attempts(), attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_connected_closes_transport() {
        let f = fixture();
        f.supervisor.start().await.unwrap();
        wait_for(&f.supervisor, ConnectionState::Connected).await;
        assert!(f.broker.is_connected());

        f.supervisor.stop().await;
        assert!(!f.broker.is_connected());
        assert_eq!(f.supervisor.state(), ConnectionState::Disconnected);

        // A stopped supervisor can be started again.
        f.supervisor.start().await.unwrap();
        wait_for(&f.supervisor, ConnectionState::Connected).await;
        f.supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_while_running() {
        let f = fixture();
        f.supervisor.start().await.unwrap();
        f.supervisor.start().await.unwrap();
        wait_for(&f.supervisor, ConnectionState::Connected).await;
        assert_eq!(f.broker.connect_attempts(), 1);
        f.supervisor.stop().await;
    }
}
