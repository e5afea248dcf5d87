//! In-memory loopback broker.
//!
//! [`LoopbackTransport`] behaves like a single-client broker living in the
//! same process:
//!
//! * **Outbound** – every publish is recorded and can be inspected with
//!   [`LoopbackTransport::published`].
//!
//! * **Inbound** – [`LoopbackTransport::inject`] delivers a message on the
//!   live connection's stream when its topic matches a retained
//!   subscription, just as a broker would.
//!
//! Connect outcomes, publish failures and publish latency can be scripted,
//! which makes the adapter the test double for supervisor and channel tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream;
use rover_types::{ConnectError, PublishError, QoS, SubscribeError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::topics::topic_matches;
use crate::transport::{BrokerConfig, InboundMessage, InboundStream, Transport};

/// A message handed to the loopback broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

#[derive(Default)]
struct LoopbackState {
    subscriptions: BTreeSet<String>,
    inbound: Option<mpsc::UnboundedSender<InboundMessage>>,
    connect_script: VecDeque<ConnectError>,
    connect_attempts: Vec<Instant>,
    published: Vec<PublishedMessage>,
    publish_failure: Option<PublishError>,
    publish_delay: Option<Duration>,
    last_client_id: Option<String>,
}

/// In-process broker. Clone it cheaply – clones share the same state, so a
/// test can keep a handle while the relay owns another.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next connect attempts fail, in order, with `errors`.
    /// Attempts beyond the script succeed.
    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = ConnectError>) {
        self.state().connect_script.extend(errors);
    }

    /// Make every publish fail with `failure` until cleared with `None`.
    pub fn set_publish_failure(&self, failure: Option<PublishError>) {
        self.state().publish_failure = failure;
    }

    /// Delay every publish by `delay` before it completes.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.state().publish_delay = delay;
    }

    /// Deliver a message as if a vehicle had published it.
    ///
    /// Returns `false` when there is no live connection or no retained
    /// subscription matches `topic`.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        self.inject_at(topic, payload, Utc::now())
    }

    /// [`inject`][Self::inject] with an explicit arrival time.
    pub fn inject_at(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        arrival_time: DateTime<Utc>,
    ) -> bool {
        let state = self.state();
        let Some(inbound) = state.inbound.as_ref() else {
            return false;
        };
        if !state
            .subscriptions
            .iter()
            .any(|pattern| topic_matches(pattern, topic))
        {
            return false;
        }
        inbound
            .send(InboundMessage {
                topic: topic.to_string(),
                payload: payload.into(),
                arrival_time,
            })
            .is_ok()
    }

    /// Simulate the broker dropping the connection: the inbound stream ends
    /// and publishes fail until the next connect.
    pub fn drop_connection(&self) {
        self.state().inbound = None;
    }

    pub fn is_connected(&self) -> bool {
        self.state().inbound.is_some()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// Payloads published on `topic`, oldest first.
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state().subscriptions.iter().cloned().collect()
    }

    /// Number of connect attempts so far, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts.len()
    }

    /// When each connect attempt happened (Tokio clock).
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state().connect_attempts.clone()
    }

    pub fn last_client_id(&self) -> Option<String> {
        self.state().last_client_id.clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, config: &BrokerConfig) -> Result<InboundStream, ConnectError> {
        let mut state = self.state();
        state.connect_attempts.push(Instant::now());
        state.last_client_id = Some(config.client_id.clone());
        if let Some(error) = state.connect_script.pop_front() {
            debug!(error = %error, "loopback connect scripted to fail");
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.inbound = Some(tx);
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        let delay = {
            let state = self.state();
            if state.inbound.is_none() {
                return Err(PublishError::NotConnected);
            }
            state.publish_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if let Some(failure) = state.publish_failure.clone() {
            return Err(failure);
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), SubscribeError> {
        self.state().subscriptions.insert(pattern.to_string());
        Ok(())
    }

    async fn disconnect(&self) {
        self.state().inbound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inject_reaches_stream_only_for_subscribed_topics() {
        let broker = LoopbackTransport::new();
        broker.subscribe("+/status").await.unwrap();
        let mut inbound = broker.connect(&BrokerConfig::default()).await.unwrap();

        assert!(!broker.inject("A/battery", b"{}".to_vec()));
        assert!(broker.inject("A/status", b"{\"x\":1}".to_vec()));

        let message = inbound.next().await.unwrap();
        assert_eq!(message.topic, "A/status");
        assert_eq!(message.payload, b"{\"x\":1}".to_vec());
    }

    #[tokio::test]
    async fn subscriptions_survive_reconnect() {
        let broker = LoopbackTransport::new();
        broker.subscribe("esp32car/status").await.unwrap();
        let _first = broker.connect(&BrokerConfig::default()).await.unwrap();
        broker.drop_connection();

        let mut second = broker.connect(&BrokerConfig::default()).await.unwrap();
        assert!(broker.inject("esp32car/status", b"{}".to_vec()));
        assert!(second.next().await.is_some());
        assert_eq!(broker.subscriptions(), vec!["esp32car/status".to_string()]);
    }

    #[tokio::test]
    async fn stream_ends_when_connection_drops() {
        let broker = LoopbackTransport::new();
        let mut inbound = broker.connect(&BrokerConfig::default()).await.unwrap();
        broker.drop_connection();
        assert!(inbound.next().await.is_none());
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let broker = LoopbackTransport::new();
        let result = broker.publish("A/command", b"{}".to_vec(), QoS::AtMostOnce).await;
        assert_eq!(result, Err(PublishError::NotConnected));

        let _inbound = broker.connect(&BrokerConfig::default()).await.unwrap();
        broker
            .publish("A/command", b"{}".to_vec(), QoS::AtLeastOnce)
            .await
            .unwrap();
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn scripted_connect_failures_run_in_order() {
        let broker = LoopbackTransport::new();
        broker.fail_next_connects([
            ConnectError::Timeout,
            ConnectError::TransportUnavailable("refused".into()),
        ]);
        let config = BrokerConfig::default();
        assert!(matches!(broker.connect(&config).await, Err(ConnectError::Timeout)));
        assert!(matches!(
            broker.connect(&config).await,
            Err(ConnectError::TransportUnavailable(_))
        ));
        assert!(broker.connect(&config).await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(broker.last_client_id().as_deref(), Some("rover-relay"));
    }

    #[tokio::test]
    async fn scripted_publish_failure() {
        let broker = LoopbackTransport::new();
        let _inbound = broker.connect(&BrokerConfig::default()).await.unwrap();
        broker.set_publish_failure(Some(PublishError::BrokerRejected("quota".into())));
        let result = broker.publish("t", Vec::new(), QoS::AtMostOnce).await;
        assert!(matches!(result, Err(PublishError::BrokerRejected(_))));
        assert!(broker.published().is_empty());
    }
}
