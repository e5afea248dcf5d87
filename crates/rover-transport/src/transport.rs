//! The Transport seam.
//!
//! The relay never speaks directly to a broker library.  The session
//! supervisor and the command channel talk to a [`Transport`], and each
//! implementation translates those calls into its own protocol.
//!
//! # Overview
//!
//! - [`Transport`] – the trait every broker adapter must implement.
//! - [`MqttTransport`][crate::mqtt::MqttTransport] – a live MQTT session over
//!   `rumqttc`, optionally TLS.
//! - [`LoopbackTransport`][crate::loopback::LoopbackTransport] – an
//!   in-memory broker for tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use rover_types::{ConnectError, PublishError, QoS, SubscribeError};
use zeroize::Zeroizing;

/// One message delivered by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub arrival_time: DateTime<Utc>,
}

/// Inbound messages of one connection, in arrival order.
///
/// The stream is lazy and ends when the connection is lost or closed.  It is
/// not restartable: a new connection yields a new stream.
pub type InboundStream = BoxStream<'static, InboundMessage>;

/// Everything needed to open a broker session.
#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Upper bound on waiting for the broker's connection acknowledgement.
    pub connect_timeout: Duration,
    /// Upper bound on a single publish before it fails with
    /// [`PublishError::Timeout`].
    pub publish_timeout: Duration,
    /// QoS used for telemetry subscriptions.
    pub subscribe_qos: QoS,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_tls", &self.use_tls)
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("publish_timeout", &self.publish_timeout)
            .field("subscribe_qos", &self.subscribe_qos)
            .finish()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            use_tls: false,
            username: None,
            password: None,
            client_id: "rover-relay".to_string(),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
            subscribe_qos: QoS::AtMostOnce,
        }
    }
}

/// Every broker adapter must implement this trait.
///
/// # Contract
///
/// * `connect` – opens a session and returns its [`InboundStream`].  Every
///   pattern ever passed to `subscribe` is (re)subscribed on success, so the
///   subscription set survives reconnects.
///
/// * `publish` – hands one message to the broker.  Fails fast when not
///   connected and never retries; retry policy belongs to the caller.
///
/// * `subscribe` – records `pattern` in the retained set and subscribes it
///   immediately when a session is live.  While disconnected the
///   subscription is deferred to the next `connect`.
///
/// * `disconnect` – closes the session.  When it returns, no background work
///   of the adapter remains and the inbound stream has ended.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, config: &BrokerConfig) -> Result<InboundStream, ConnectError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError>;

    async fn subscribe(&self, pattern: &str) -> Result<(), SubscribeError>;

    async fn disconnect(&self);
}
