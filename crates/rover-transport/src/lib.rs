//! `rover-transport` – broker plumbing for the relay.
//!
//! Moves opaque payloads between the relay and a publish/subscribe broker
//! without caring about their meaning, and fans relay events out to
//! observers.
//!
//! # Modules
//!
//! - [`transport`] – the [`Transport`] trait and connection settings.
//! - [`mqtt`] – live MQTT adapter over `rumqttc`.
//! - [`loopback`] – in-memory broker used as the test double.
//! - [`topics`] – topic naming per vehicle and MQTT wildcard matching.
//! - [`bus`] – lane-based broadcast bus for state and telemetry events.

pub mod bus;
pub mod loopback;
pub mod mqtt;
pub mod topics;
pub mod transport;

pub use bus::{EventBus, Lane, LaneReceiver};
pub use loopback::{LoopbackTransport, PublishedMessage};
pub use mqtt::MqttTransport;
pub use topics::{DEFAULT_NAMESPACE, TelemetryKind, TelemetryRoute, TopicScheme, topic_matches};
pub use transport::{BrokerConfig, InboundMessage, InboundStream, Transport};
