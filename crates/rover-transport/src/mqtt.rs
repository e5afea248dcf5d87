//! MQTT adapter over `rumqttc`.
//!
//! [`MqttTransport`] owns one broker session at a time:
//!
//! * **Connect** – builds the client options (credentials, keep-alive,
//!   optional TLS), waits for the CONNACK within the configured timeout and
//!   resubscribes every retained topic pattern.
//!
//! * **Receive** – a pump task polls the `rumqttc` event loop and forwards
//!   each PUBLISH into the connection's [`InboundStream`].  The pump stops on
//!   the first connection error instead of letting `rumqttc` reconnect on its
//!   own; reconnect policy belongs to the session supervisor.
//!
//! * **Publish** – hands the message to the client with a timeout.  Never
//!   retried here.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use rover_types::{ConnectError, PublishError, QoS, SubscribeError};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event as MqttEvent, EventLoop, MqttOptions,
    Outgoing, Packet,
};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{BrokerConfig, InboundMessage, InboundStream, Transport};

/// Capacity of the client → event loop request queue.
const REQUEST_CAPACITY: usize = 64;

/// Inbound messages buffered between the pump and the consumer.
const INBOUND_CAPACITY: usize = 256;

/// How long `disconnect` lets the pump flush the DISCONNECT packet.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

struct LiveSession {
    client: AsyncClient,
    pump: JoinHandle<()>,
    online: Arc<AtomicBool>,
    publish_timeout: Duration,
    subscribe_qos: QoS,
}

/// Live MQTT broker adapter.
#[derive(Default)]
pub struct MqttTransport {
    subscriptions: Mutex<BTreeSet<String>>,
    live: Mutex<Option<LiveSession>>,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn options(config: &BrokerConfig) -> MqttOptions {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            let password = config
                .password
                .as_ref()
                .map(|p| p.as_str())
                .unwrap_or_default();
            options.set_credentials(username, password);
        }
        if config.use_tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        options
    }
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn refusal(code: ConnectReturnCode) -> ConnectError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            ConnectError::AuthRejected(format!("{code:?}"))
        }
        other => ConnectError::TransportUnavailable(format!("connection refused: {other:?}")),
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(refusal(code)),
                };
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => return Err(refusal(code)),
            Err(e) => return Err(ConnectError::TransportUnavailable(e.to_string())),
        }
    }
}

/// Poll `eventloop` until the connection ends, forwarding PUBLISH packets.
async fn pump(mut eventloop: EventLoop, tx: mpsc::Sender<InboundMessage>, online: Arc<AtomicBool>) {
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                    arrival_time: Utc::now(),
                };
                debug!(topic = %message.topic, bytes = message.payload.len(), "mqtt inbound");
                if tx.send(message).await.is_err() {
                    debug!("inbound consumer gone; stopping mqtt pump");
                    break;
                }
            }
            Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                warn!("broker sent DISCONNECT");
                break;
            }
            Ok(MqttEvent::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt connection lost");
                break;
            }
        }
    }
    online.store(false, Ordering::SeqCst);
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, config: &BrokerConfig) -> Result<InboundStream, ConnectError> {
        self.disconnect().await;

        info!(
            host = %config.host,
            port = config.port,
            tls = config.use_tls,
            client_id = %config.client_id,
            "connecting to mqtt broker"
        );
        let (client, mut eventloop) = AsyncClient::new(Self::options(config), REQUEST_CAPACITY);
        match tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut eventloop)).await {
            Err(_) => return Err(ConnectError::Timeout),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }

        let patterns: Vec<String> = self.subscriptions.lock().await.iter().cloned().collect();
        for pattern in &patterns {
            client
                .subscribe(pattern.as_str(), to_mqtt_qos(config.subscribe_qos))
                .await
                .map_err(|e| {
                    ConnectError::TransportUnavailable(format!("resubscribe {pattern}: {e}"))
                })?;
        }
        debug!(count = patterns.len(), "resubscribed retained patterns");

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let online = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(pump(eventloop, tx, Arc::clone(&online)));

        *self.live.lock().await = Some(LiveSession {
            client,
            pump,
            online,
            publish_timeout: config.publish_timeout,
            subscribe_qos: config.subscribe_qos,
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        let (client, publish_timeout) = {
            let live = self.live.lock().await;
            match live.as_ref() {
                Some(session) if session.online.load(Ordering::SeqCst) => {
                    (session.client.clone(), session.publish_timeout)
                }
                _ => return Err(PublishError::NotConnected),
            }
        };
        match tokio::time::timeout(
            publish_timeout,
            client.publish(topic, to_mqtt_qos(qos), false, payload),
        )
        .await
        {
            Err(_) => Err(PublishError::Timeout),
            Ok(Err(e)) => Err(PublishError::BrokerRejected(e.to_string())),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), SubscribeError> {
        let newly_added = self.subscriptions.lock().await.insert(pattern.to_string());
        let live = self.live.lock().await;
        let Some(session) = live.as_ref() else {
            return Ok(());
        };
        if !newly_added || !session.online.load(Ordering::SeqCst) {
            return Ok(());
        }
        session
            .client
            .subscribe(pattern, to_mqtt_qos(session.subscribe_qos))
            .await
            .map_err(|e| SubscribeError::BrokerRejected {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&self) {
        let Some(mut session) = self.live.lock().await.take() else {
            return;
        };
        if session.online.load(Ordering::SeqCst) && session.client.try_disconnect().is_err() {
            debug!("disconnect request could not be queued");
        }
        if tokio::time::timeout(DISCONNECT_GRACE, &mut session.pump).await.is_err() {
            session.pump.abort();
            let _ = session.pump.await;
        }
        info!("mqtt session closed");
    }
}
