//! `rover-types` – shared vocabulary of the command/telemetry relay.
//!
//! Every other crate in the workspace speaks in these types: vehicle
//! addressing, movement commands and their JSON wire form, the merged
//! per-vehicle telemetry snapshot, the broker connection state machine, and
//! the error taxonomy surfaced to callers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Vehicle id that addresses every vehicle listening on a namespace.
pub const BROADCAST_VEHICLE: &str = "ALL";

/// Highest speed a movement command may carry.
pub const MAX_SPEED: u8 = u8::MAX;

/// Milliseconds since the Unix epoch, clamped to zero for pre-epoch times.
pub fn unix_millis(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp_millis()).unwrap_or(0)
}

// ────────────────────────────────────────────────────────────────────────────
// Addressing
// ────────────────────────────────────────────────────────────────────────────

/// Opaque identifier of a target vehicle, or the [`BROADCAST_VEHICLE`]
/// wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(String);

impl VehicleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The wildcard id that every vehicle on the namespace obeys.
    pub fn broadcast() -> Self {
        Self(BROADCAST_VEHICLE.to_string())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST_VEHICLE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VehicleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for VehicleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

/// The movement vocabulary understood by the vehicle firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandKind {
    Forward,
    Backward,
    Left,
    Right,
    /// Emergency stop. Always carries speed 0 and is never debounced.
    Stop,
}

impl CommandKind {
    pub const ALL: [CommandKind; 5] = [
        CommandKind::Forward,
        CommandKind::Backward,
        CommandKind::Left,
        CommandKind::Right,
        CommandKind::Stop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Forward => "FORWARD",
            CommandKind::Backward => "BACKWARD",
            CommandKind::Left => "LEFT",
            CommandKind::Right => "RIGHT",
            CommandKind::Stop => "STOP",
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, CommandKind::Stop)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown command kind '{0}'")]
pub struct ParseCommandKindError(pub String);

impl FromStr for CommandKind {
    type Err = ParseCommandKindError;

    /// Case-insensitive parse of the wire names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseCommandKindError(s.to_string()))
    }
}

/// A sequenced movement command addressed to one vehicle.
///
/// `sequence` strictly increases per vehicle for the lifetime of a session;
/// receivers discard anything at or below the last applied value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub vehicle_id: VehicleId,
    pub kind: CommandKind,
    pub speed: u8,
    pub sequence: u64,
    pub issued_at: DateTime<Utc>,
}

impl Command {
    /// The JSON object published on the command topic.
    pub fn to_message(&self) -> CommandMessage {
        CommandMessage {
            command: self.kind,
            speed: self.speed,
            sequence: self.sequence,
            vehicle_id: self.vehicle_id.clone(),
            timestamp_ms: unix_millis(self.issued_at),
        }
    }
}

/// Wire form of a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: CommandKind,
    pub speed: u8,
    pub sequence: u64,
    pub vehicle_id: VehicleId,
    pub timestamp_ms: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry wire payloads
// ────────────────────────────────────────────────────────────────────────────

/// Payload published by a vehicle on its status topic.
///
/// Older firmware used `car_id`, `command`, `uptime` and `timestamp`; those
/// names are accepted as aliases. A missing timestamp reads as 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default, alias = "car_id")]
    pub vehicle_id: Option<VehicleId>,
    /// Free-form firmware state, e.g. `"online"`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "command")]
    pub last_command: Option<String>,
    #[serde(default)]
    pub speed: Option<i32>,
    #[serde(default)]
    pub wifi_rssi: Option<i32>,
    #[serde(default, alias = "uptime")]
    pub uptime_ms: Option<u64>,
    #[serde(default)]
    pub free_heap: Option<u64>,
    #[serde(default, alias = "timestamp")]
    pub timestamp_ms: u64,
}

/// Payload published by a vehicle on its battery topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryReport {
    #[serde(default, alias = "car_id")]
    pub vehicle_id: Option<VehicleId>,
    pub battery_percentage: u8,
    pub battery_voltage: f32,
    pub charging: bool,
    #[serde(default, alias = "timestamp")]
    pub timestamp_ms: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry snapshot
// ────────────────────────────────────────────────────────────────────────────

/// Latest known state of one vehicle, merged from its status and battery
/// streams. Fields a vehicle has not reported yet are `None`.
///
/// `uptime_ms` is kept raw; formatting is left to presentation code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub vehicle_id: VehicleId,
    pub status: Option<String>,
    pub last_command: Option<String>,
    pub speed: Option<i32>,
    pub wifi_rssi: Option<i32>,
    pub uptime_ms: Option<u64>,
    pub free_heap_bytes: Option<u64>,
    pub battery_percentage: Option<u8>,
    pub battery_voltage: Option<f32>,
    pub charging: Option<bool>,
    /// Local arrival time of the most recent applied report.
    pub received_at: DateTime<Utc>,
    /// Vehicle clock (ms) of the newest applied report across both streams.
    /// Reports older than this are dropped.
    pub source_timestamp: u64,
    pub status_timestamp: Option<u64>,
    pub battery_timestamp: Option<u64>,
}

impl TelemetrySnapshot {
    /// A snapshot with no reported fields yet.
    pub fn empty(vehicle_id: VehicleId, received_at: DateTime<Utc>) -> Self {
        Self {
            vehicle_id,
            status: None,
            last_command: None,
            speed: None,
            wifi_rssi: None,
            uptime_ms: None,
            free_heap_bytes: None,
            battery_percentage: None,
            battery_voltage: None,
            charging: None,
            received_at,
            source_timestamp: 0,
            status_timestamp: None,
            battery_timestamp: None,
        }
    }

    /// `true` when a report stamped `source_timestamp` is older than this
    /// snapshot, whichever stream produced either of them. Equal is not older.
    pub fn is_older(&self, source_timestamp: u64) -> bool {
        source_timestamp < self.source_timestamp
    }

    /// Overwrite the status fields with `report`.
    pub fn apply_status(&mut self, report: &StatusReport, received_at: DateTime<Utc>) {
        self.status = report.status.clone();
        self.last_command = report.last_command.clone();
        self.speed = report.speed;
        self.wifi_rssi = report.wifi_rssi;
        self.uptime_ms = report.uptime_ms;
        self.free_heap_bytes = report.free_heap;
        self.status_timestamp = Some(report.timestamp_ms);
        self.touch(report.timestamp_ms, received_at);
    }

    /// Overwrite the battery fields with `report`.
    pub fn apply_battery(&mut self, report: &BatteryReport, received_at: DateTime<Utc>) {
        self.battery_percentage = Some(report.battery_percentage);
        self.battery_voltage = Some(report.battery_voltage);
        self.charging = Some(report.charging);
        self.battery_timestamp = Some(report.timestamp_ms);
        self.touch(report.timestamp_ms, received_at);
    }

    /// `true` when more than `threshold` has elapsed between `received_at`
    /// and `now`. Exactly `threshold` is still fresh, and a `now` earlier
    /// than `received_at` (clock skew) never counts as stale.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.signed_duration_since(self.received_at)
            .to_std()
            .is_ok_and(|age| age > threshold)
    }

    fn touch(&mut self, source_timestamp: u64, received_at: DateTime<Utc>) {
        self.source_timestamp = self.source_timestamp.max(source_timestamp);
        self.received_at = received_at;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Connection state
// ────────────────────────────────────────────────────────────────────────────

/// Broker session state. Only the session supervisor drives transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
        };
        f.write_str(name)
    }
}

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// Map the numeric MQTT level (0, 1, 2).
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Observer events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper fanned out to observers of the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. "rover-relay::supervisor"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    ConnectionChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A connect attempt failed; `fatal` attempts are not retried.
    ConnectFailed { reason: String, fatal: bool },
    Telemetry(TelemetrySnapshot),
    CommandSent(CommandMessage),
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Failure to establish a broker session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("timed out waiting for the broker to acknowledge the connection")]
    Timeout,

    /// Credentials were refused. Fatal: the supervisor does not retry.
    #[error("broker rejected credentials: {0}")]
    AuthRejected(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}

impl ConnectError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectError::AuthRejected(_))
    }
}

/// Failure to hand a message to the broker. Never retried by the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("not connected to the broker")]
    NotConnected,

    #[error("broker rejected publish: {0}")]
    BrokerRejected(String),

    #[error("publish timed out")]
    Timeout,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("not connected to the broker")]
    NotConnected,

    #[error("broker rejected subscription to '{pattern}': {reason}")]
    BrokerRejected { pattern: String, reason: String },
}

/// Typed result of an operator command submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("{kind} for {vehicle} dropped: repeated within the debounce window")]
    Debounced { vehicle: VehicleId, kind: CommandKind },

    #[error("cannot send commands while {0}")]
    NotConnected(ConnectionState),

    #[error("speed {0} outside 0..=255")]
    InvalidSpeed(i32),

    /// The per-vehicle sequence counter reached its maximum; the channel
    /// fails closed rather than reuse a number.
    #[error("sequence numbers exhausted for {0}")]
    SequenceExhausted(VehicleId),

    #[error("could not encode command: {0}")]
    Encode(String),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Reasons an inbound telemetry message is dropped.
///
/// Out-of-order reports are not errors; they are discarded and counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("malformed telemetry: {0}")]
    Malformed(String),

    #[error("no telemetry route for topic '{0}'")]
    UnroutableTopic(String),
}
