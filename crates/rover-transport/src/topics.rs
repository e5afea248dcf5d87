//! Topic naming and MQTT wildcard matching.
//!
//! Every vehicle namespace carries three topics:
//!
//! | Topic | Direction | Payload |
//! |---|---|---|
//! | `<namespace>/command` | operator → vehicle | `CommandMessage` |
//! | `<namespace>/status` | vehicle → operator | `StatusReport` |
//! | `<namespace>/battery` | vehicle → operator | `BatteryReport` |
//!
//! A [`TopicScheme`] either puts every vehicle on one shared namespace
//! (addressing by the `vehicle_id` payload field) or gives each vehicle its
//! own namespace named after its id.

use rover_types::VehicleId;

pub const DEFAULT_NAMESPACE: &str = "esp32car";

const COMMAND_SUFFIX: &str = "command";
const STATUS_SUFFIX: &str = "status";
const BATTERY_SUFFIX: &str = "battery";

/// Which telemetry stream an inbound topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryKind {
    Status,
    Battery,
}

/// Result of routing an inbound topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRoute {
    pub kind: TelemetryKind,
    /// Vehicle implied by the topic itself (per-vehicle namespaces only).
    pub vehicle_hint: Option<VehicleId>,
}

/// Maps vehicles to broker topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    namespace: String,
    per_vehicle: bool,
}

impl TopicScheme {
    /// All vehicles share `namespace`.
    pub fn shared(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            per_vehicle: false,
        }
    }

    /// Each vehicle uses its id as namespace; broadcast traffic stays on
    /// `namespace`.
    pub fn per_vehicle(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            per_vehicle: true,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_per_vehicle(&self) -> bool {
        self.per_vehicle
    }

    fn namespace_for<'a>(&'a self, vehicle: &'a VehicleId) -> &'a str {
        if self.per_vehicle && !vehicle.is_broadcast() {
            vehicle.as_str()
        } else {
            &self.namespace
        }
    }

    pub fn command_topic(&self, vehicle: &VehicleId) -> String {
        format!("{}/{COMMAND_SUFFIX}", self.namespace_for(vehicle))
    }

    pub fn status_topic(&self, vehicle: &VehicleId) -> String {
        format!("{}/{STATUS_SUFFIX}", self.namespace_for(vehicle))
    }

    pub fn battery_topic(&self, vehicle: &VehicleId) -> String {
        format!("{}/{BATTERY_SUFFIX}", self.namespace_for(vehicle))
    }

    /// Subscription patterns covering every telemetry topic of this scheme.
    pub fn telemetry_patterns(&self) -> Vec<String> {
        let mut patterns = Vec::new();
        if self.per_vehicle {
            patterns.push(format!("+/{STATUS_SUFFIX}"));
            patterns.push(format!("+/{BATTERY_SUFFIX}"));
            // A multi-level shared namespace is not covered by `+`.
            if !self.namespace.contains('/') {
                return patterns;
            }
        }
        patterns.push(format!("{}/{STATUS_SUFFIX}", self.namespace));
        patterns.push(format!("{}/{BATTERY_SUFFIX}", self.namespace));
        patterns
    }

    /// Classify an inbound topic, or `None` when it is not a telemetry topic
    /// of this scheme.
    pub fn route(&self, topic: &str) -> Option<TelemetryRoute> {
        let (prefix, suffix) = topic.rsplit_once('/')?;
        let kind = match suffix {
            STATUS_SUFFIX => TelemetryKind::Status,
            BATTERY_SUFFIX => TelemetryKind::Battery,
            _ => return None,
        };
        if prefix.is_empty() {
            return None;
        }
        if prefix == self.namespace {
            return Some(TelemetryRoute {
                kind,
                vehicle_hint: None,
            });
        }
        if self.per_vehicle && !prefix.contains('/') {
            return Some(TelemetryRoute {
                kind,
                vehicle_hint: Some(VehicleId::new(prefix)),
            });
        }
        None
    }
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::shared(DEFAULT_NAMESPACE)
    }
}

/// MQTT topic filter matching: `+` matches exactly one level, a trailing `#`
/// matches the remaining levels (including none).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return pattern_levels.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
