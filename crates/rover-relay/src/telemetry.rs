//! [`TelemetryChannel`] – inbound status/battery decoding and the per-vehicle
//! snapshot map.
//!
//! Each inbound message is routed by topic, size-checked, parsed and
//! validated, then merged into the vehicle's [`TelemetrySnapshot`].  A report
//! whose timestamp is older than the held snapshot, from either stream, is
//! dropped and counted, never applied.
//!
//! The out-of-order check and the merge run under one write lock, so a reader
//! calling [`TelemetryChannel::snapshot`] concurrently never observes a
//! half-applied report.
//!
//! Every applied update is published on [`Lane::Telemetry`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rover_transport::{EventBus, Lane, TelemetryKind, TelemetryRoute, TopicScheme};
use rover_types::{
    BatteryReport, Event, EventPayload, IngestError, StatusReport, TelemetrySnapshot, VehicleId,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Payloads above this size are rejected before parsing.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024;

/// Default age after which a snapshot counts as stale.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(30);

const SOURCE: &str = "rover-relay::telemetry";

/// What [`TelemetryChannel::ingest`] did with a well-formed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    /// Older than the held snapshot; dropped.
    OutOfOrder,
}

/// Running counters of [`TelemetryChannel::ingest`] results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub applied: u64,
    pub out_of_order: u64,
    pub malformed: u64,
}

enum Report {
    Status(StatusReport),
    Battery(BatteryReport),
}

impl Report {
    fn vehicle_id(&self) -> Option<&VehicleId> {
        match self {
            Report::Status(report) => report.vehicle_id.as_ref(),
            Report::Battery(report) => report.vehicle_id.as_ref(),
        }
    }

    fn timestamp_ms(&self) -> u64 {
        match self {
            Report::Status(report) => report.timestamp_ms,
            Report::Battery(report) => report.timestamp_ms,
        }
    }
}

/// Latest known state of every vehicle heard from.
pub struct TelemetryChannel {
    topics: TopicScheme,
    stale_threshold: Duration,
    snapshots: RwLock<HashMap<VehicleId, TelemetrySnapshot>>,
    bus: EventBus,
    applied: AtomicU64,
    out_of_order: AtomicU64,
    malformed: AtomicU64,
}

impl TelemetryChannel {
    pub fn new(topics: TopicScheme, stale_threshold: Duration, bus: EventBus) -> Self {
        Self {
            topics,
            stale_threshold,
            snapshots: RwLock::new(HashMap::new()),
            bus,
            applied: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Decode and merge one inbound message.
    ///
    /// Malformed payloads are logged and reported as
    /// [`IngestError::Malformed`]; they never affect held state.
    pub fn ingest(
        &self,
        topic: &str,
        payload: &[u8],
        arrival_time: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        let route = self.topics.route(topic).ok_or_else(|| {
            debug!(topic, "Ignoring message on a non-telemetry topic");
            IngestError::UnroutableTopic(topic.to_string())
        })?;

        let (vehicle, report) = self.decode(&route, payload).inspect_err(|err| {
            self.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(topic, error = %err, "Dropping malformed telemetry");
        })?;

        let updated = {
            let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
            let snapshot = snapshots
                .entry(vehicle.clone())
                .or_insert_with(|| TelemetrySnapshot::empty(vehicle.clone(), arrival_time));
            if snapshot.is_older(report.timestamp_ms()) {
                None
            } else {
                match &report {
                    Report::Status(report) => snapshot.apply_status(report, arrival_time),
                    Report::Battery(report) => snapshot.apply_battery(report, arrival_time),
                }
                Some(snapshot.clone())
            }
        };

        match updated {
            Some(snapshot) => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                debug!(vehicle = %vehicle, topic, "Telemetry applied");
                self.bus
                    .publish_to(Lane::Telemetry, Event::new(SOURCE, EventPayload::Telemetry(snapshot)));
                Ok(IngestOutcome::Applied)
            }
            None => {
                self.out_of_order.fetch_add(1, Ordering::Relaxed);
                debug!(vehicle = %vehicle, topic, "Out-of-order telemetry dropped");
                Ok(IngestOutcome::OutOfOrder)
            }
        }
    }

    fn decode(
        &self,
        route: &TelemetryRoute,
        payload: &[u8],
    ) -> Result<(VehicleId, Report), IngestError> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(IngestError::Malformed(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD_BYTES}",
                payload.len()
            )));
        }

        let report = match route.kind {
            TelemetryKind::Status => Report::Status(parse(payload)?),
            TelemetryKind::Battery => {
                let report: BatteryReport = parse(payload)?;
                if report.battery_percentage > 100 {
                    return Err(IngestError::Malformed(format!(
                        "battery_percentage {} above 100",
                        report.battery_percentage
                    )));
                }
                if !report.battery_voltage.is_finite() || report.battery_voltage < 0.0 {
                    return Err(IngestError::Malformed(format!(
                        "battery_voltage {} is not a valid reading",
                        report.battery_voltage
                    )));
                }
                Report::Battery(report)
            }
        };

        let vehicle = report
            .vehicle_id()
            .or(route.vehicle_hint.as_ref())
            .filter(|id| !id.as_str().is_empty())
            .cloned()
            .ok_or_else(|| IngestError::Malformed("no vehicle id in payload or topic".into()))?;

        Ok((vehicle, report))
    }

    /// Consistent copy of `vehicle`'s snapshot.
    pub fn snapshot(&self, vehicle: &VehicleId) -> Option<TelemetrySnapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vehicle)
            .cloned()
    }

    /// Copies of every held snapshot, ordered by vehicle id.
    pub fn snapshots(&self) -> Vec<TelemetrySnapshot> {
        let mut all: Vec<_> = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        all
    }

    /// `true` when `vehicle` has no snapshot yet or its snapshot is older
    /// than `threshold` at `now`.
    pub fn is_stale(&self, vehicle: &VehicleId, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vehicle)
            .is_none_or(|snapshot| snapshot.is_stale(now, threshold))
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            applied: self.applied.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T, IngestError> {
    serde_json::from_slice(payload).map_err(|e| IngestError::Malformed(e.to_string()))
}
