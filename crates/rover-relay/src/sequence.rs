//! [`SequenceGate`] – receiver-side ordering guard.
//!
//! A vehicle (or anything consuming the command topic) keeps one gate and
//! asks it before applying each command.  Per vehicle id the gate remembers
//! the last applied sequence number and refuses anything at or below it, so
//! duplicated and reordered deliveries become no-ops.
//!
//! # Example
//!
//! ```
//! use rover_relay::sequence::SequenceGate;
//! use rover_types::{CommandKind, CommandMessage, VehicleId};
//!
//! let msg = |sequence| CommandMessage {
//!     command: CommandKind::Forward,
//!     speed: 100,
//!     sequence,
//!     vehicle_id: VehicleId::new("A"),
//!     timestamp_ms: 0,
//! };
//!
//! let mut gate = SequenceGate::new();
//! assert!(gate.admit(&msg(1)));
//! assert!(!gate.admit(&msg(1))); // duplicate
//! assert!(gate.admit(&msg(3)));
//! assert!(!gate.admit(&msg(2))); // late
//! ```

use std::collections::HashMap;

use rover_types::{CommandMessage, VehicleId};

#[derive(Debug, Default)]
pub struct SequenceGate {
    applied: HashMap<VehicleId, u64>,
    rejected: u64,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `message` should be applied, recording its
    /// sequence as the new high-water mark.
    pub fn admit(&mut self, message: &CommandMessage) -> bool {
        match self.applied.get(&message.vehicle_id) {
            Some(&last) if message.sequence <= last => {
                self.rejected += 1;
                false
            }
            _ => {
                self.applied
                    .insert(message.vehicle_id.clone(), message.sequence);
                true
            }
        }
    }

    pub fn last_applied(&self, vehicle: &VehicleId) -> Option<u64> {
        self.applied.get(vehicle).copied()
    }

    /// Commands refused so far.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Forget `vehicle`'s high-water mark, e.g. when the operator console
    /// restarts and its counters begin at 1 again.
    pub fn reset(&mut self, vehicle: &VehicleId) {
        self.applied.remove(vehicle);
    }
}
