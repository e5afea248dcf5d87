//! `rover-relay` – command/telemetry relay core.
//!
//! Gets operator intent to a remote vehicle and the vehicle's telemetry back
//! to any number of observers, over a broker connection that may drop at any
//! time.
//!
//! # Modules
//!
//! - [`session`] – [`Session`][session::Session]: the facade a UI holds.
//!   Exposes `submit_command`, `current_snapshot`, `connection_state` and
//!   `subscribe_to_state_changes`.
//! - [`supervisor`] – [`SessionSupervisor`][supervisor::SessionSupervisor]:
//!   the only component that connects or disconnects the transport.  Runs
//!   the connection state machine and reconnects with backoff.
//! - [`command`] – [`CommandChannel`][command::CommandChannel]: speed
//!   validation, per-kind debounce, per-vehicle sequencing and at most one
//!   command in flight per vehicle.
//! - [`telemetry`] – [`TelemetryChannel`][telemetry::TelemetryChannel]:
//!   decodes status and battery reports into per-vehicle snapshots, dropping
//!   malformed and out-of-order messages.
//! - [`sequence`] – [`SequenceGate`][sequence::SequenceGate]: the receiving
//!   side of command ordering.
//! - [`backoff`] – [`Backoff`][backoff::Backoff]: exponential reconnect
//!   delays with jitter.
//! - [`config`] – [`RelayConfig`][config::RelayConfig]: TOML settings with
//!   `ROVER_*` environment overrides.
//!
//! # Data flow
//!
//! ```text
//! operator ─submit─▶ CommandChannel ─publish─▶ Transport ─▶ broker ─▶ vehicle
//! vehicle ─▶ broker ─▶ Transport stream ─▶ TelemetryChannel::ingest ─▶ EventBus
//! ```

pub mod backoff;
pub mod command;
pub mod config;
pub mod sequence;
pub mod session;
pub mod supervisor;
pub mod telemetry;

pub use backoff::{Backoff, BackoffPolicy};
pub use command::{CommandChannel, CommandPolicy};
pub use config::RelayConfig;
pub use sequence::SequenceGate;
pub use session::Session;
pub use supervisor::SessionSupervisor;
pub use telemetry::{IngestOutcome, IngestStats, TelemetryChannel};
