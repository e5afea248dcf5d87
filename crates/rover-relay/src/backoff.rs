//! [`Backoff`] – reconnect delay schedule.
//!
//! Delays grow exponentially from `base` by `factor` per failed attempt,
//! are capped at `cap`, and carry a uniform ±`jitter` spread so a fleet of
//! consoles does not hammer a recovering broker in lockstep.  The jittered
//! delay is clamped to the cap as well.
//!
//! A connection that stays up longer than `reset_after` resets the schedule
//! to `base`; shorter-lived connections keep escalating.
//!
//! # Example
//!
//! ```
//! use rand::SeedableRng;
//! use rand::rngs::StdRng;
//! use rover_relay::backoff::{Backoff, BackoffPolicy};
//!
//! let mut backoff = Backoff::new(BackoffPolicy::default());
//! let mut rng = StdRng::seed_from_u64(7);
//! let first = backoff.next_delay_with(&mut rng);
//! assert!(first.as_secs_f64() >= 0.8 && first.as_secs_f64() <= 1.2);
//! ```

use std::time::Duration;

use rand::Rng;

/// Tunables of the reconnect schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    /// Fractional spread applied to each delay, e.g. `0.2` for ±20%.
    pub jitter: f64,
    /// Connected periods longer than this reset the schedule.
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(30),
            jitter: 0.2,
            reset_after: Duration::from_secs(60),
        }
    }
}

/// Stateful position in a [`BackoffPolicy`] schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The un-jittered delay the next call to
    /// [`next_delay`][Self::next_delay] is centred on.
    pub fn nominal_delay(&self) -> Duration {
        self.policy
            .factor
            .checked_pow(self.attempt)
            .and_then(|multiplier| self.policy.base.checked_mul(multiplier))
            .unwrap_or(self.policy.cap)
            .min(self.policy.cap)
    }

    /// Next delay, jittered with the thread-local RNG.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// Next delay, jittered with `rng`.
    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.policy.jitter;
        if jitter.is_nan() || jitter <= 0.0 {
            return nominal;
        }
        let spread = rng.gen_range(-jitter..=jitter);
        let secs = (nominal.as_secs_f64() * (1.0 + spread)).max(0.0);
        Duration::from_secs_f64(secs).min(self.policy.cap)
    }

    /// Record that a connection lasting `connected_for` was lost.
    pub fn connection_lost(&mut self, connected_for: Duration) {
        if connected_for > self.policy.reset_after {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
