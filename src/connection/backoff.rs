//! Reconnect policy and backoff computation.
//!
//! After an unexpected link loss the driver waits, reopens, and repeats
//! until it succeeds, the attempt budget runs out, or the client is shut
//! down. Delays grow geometrically from `initial_delay` up to `max_delay`
//! and carry ±25% jitter so that many clients dropped by the same server
//! restart do not reconnect in lockstep.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::time::Duration;

/// Automatic reconnection settings.
///
/// Configure through [`ClientConfig::with_reconnect`](crate::ClientConfig::with_reconnect)
/// or [`KvClientBuilder::reconnect`](crate::KvClientBuilder::reconnect).
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnect at all after an unexpected link loss.
    pub enabled: bool,

    /// Give up after this many consecutive failed opens.
    ///
    /// `None` retries forever.
    pub max_attempts: Option<u32>,

    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f32,

    /// Delay before the first reopen.
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    /// - `enabled`: true
    /// - `max_attempts`: unlimited
    /// - `multiplier`: 2.0
    /// - `initial_delay`: 250ms
    /// - `max_delay`: 30s
    fn default() -> Self {
        // ---
        Self {
            enabled: true,
            max_attempts: None,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    // ---

    /// Never reconnect; a dropped link leaves the client closed until
    /// [`KvClient::reconnect`](crate::KvClient::reconnect) is called.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        // ---
        self.enabled && self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Un-jittered delay before attempt number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        // ---
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = (self.multiplier.max(1.0) as f64).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Jittered delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        apply_jitter(self.base_delay(attempt))
    }
}

/// Apply ±25% jitter: `delay * (0.75 + random(0.0..0.5))`.
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let hash = RandomState::new().hash_one(std::time::SystemTime::now());
    let random_factor = (hash % 1000) as f64 / 1000.0;
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}
