//! Reconnect backoff policy.

use crate::config::PeerConfig;
use std::time::Duration;

/// Exponential backoff with optional jitter and a hard cap.
///
/// The delay for attempt `n` is `min(base * 2^n * (1 + j), cap)` where `j`
/// is drawn from `[0, 0.25)` when jitter is enabled. Jitter never exceeds the
/// doubling step, so consecutive delays are non-decreasing up to the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    jitter: bool,
}

impl Backoff {
    /// Create a backoff policy
    #[must_use]
    pub fn new(base: Duration, cap: Duration, max_attempts: u32, jitter: bool) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            jitter,
        }
    }

    /// Build the policy described by a peer configuration
    #[must_use]
    pub fn from_config(config: &PeerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
            config.max_reconnect_attempts,
            config.reconnect_jitter,
        )
    }

    /// Automatic attempts allowed before giving up
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another automatic attempt is allowed after `attempts` so far
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before attempt number `attempt` (0-based)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_millis() as f64 * 2f64.powi(attempt.min(31) as i32);

        let scaled = if self.jitter {
            // Add up to 25% jitter
            use getrandom::getrandom;
            let mut buf = [0u8; 4];
            let _ = getrandom(&mut buf);
            let jitter_factor = (u32::from_le_bytes(buf) % 25) as f64 / 100.0;
            base * (1.0 + jitter_factor)
        } else {
            base
        };

        let capped = scaled.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
