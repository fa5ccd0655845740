//! Exponential backoff schedule for automatic reconnection.

use std::time::Duration;

use deskwire_settings::ConnectionSettings;

/// Backoff: `base * 2^attempt`, capped at `max_delay`, for at most
/// `max_attempts` consecutive failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectionPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl From<&ConnectionSettings> for ReconnectionPolicy {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.reconnection_delay_ms),
            max_delay: Duration::from_millis(settings.max_reconnection_delay_ms),
            max_attempts: settings.reconnection_attempts,
        }
    }
}

impl ReconnectionPolicy {
    /// Delay before the attempt numbered `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(20);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Every delay the policy will ever produce, in order.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(|attempt| self.delay_for_attempt(attempt))
    }
}
