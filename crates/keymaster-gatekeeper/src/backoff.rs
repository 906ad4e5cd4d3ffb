//! Poll delay backoff after consecutive transport failures.

use std::time::Duration;

/// Exponential backoff policy for the polling loops.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay used while the Keymaster is reachable.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Policy starting at `initial_delay` with the default cap and multiplier.
    pub fn starting_at(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..Self::default()
        }
    }

    /// Delay after `failures` consecutive failures (0 = healthy).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(failures.min(31) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        // Never back off below the healthy delay, even with a small cap.
        Duration::from_millis(capped_ms as u64).max(self.initial_delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_delay_is_initial() {
        let policy = BackoffPolicy::starting_at(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
    }

    #[test]
    fn exponential_backoff_delays() {
        let policy = BackoffPolicy::starting_at(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(40));
    }

    #[test]
    fn backoff_caps_at_max() {
        let policy = BackoffPolicy::starting_at(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }
}
