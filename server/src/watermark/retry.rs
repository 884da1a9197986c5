//! Retry policy for contended watermark mints.

use std::time::Duration;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff after attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        std::cmp::min(Duration::from_millis(millis as u64), self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(5);
        assert_eq!(policy.delay(1), Duration::from_millis(2));
        assert_eq!(policy.delay(2), Duration::from_millis(4));
        assert_eq!(policy.delay(50), policy.max_delay);
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::new(3);
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }
}
