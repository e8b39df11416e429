use std::time::Duration;

/// Linear reconnect backoff bounded by a cap.
///
/// `delay = min(base * attempt, max)`. Attempts are 1-based: the first
/// scheduled retry waits one base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    /// Backoff used after the transport closes an established connection.
    pub fn after_close() -> Self {
        Self::new(10_000, 60_000)
    }

    /// Backoff used after a connect call fails before producing a connection.
    pub fn after_connect_failure() -> Self {
        Self::new(5_000, 30_000)
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let calculated = self.base_delay_ms.saturating_mul(u64::from(attempt));
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::after_close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_attempt_waits_one_base_delay() {
        let policy = RetryPolicy::new(250, 8_000);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
    }

    #[test]
    fn scales_linearly_for_attempts() {
        let policy = RetryPolicy::new(10_000, 60_000);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(30));
    }

    #[test]
    fn caps_delay_at_max() {
        let policy = RetryPolicy::new(1_000, 4_000);
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(4_000));
    }

    #[test]
    fn max_never_drops_below_base() {
        let policy = RetryPolicy::new(5_000, 1_000);
        assert_eq!(policy.max_delay_ms(), 5_000);
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_until_cap_then_constant(
            base in 1_u64..100_000,
            cap in 1_u64..1_000_000,
            attempts in 1_u32..64,
        ) {
            let policy = RetryPolicy::new(base, cap);
            let mut previous = Duration::ZERO;
            for attempt in 1..=attempts {
                let delay = policy.delay_for_attempt(attempt);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(policy.max_delay_ms()));
                if previous == Duration::from_millis(policy.max_delay_ms()) {
                    prop_assert_eq!(delay, previous);
                }
                previous = delay;
            }
        }
    }
}
