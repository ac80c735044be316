use std::time::Duration;

use crate::runtime_config::ReconnectConfig;

/// Exponential reconnect delay: `base × 2^attempt`, capped, with a bounded
/// number of attempts. `reset` after a connection that actually came up.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base_ms: config.base_delay_ms,
            max_ms: config.max_delay_ms.max(config.base_delay_ms),
            max_attempts: config.max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    /// `max_attempts == 0` means retry forever.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts > 0 && self.attempt >= self.max_attempts {
            return None;
        }
        let multiplier = 1u64.checked_shl(self.attempt.min(63)).unwrap_or(u64::MAX);
        let delay = self.base_ms.saturating_mul(multiplier).min(self.max_ms);
        self.attempt += 1;
        Some(Duration::from_millis(delay))
    }

    /// Like `next_delay`, but keeps retrying at the cap once attempts run out.
    pub fn next_delay_or_max(&mut self) -> Duration {
        self.next_delay().unwrap_or_else(|| self.max_delay())
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: u64, max: u64, attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            base_delay_ms: base,
            max_delay_ms: max,
            max_attempts: attempts,
            ..ReconnectConfig::default()
        }
    }

    #[test]
    fn doubles_until_capped() {
        let mut b = Backoff::new(&config(1_000, 5_000, 10));
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().unwrap().as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
    }

    #[test]
    fn attempts_are_bounded_and_reset() {
        let mut b = Backoff::new(&config(10, 100, 2));
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_none());
        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn exhausted_backoff_holds_at_cap() {
        let mut b = Backoff::new(&config(10, 40, 1));
        assert_eq!(b.next_delay_or_max(), Duration::from_millis(10));
        assert_eq!(b.next_delay_or_max(), Duration::from_millis(40));
        assert_eq!(b.next_delay_or_max(), Duration::from_millis(40));
    }

    #[test]
    fn zero_attempts_means_unbounded() {
        let mut b = Backoff::new(&config(1, 2, 0));
        for _ in 0..100 {
            assert!(b.next_delay().is_some());
        }
    }
}
