//! Jittered exponential backoff
//!
//! Shared by the retry executor and the connection manager:
//! `min(base * 2^(attempt - 1) + uniform(0, jitter), max)`.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Upper bound (exclusive) of the random term
    pub jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };
        self.delay_with_jitter(attempt, Duration::from_millis(jitter))
    }

    /// Delay with an explicit random term, for deterministic callers
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        self.exponential(attempt).saturating_add(jitter).min(self.max)
    }

    /// Largest delay `delay(attempt)` can return
    pub fn ceiling(&self, attempt: u32) -> Duration {
        self.exponential(attempt)
            .saturating_add(self.jitter)
            .min(self.max)
    }

    fn exponential(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconnect() -> Backoff {
        Backoff::new(
            Duration::from_millis(1000),
            Duration::from_millis(30_000),
            Duration::from_millis(1000),
        )
    }

    #[test]
    fn test_exponential_growth() {
        let b = reconnect();
        assert_eq!(b.delay_with_jitter(1, Duration::ZERO), Duration::from_secs(1));
        assert_eq!(b.delay_with_jitter(2, Duration::ZERO), Duration::from_secs(2));
        assert_eq!(b.delay_with_jitter(4, Duration::ZERO), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_is_capped() {
        let b = reconnect();
        for attempt in 1..=64 {
            let d = b.delay(attempt);
            assert!(d <= Duration::from_secs(30), "attempt {attempt}: {d:?}");
            assert!(d <= b.ceiling(attempt));
        }
        assert_eq!(b.delay_with_jitter(40, Duration::from_millis(999)), b.max);
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let b = reconnect();
        for _ in 0..200 {
            let d = b.delay(3);
            assert!(d >= Duration::from_secs(4));
            assert!(d < Duration::from_secs(5));
        }
    }

    #[test]
    fn test_zero_jitter() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), Duration::ZERO);
        assert_eq!(b.delay(2), Duration::from_millis(200));
    }
}
