//! Reconnect delay policy.

use std::time::Duration;

use rand::Rng;

/// Upper bound of the random jitter added to every computed delay.
pub const JITTER_MS: u64 = 250;

/// Exponential backoff with random jitter.
///
/// `next()` yields `min(max, base * 2^attempt)` plus up to [`JITTER_MS`]
/// milliseconds of jitter and increments the attempt counter; `reset()`
/// restarts the schedule. Purely computational: it owns no timers or sockets
/// so it can be tested without a connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1_000), Duration::from_millis(15_000))
    }
}

impl Backoff {
    /// Create a policy with the given base and cap.
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            max,
        }
    }

    /// Delay to wait before the next reconnect attempt.
    ///
    /// Increments the attempt counter as a side effect.
    pub fn next(&mut self) -> Duration {
        // Cap the shift so the multiplier cannot overflow.
        let exp = self.attempt.min(30);
        let delay = self.base.saturating_mul(1 << exp).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay + Duration::from_millis(rand::rng().random_range(0..JITTER_MS))
    }

    /// Restart the schedule from the base delay.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of `next()` calls since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_in_jitter_window(delay: Duration, expected_ms: u64) {
        let ms = u64::try_from(delay.as_millis()).unwrap();
        assert!(
            ms >= expected_ms && ms < expected_ms + JITTER_MS,
            "delay {ms}ms outside [{expected_ms}, {})",
            expected_ms + JITTER_MS
        );
    }

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(
            Duration::from_millis(1_000),
            Duration::from_millis(15_000),
        );
        for expected in [1_000, 2_000, 4_000, 8_000, 15_000] {
            assert_in_jitter_window(backoff.next(), expected);
        }
        // Stays at the cap from here on.
        assert_in_jitter_window(backoff.next(), 15_000);
    }

    #[test]
    fn reset_restores_base_delay() {
        let mut backoff = Backoff::default();
        for _ in 0..4 {
            backoff.next();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_in_jitter_window(backoff.next(), 1_000);
    }

    #[test]
    fn attempt_counts_calls() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.attempt(), 0);
        backoff.next();
        backoff.next();
        assert_eq!(backoff.attempt(), 2);
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(15));
        for _ in 0..64 {
            let delay = backoff.next();
            assert!(delay <= Duration::from_secs(15) + Duration::from_millis(JITTER_MS));
        }
    }
}
