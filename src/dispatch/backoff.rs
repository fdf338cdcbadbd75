//! Retry delays for loops talking to the server.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
///
/// Each failure doubles the delay starting from the loop's normal interval,
/// capped at `max`. A success resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
            failures: 0,
        }
    }

    /// Delay before retrying after another failure.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.current = self.current.saturating_mul(2).min(self.max);
        self.current + jitter(self.current)
    }

    /// Delay to use when the last attempt succeeded.
    pub fn reset(&mut self) -> Duration {
        self.current = self.base;
        self.failures = 0;
        self.base
    }

    /// Consecutive failures so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Up to 10% extra, at most five seconds.
fn jitter(delay: Duration) -> Duration {
    let max_ms = (delay.as_millis() / 10).min(5_000) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within(delay: Duration, expected: Duration) -> bool {
        delay >= expected && delay <= expected + expected / 10 + Duration::from_millis(1)
    }

    #[test]
    fn doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(60));
        assert!(within(backoff.next_delay(), Duration::from_secs(20)));
        assert!(within(backoff.next_delay(), Duration::from_secs(40)));
        assert!(within(backoff.next_delay(), Duration::from_secs(60)));
        assert!(within(backoff.next_delay(), Duration::from_secs(60)));
        assert_eq!(backoff.failures(), 4);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.reset(), Duration::from_secs(5));
        assert_eq!(backoff.failures(), 0);
        assert!(within(backoff.next_delay(), Duration::from_secs(10)));
    }

    #[test]
    fn cap_below_base_uses_base() {
        let mut backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(1));
        assert!(within(backoff.next_delay(), Duration::from_secs(30)));
    }
}
