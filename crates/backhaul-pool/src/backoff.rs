//! Replenishment backoff

use std::time::Duration;

/// Doubling interval bounded by a ceiling, reset to the baseline after any
/// fully successful replenishment cycle.
#[derive(Debug, Clone)]
pub struct Backoff {
    baseline: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(baseline: Duration, max: Duration) -> Self {
        Self {
            baseline,
            max,
            current: baseline,
        }
    }

    /// The interval to wait before the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consume the current interval and double it for the next failure.
    pub fn advance(&mut self) -> Duration {
        let interval = self.current;
        self.current = (self.current * 2).min(self.max);
        interval
    }

    /// Back to the baseline after a successful cycle.
    pub fn reset(&mut self) {
        self.current = self.baseline;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(100));

        assert_eq!(backoff.advance(), Duration::from_secs(30));
        assert_eq!(backoff.advance(), Duration::from_secs(60));
        assert_eq!(backoff.advance(), Duration::from_secs(100));
        assert_eq!(backoff.advance(), Duration::from_secs(100));
    }

    #[test]
    fn test_backoff_resets_to_baseline() {
        let mut backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(300));

        backoff.advance();
        backoff.advance();
        assert_eq!(backoff.current(), Duration::from_secs(120));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(30));
    }
}
