use crate::time::Duration;

/// Capped exponential retry delays, starting at `base_delay` and doubling
/// per recorded attempt.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: 0,
            base_delay,
            max_delay,
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_delay(&self) -> Duration {
        let multiplier = 2u32.saturating_pow(self.attempts.min(16));
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    /// Returns the delay for the attempt about to start and records it.
    pub fn next_attempt(&mut self) -> Duration {
        let delay = self.next_delay();
        self.attempts = self.attempts.saturating_add(1);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_per_attempt() {
        let mut backoff = ExponentialBackoff::new(Duration::seconds(1), Duration::minutes(5));

        assert_eq!(backoff.next_attempt(), Duration::seconds(1));
        assert_eq!(backoff.next_attempt(), Duration::seconds(2));
        assert_eq!(backoff.next_attempt(), Duration::seconds(4));
        assert_eq!(backoff.next_attempt(), Duration::seconds(8));
        assert_eq!(backoff.attempts(), 4);
    }

    #[test]
    fn test_caps_at_max_delay() {
        let mut backoff = ExponentialBackoff::new(Duration::seconds(10), Duration::seconds(60));

        for _ in 0..10 {
            backoff.next_attempt();
        }

        assert_eq!(backoff.next_delay(), Duration::seconds(60));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = ExponentialBackoff::new(Duration::seconds(1), Duration::minutes(5));

        backoff.next_attempt();
        backoff.next_attempt();
        backoff.reset();

        assert_eq!(backoff.next_delay(), Duration::seconds(1));
        assert_eq!(backoff.attempts(), 0);
    }
}
