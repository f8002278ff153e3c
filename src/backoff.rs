//! Exponential reconnection backoff.

use embassy_time::Duration;

/// Delay generator for connection retries.
///
/// Every call to [`Backoff::next_delay`] returns the current delay and doubles
/// it for the following call, up to the configured maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// A `max` lower than `initial` is raised to `initial`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = if max < initial { initial } else { max };
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = Duration::from_ticks(self.current.as_ticks().saturating_mul(2));
        if self.current > self.max {
            self.current = self.max;
        }
        delay
    }

    /// Restarts from the initial delay, after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: [u64; 5] = core::array::from_fn(|_| backoff.next_delay().as_secs());
        assert_eq!(delays, [1, 2, 4, 5, 5]);
    }

    #[test]
    fn reset_restarts() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn max_below_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }
}
