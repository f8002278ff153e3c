//! Time source of the session state machine.

use embassy_time::Instant;

/// A monotonic clock.
///
/// The session only compares deadlines against `now`, so tests drive it with
/// a manually advanced clock.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The embassy time driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<C: Clock> Clock for &C {
    fn now(&self) -> Instant {
        (*self).now()
    }
}
