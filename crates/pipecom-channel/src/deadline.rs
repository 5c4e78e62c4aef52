use std::time::{Duration, Instant};

/// Sleep/poll granularity for readiness-loop waits.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An explicit wait bound threaded through every blocking channel call.
///
/// A zero timeout is the sentinel for "no bound" and is represented as an
/// unbounded deadline; it never means "fail immediately".
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    /// A deadline `timeout` from now. `Duration::ZERO` means unbounded.
    pub fn after(timeout: Duration) -> Self {
        if timeout.is_zero() {
            Self::unbounded()
        } else {
            Self {
                end: Some(Instant::now() + timeout),
            }
        }
    }

    /// A deadline that never elapses.
    pub fn unbounded() -> Self {
        Self { end: None }
    }

    /// Whether the deadline has elapsed.
    pub fn expired(&self) -> bool {
        match self.end {
            Some(end) => Instant::now() >= end,
            None => false,
        }
    }

    /// Time left before the deadline, or `None` when unbounded.
    ///
    /// Returns `Some(Duration::ZERO)` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.end.map(|end| end.saturating_duration_since(Instant::now()))
    }

    /// How long one readiness-poll iteration may wait: the poll interval,
    /// clamped to whatever time remains.
    pub fn poll_wait(&self) -> Duration {
        match self.remaining() {
            Some(rem) => rem.min(POLL_INTERVAL),
            None => POLL_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_is_unbounded() {
        let d = Deadline::after(Duration::ZERO);
        assert!(!d.expired());
        assert!(d.remaining().is_none());
    }

    #[test]
    fn bounded_deadline_expires() {
        let d = Deadline::after(Duration::from_millis(10));
        assert!(!d.expired());
        std::thread::sleep(Duration::from_millis(20));
        assert!(d.expired());
        assert_eq!(d.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn poll_wait_clamps_to_remaining() {
        let d = Deadline::after(Duration::from_millis(5));
        assert!(d.poll_wait() <= Duration::from_millis(5));

        let unbounded = Deadline::unbounded();
        assert_eq!(unbounded.poll_wait(), POLL_INTERVAL);
    }
}
