//! Per-connection sliding-window rate limiter.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Length of the sliding window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_millis(1000);

/// Sliding-window limiter over accepted message timestamps.
///
/// Only accepted messages are recorded, so a client that keeps sending while
/// limited regains capacity as soon as its oldest accepted message ages out.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: Duration,
    capacity: usize,
    /// Accepted timestamps, oldest first.
    accepted: VecDeque<Instant>,
}

impl RateLimiter {
    /// Create a limiter admitting `capacity` messages per [`RATE_LIMIT_WINDOW`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_window(capacity, RATE_LIMIT_WINDOW)
    }

    #[must_use]
    pub fn with_window(capacity: usize, window: Duration) -> Self {
        Self {
            window,
            capacity,
            accepted: VecDeque::with_capacity(capacity),
        }
    }

    /// Check whether a message arriving at `now` is admitted, recording it if so.
    pub fn allow(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.accepted.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.accepted.pop_front();
            } else {
                break;
            }
        }

        if self.accepted.len() >= self.capacity {
            return false;
        }

        self.accepted.push_back(now);
        true
    }

    /// Number of accepted timestamps currently retained.
    #[must_use]
    pub fn in_window(&self) -> usize {
        self.accepted.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn at(start: Instant, millis: u64) -> Instant {
        start + Duration::from_millis(millis)
    }

    #[test]
    fn test_capacity_three_sequence() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(3);

        assert!(limiter.allow(at(start, 0)));
        assert!(limiter.allow(at(start, 100)));
        assert!(limiter.allow(at(start, 200)));
        assert!(!limiter.allow(at(start, 300)));
        assert!(limiter.allow(at(start, 1001)));
    }

    #[test]
    fn test_rejected_messages_are_not_recorded() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(1);

        assert!(limiter.allow(at(start, 0)));
        for t in [10, 500, 900, 1000] {
            assert!(!limiter.allow(at(start, t)));
        }
        assert_eq!(limiter.in_window(), 1);

        // Only the accepted message at t=0 counts against the window
        assert!(limiter.allow(at(start, 1001)));
    }

    #[test]
    fn test_retained_never_exceeds_capacity() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(5);

        for t in 0..3000 {
            limiter.allow(at(start, t));
            assert!(limiter.in_window() <= limiter.capacity());
        }
    }

    #[test]
    fn test_custom_window() {
        let start = Instant::now();
        let mut limiter = RateLimiter::with_window(2, Duration::from_millis(50));

        assert!(limiter.allow(at(start, 0)));
        assert!(limiter.allow(at(start, 10)));
        assert!(!limiter.allow(at(start, 40)));
        assert!(limiter.allow(at(start, 51)));
    }
}
