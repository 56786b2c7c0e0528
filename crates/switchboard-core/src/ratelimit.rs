//! Per-connection dial rate limiting.
//!
//! A fixed window that resets when a new attempt arrives after expiry.
//! All mutation happens under the exchange's dispatch lock, so a plain
//! counter suffices.

use std::time::{Duration, Instant};

/// Sliding dial window for one connection.
#[derive(Debug, Clone)]
pub struct DialRateLimiter {
    max_attempts: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl DialRateLimiter {
    #[must_use]
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Record an attempt at `now`. Returns `false` when the window is
    /// exhausted and the frame should be dropped.
    pub fn check(&mut self, now: Instant) -> bool {
        if self.max_attempts == 0 {
            return true;
        }
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= self.max_attempts
    }

    /// Reset the counter (connection teardown).
    pub fn reset(&mut self) {
        self.count = 0;
        self.window_start = Instant::now();
    }

    #[must_use]
    pub fn attempts_in_window(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let mut limiter = DialRateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.check(now));
        assert!(limiter.check(now));
        assert!(limiter.check(now));
        assert!(!limiter.check(now));
    }

    #[test]
    fn test_window_expiry_resets() {
        let mut limiter = DialRateLimiter::new(1, Duration::from_millis(10));
        let start = Instant::now();

        assert!(limiter.check(start));
        assert!(!limiter.check(start));
        assert!(limiter.check(start + Duration::from_millis(11)));
    }

    #[test]
    fn test_zero_limit_disables() {
        let mut limiter = DialRateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..1000 {
            assert!(limiter.check(Instant::now()));
        }
    }
}
