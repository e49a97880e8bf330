//! Fixed-window message counter.

use std::time::Duration;

use tokio::time::Instant;

/// Counts hits in consecutive windows of `period` and reports whether the
/// current hit is within `threshold`.
///
/// The window restarts lazily: a hit arriving more than `period` after the
/// window start opens a new window at that hit.
#[derive(Clone, Debug)]
pub struct SlidingWindowCounter {
    period: Duration,
    threshold: u32,
    window_start: Instant,
    count: u32,
}

impl SlidingWindowCounter {
    /// Create a counter whose first window starts at `now`.
    pub fn new(threshold: u32, period: Duration, now: Instant) -> Self {
        Self {
            period,
            threshold,
            window_start: now,
            count: 0,
        }
    }

    /// Record one hit at `now`.
    ///
    /// Returns `true` while the window holds at most `threshold` hits.
    pub fn hit(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) > self.period {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.threshold
    }

    /// Whether the window that started at `window_start` has fully elapsed.
    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) > self.period
    }

    /// Hits recorded in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Start of the current window.
    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    /// Maximum hits allowed per window.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Window length.
    pub fn period(&self) -> Duration {
        self.period
    }
}
