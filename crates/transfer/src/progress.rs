use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum spacing between UI refreshes driven by progress updates.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(250);

/// Percentage of `expected` covered by `transferred`, clamped to 0..=100.
///
/// An unknown size (0) reports 0.
pub fn progress_percent(transferred: u64, expected: u64) -> u8 {
    if expected == 0 {
        return 0;
    }
    let pct = (transferred as u128 * 100) / expected as u128;
    pct.min(100) as u8
}

/// Rate limiter for progress-driven UI refreshes.
///
/// Progress arrives once per chunk, far more often than a screen needs to
/// redraw. `should_refresh` lets at most one refresh through per interval.
pub struct RefreshThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RefreshThrottle {
    /// Creates a throttle. `None` defaults to 250 ms.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval: interval.unwrap_or(DEFAULT_REFRESH_INTERVAL),
            last: Mutex::new(None),
        }
    }

    pub fn should_refresh(&self) -> bool {
        self.should_refresh_at(Instant::now())
    }

    fn should_refresh_at(&self, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl Default for RefreshThrottle {
    fn default() -> Self {
        Self::new(None)
    }
}
