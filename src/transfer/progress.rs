//! Transfer-rate bookkeeping.
//!
//! A bounded deque of (amount, instant) samples over a 30 second window
//! feeds the byte-rate estimate; totals cover the whole session.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples older than this fall out of the rate window.
const RATE_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct Sample {
    amt: u64,
    at: Instant,
}

#[derive(Debug)]
pub struct ProgressTracker {
    pub total_bytes_to_transfer: u64,
    pub total_transferred: u64,
    pub started_at: Option<Instant>,
    /// Plan index of the file currently producing data, for rendering.
    pub active_idx: Option<usize>,
    samples: VecDeque<Sample>,
    window_amt: u64,
    window_interval: Duration,
}

impl ProgressTracker {
    pub fn new(total_bytes_to_transfer: u64) -> Self {
        Self {
            total_bytes_to_transfer,
            total_transferred: 0,
            started_at: None,
            active_idx: None,
            samples: VecDeque::new(),
            window_amt: 0,
            window_interval: Duration::ZERO,
        }
    }

    /// Mark the start of transmission with a zero-byte anchor sample.
    pub fn start_transfer(&mut self) {
        let now = Instant::now();
        self.samples.push_back(Sample { amt: 0, at: now });
        self.started_at = Some(now);
    }

    /// Record an acknowledged write of `amt` raw bytes and slide the window.
    /// At least two samples are always retained so the interval stays
    /// meaningful right after a stall.
    pub fn on_transfer(&mut self, amt: u64) {
        let now = Instant::now();
        self.total_transferred += amt;
        self.samples.push_back(Sample { amt, at: now });
        self.window_amt += amt;
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(front) if now.duration_since(front.at) > RATE_WINDOW => {
                    self.window_amt -= front.amt;
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
        self.window_interval = match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => last.at.duration_since(first.at),
            _ => Duration::ZERO,
        };
    }

    /// Current window rate in bytes per second; zero while the window is
    /// empty.
    pub fn rate(&self) -> f64 {
        safe_divide(self.window_amt as f64, self.window_interval.as_secs_f64())
    }
}

pub fn safe_divide(num: f64, denom: f64) -> f64 {
    if denom == 0.0 {
        0.0
    } else {
        num / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_accumulate() {
        let mut tracker = ProgressTracker::new(100);
        tracker.start_transfer();
        tracker.on_transfer(30);
        tracker.on_transfer(20);
        assert_eq!(tracker.total_transferred, 50);
        assert_eq!(tracker.total_bytes_to_transfer, 100);
    }

    #[test]
    fn test_rate_is_zero_without_elapsed_time() {
        let tracker = ProgressTracker::new(0);
        assert_eq!(tracker.rate(), 0.0);
    }

    #[test]
    fn test_window_keeps_at_least_two_samples() {
        let mut tracker = ProgressTracker::new(0);
        tracker.start_transfer();
        tracker.on_transfer(10);
        tracker.on_transfer(10);
        // nothing is stale in a fast test run, but the floor must hold even
        // if eviction logic changes
        assert!(tracker.samples.len() >= 2);
    }

    #[test]
    fn test_window_evicts_stale_samples() {
        let mut tracker = ProgressTracker::new(0);
        let now = Instant::now();
        let old = now - Duration::from_secs(60);
        tracker.samples.push_back(Sample { amt: 5, at: old });
        tracker.samples.push_back(Sample { amt: 5, at: old });
        tracker.window_amt = 10;
        tracker.on_transfer(7);
        tracker.on_transfer(3);
        // stale samples are gone once fresh ones can hold the two-sample floor
        assert_eq!(tracker.samples.len(), 2);
        assert_eq!(tracker.window_amt, 10);
    }

    #[test]
    fn test_safe_divide() {
        assert_eq!(safe_divide(10.0, 0.0), 0.0);
        assert_eq!(safe_divide(10.0, 4.0), 2.5);
    }
}
