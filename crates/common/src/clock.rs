//! Clock and timing utilities for the frame pipeline.
//!
//! Frame timestamps are nanoseconds on a monotonic clock anchored at
//! session start. Writers and readers tick independently, so each side
//! keeps its own [`FrameTicker`].

use std::time::{Duration, Instant};

/// Monotonic frame timestamps anchored at host start.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    epoch: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since the epoch.
    pub fn elapsed_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Frame interval for a rate, clamped to at least 1ms.
pub fn frame_interval(fps: u32) -> Duration {
    let fps = fps.max(1) as u64;
    Duration::from_nanos((1_000_000_000 / fps).max(1_000_000))
}

/// Fixed-cadence ticker for render and presentation loops.
///
/// Deadlines advance by whole intervals. If the loop falls behind by
/// more than one interval, the schedule resets to now instead of
/// bursting to catch up.
#[derive(Debug)]
pub struct FrameTicker {
    interval: Duration,
    next_at: Option<Instant>,
    ticks: u64,
}

impl FrameTicker {
    /// Create a ticker for the given frame rate.
    pub fn new(fps: u32) -> Self {
        Self {
            interval: frame_interval(fps),
            next_at: None,
            ticks: 0,
        }
    }

    /// Target interval between ticks.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of ticks taken.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Record a tick at `now` and return the deadline for the next one.
    pub fn advance(&mut self, now: Instant) -> Instant {
        self.ticks += 1;
        let next = match self.next_at {
            None => now + self.interval,
            Some(prev) => {
                let candidate = prev + self.interval;
                if candidate < now {
                    now
                } else {
                    candidate
                }
            }
        };
        self.next_at = Some(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = SessionClock::start();
        let a = clock.elapsed_ns();
        let b = clock.elapsed_ns();
        assert!(b >= a);
        assert!(a < 1_000_000_000);
    }

    #[test]
    fn test_frame_interval_50fps() {
        assert_eq!(frame_interval(50), Duration::from_millis(20));
        assert_eq!(frame_interval(0), Duration::from_secs(1));
    }

    #[test]
    fn test_ticker_advances_by_interval() {
        let mut ticker = FrameTicker::new(50);
        let start = Instant::now();
        let first = ticker.advance(start);
        assert_eq!(first, start + Duration::from_millis(20));
        let second = ticker.advance(start + Duration::from_millis(5));
        assert_eq!(second, start + Duration::from_millis(40));
        assert_eq!(ticker.ticks(), 2);
    }

    #[test]
    fn test_ticker_resets_when_behind() {
        let mut ticker = FrameTicker::new(50);
        let start = Instant::now();
        ticker.advance(start);
        let late = start + Duration::from_millis(500);
        assert_eq!(ticker.advance(late), late);
    }
}
