//! Adaptive bandwidth throttle for one output writer.
//!
//! Two windows run over the bytes the writer puts on the wire:
//!
//! ```text
//! short window (50 kB)   every 50 kB, sleep until the window took
//!                        bytes * 8 / effective_bps seconds
//!
//! long window (2 MB)     measure sustained throughput, smooth it (EWMA),
//!                        ceiling = 10 x smoothed; when the nominal cap is
//!                        below the ceiling, run at min(ceiling, 4 x nominal)
//! ```
//!
//! Outside catch-up the writer keeps up with live data, so the long-window
//! rate approximates the real-time data rate and the ceiling lets a backlog
//! drain at up to ten times real time.  While the session is replaying the
//! long window is held reset so catch-up bursts do not feed the average.
//!
//! When the receiver's data latency exceeds [`HIGH_LATENCY`] each short
//! window sleep is halved to shed backlog faster.
//!
//! All methods take the current [`Instant`] so the arithmetic is testable
//! without a clock.

use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const SHORT_WINDOW_BYTES: u64 = 50_000;
const LONG_WINDOW_BYTES: u64 = 2_000_000;
const EWMA_WEIGHT: f64 = 0.25;
const REALTIME_MULTIPLE: f64 = 10.0;
const MAX_BOOST: u64 = 4;

/// Data latency above which the throttle sleeps half as long.
pub const HIGH_LATENCY: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Throttle {
    // ---
    /// Configured cap, bits per second.  0 = unthrottled.
    nominal_bps: u64,

    /// Cap currently enforced by the short window.
    effective_bps: u64,

    short_bytes: u64,
    short_start: Instant,

    long_bytes: u64,
    long_start: Instant,

    /// Smoothed sustained throughput, bits per second.
    smoothed_bps: Option<f64>,
}

// ---

impl Throttle {
    // ---
    pub fn new(nominal_bps: u64, now: Instant) -> Self {
        // ---
        Self {
            nominal_bps,
            effective_bps: nominal_bps,
            short_bytes: 0,
            short_start: now,
            long_bytes: 0,
            long_start: now,
            smoothed_bps: None,
        }
    }

    pub fn effective_bps(&self) -> u64 {
        self.effective_bps
    }

    #[cfg(test)]
    pub fn smoothed_bps(&self) -> Option<f64> {
        self.smoothed_bps
    }

    // ---

    /// Account for `bytes` just written and return how long to sleep before
    /// the next write.
    pub fn record(
        &mut self,
        bytes: usize,
        now: Instant,
        replaying: bool,
        latency: Option<Duration>,
    ) -> Duration {
        // ---
        if self.nominal_bps == 0 {
            return Duration::ZERO;
        }
        let bytes = bytes as u64;

        if replaying {
            self.long_bytes = 0;
            self.long_start = now;
        } else {
            self.long_bytes += bytes;
            if self.long_bytes >= LONG_WINDOW_BYTES {
                self.close_long_window(now);
            }
        }

        self.short_bytes += bytes;
        if self.short_bytes < SHORT_WINDOW_BYTES {
            return Duration::ZERO;
        }

        let target =
            Duration::from_secs_f64(self.short_bytes as f64 * 8.0 / self.effective_bps as f64);
        let elapsed = now.saturating_duration_since(self.short_start);
        let mut pause = target.saturating_sub(elapsed);
        if latency.is_some_and(|l| l > HIGH_LATENCY) {
            pause /= 2;
        }

        self.short_bytes = 0;
        self.short_start = now + pause;
        pause
    }

    // ---

    fn close_long_window(&mut self, now: Instant) {
        // ---
        let secs = now.saturating_duration_since(self.long_start).as_secs_f64();
        let bytes = self.long_bytes;
        self.long_bytes = 0;
        self.long_start = now;
        if secs <= 0.0 {
            return;
        }

        let measured = bytes as f64 * 8.0 / secs;
        let smoothed = match self.smoothed_bps {
            Some(prev) => prev + EWMA_WEIGHT * (measured - prev),
            None => measured,
        };
        self.smoothed_bps = Some(smoothed);

        let ceiling = (smoothed * REALTIME_MULTIPLE) as u64;
        let previous = self.effective_bps;
        self.effective_bps = if self.nominal_bps < ceiling {
            ceiling.min(self.nominal_bps * MAX_BOOST)
        } else {
            self.nominal_bps
        };

        if self.effective_bps != previous {
            tracing::debug!(
                nominal_bps = self.nominal_bps,
                effective_bps = self.effective_bps,
                smoothed_bps = smoothed as u64,
                "throttle adjusted",
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn unthrottled_never_sleeps() {
        // ---
        let t0 = Instant::now();
        let mut t = Throttle::new(0, t0);
        assert_eq!(t.record(10_000_000, t0, false, None), Duration::ZERO);
    }

    #[test]
    fn short_window_enforces_nominal_rate() {
        // ---
        let t0 = Instant::now();
        let mut t = Throttle::new(100_000, t0);

        // 40 kB: below the window, no pause.
        assert_eq!(t.record(40_000, t0, false, None), Duration::ZERO);

        // 50 kB at 100 kbit/s takes 4 s; 1 s already passed.
        let pause = t.record(10_000, t0 + Duration::from_secs(1), false, None);
        assert_eq!(pause, Duration::from_secs(3));
    }

    #[test]
    fn slow_writer_is_not_delayed() {
        // ---
        let t0 = Instant::now();
        let mut t = Throttle::new(100_000, t0);
        let pause = t.record(50_000, t0 + Duration::from_secs(10), false, None);
        assert_eq!(pause, Duration::ZERO);
    }

    #[test]
    fn high_latency_halves_the_pause() {
        // ---
        let t0 = Instant::now();
        let mut t = Throttle::new(100_000, t0);
        let pause = t.record(50_000, t0, false, Some(Duration::from_secs(300)));
        assert_eq!(pause, Duration::from_secs(2));
    }

    #[test]
    fn long_window_boosts_up_to_four_times_nominal() {
        // ---
        let t0 = Instant::now();
        let mut t = Throttle::new(100_000, t0);

        // 2 MB over 200 s: 80 kbit/s sustained, ceiling 800 kbit/s.
        t.record(2_000_000, t0 + Duration::from_secs(200), false, None);
        assert_eq!(t.smoothed_bps(), Some(80_000.0));
        assert_eq!(t.effective_bps(), 400_000);
    }

    #[test]
    fn boost_is_limited_to_ten_times_real_time() {
        // ---
        let t0 = Instant::now();
        let mut t = Throttle::new(100_000, t0);

        // 2 MB over 1600 s: 10 kbit/s sustained, ceiling 100 kbit/s.
        t.record(2_000_000, t0 + Duration::from_secs(1600), false, None);
        assert_eq!(t.effective_bps(), 100_000);

        // Next window 2 MB over 1000 s: 16 kbit/s, smoothed 11.5 kbit/s.
        let t1 = t0 + Duration::from_secs(1600);
        t.record(2_000_000, t1 + Duration::from_secs(1000), false, None);
        assert_eq!(t.smoothed_bps(), Some(11_500.0));
        assert_eq!(t.effective_bps(), 115_000);
    }

    #[test]
    fn replay_suspends_long_window() {
        // ---
        let t0 = Instant::now();
        let mut t = Throttle::new(100_000, t0);
        t.record(1_900_000, t0 + Duration::from_secs(1), true, None);
        t.record(1_900_000, t0 + Duration::from_secs(2), true, None);
        assert_eq!(t.smoothed_bps(), None);
        assert_eq!(t.effective_bps(), 100_000);
    }

    #[test]
    fn long_window_restarts_when_replay_ends() {
        // ---
        let t0 = Instant::now();
        let mut t = Throttle::new(100_000, t0);
        t.record(1_900_000, t0 + Duration::from_secs(1), true, None);

        // Only the bytes written after the replay count: 2 MB over 200 s.
        t.record(2_000_000, t0 + Duration::from_secs(201), false, None);
        assert_eq!(t.smoothed_bps(), Some(80_000.0));
        assert_eq!(t.effective_bps(), 400_000);
    }
}
