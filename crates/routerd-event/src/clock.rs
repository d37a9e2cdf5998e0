//! Clock abstraction for the event loop
//!
//! The timer list never reads the OS clock directly. It talks to a
//! `ClockSource`, which caches the last observed time and refreshes it
//! on demand. This keeps every timestamp within one loop iteration
//! consistent, and lets tests substitute a manually advanced clock.

use std::time::{Duration, Instant};

use crate::timeval::TimeVal;

/// Source of the event loop's notion of "now".
pub trait ClockSource {
    /// The most recently observed time. Does not query the OS.
    fn current_time(&self) -> TimeVal;

    /// Refresh the cached time from the underlying source.
    fn advance_time(&mut self);

    /// Suspend execution for `interval`, then refresh the cached time.
    ///
    /// Only test harnesses and startup code call this; the event loop
    /// itself waits in `poll(2)` instead.
    fn system_sleep(&mut self, interval: TimeVal);
}

/// Monotonic wall clock.
///
/// Uses a process-wide start point so `TimeVal`s stay small and
/// unaffected by wall-clock steps.
pub struct SystemClock {
    start: Instant,
    cached: TimeVal,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        let mut c = SystemClock {
            start: Instant::now(),
            cached: TimeVal::ZERO,
        };
        c.advance_time();
        c
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClock {
    fn current_time(&self) -> TimeVal {
        self.cached
    }

    fn advance_time(&mut self) {
        self.cached = TimeVal::from(self.start.elapsed());
    }

    fn system_sleep(&mut self, interval: TimeVal) {
        if let Ok(d) = Duration::try_from(interval) {
            std::thread::sleep(d);
        }
        self.advance_time();
    }
}

/// Manually advanced clock for deterministic tests.
///
/// `advance_time` is a no-op; time moves only through [`ManualClock::set`]
/// and [`ManualClock::advance`]. `system_sleep` advances the clock by the
/// requested interval without blocking.
pub struct ManualClock {
    now: TimeVal,
}

impl ManualClock {
    pub fn new(start: TimeVal) -> ManualClock {
        ManualClock { now: start }
    }

    /// Jump to an absolute time. Must not move backwards.
    pub fn set(&mut self, now: TimeVal) {
        debug_assert!(now >= self.now, "manual clock moved backwards");
        self.now = now;
    }

    /// Advance by a relative interval.
    pub fn advance(&mut self, delta: TimeVal) {
        self.now = self.now + delta;
    }
}

impl ClockSource for ManualClock {
    fn current_time(&self) -> TimeVal {
        self.now
    }

    fn advance_time(&mut self) {}

    fn system_sleep(&mut self, interval: TimeVal) {
        self.advance(interval);
    }
}
