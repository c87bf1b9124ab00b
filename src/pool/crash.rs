//! GPU crash window.
//!
//! Counts GPU worker crashes inside a rolling window. Crossing the threshold
//! asks the pool to terminate every content worker.

use crate::clock::Timer;
use std::time::{Duration, Instant};

/// Crashes tolerated inside one window.
pub const GPU_CRASH_THRESHOLD: u32 = 2;

/// Length of the window.
pub const GPU_CRASH_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    /// Within budget; `count` crashes in the current window.
    Tolerated { count: u32 },
    /// Threshold exceeded; the counter has been reset.
    TerminateContentProcesses,
}

#[derive(Debug)]
pub struct CrashWindow {
    count: u32,
    threshold: u32,
    window: Duration,
    reset_timer: Timer,
}

impl CrashWindow {
    pub fn new() -> Self {
        Self::with_limits(GPU_CRASH_THRESHOLD, GPU_CRASH_WINDOW)
    }

    pub fn with_limits(threshold: u32, window: Duration) -> Self {
        Self {
            count: 0,
            threshold,
            window,
            reset_timer: Timer::new(),
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.reset_timer.deadline()
    }

    /// Fire the reset timer if due.
    pub fn poll(&mut self, now: Instant) {
        if self.reset_timer.fire_if_due(now) {
            tracing::debug!(crashes = self.count, "GPU crash window elapsed");
            self.count = 0;
        }
    }

    pub fn record_crash(&mut self, now: Instant) -> CrashVerdict {
        self.poll(now);
        self.count += 1;
        if self.count > self.threshold {
            self.count = 0;
            self.reset_timer.stop();
            return CrashVerdict::TerminateContentProcesses;
        }
        // The window starts at the first crash of a streak.
        if !self.reset_timer.is_active() {
            self.reset_timer.start_one_shot(now, self.window);
        }
        CrashVerdict::Tolerated { count: self.count }
    }
}

impl Default for CrashWindow {
    fn default() -> Self {
        Self::new()
    }
}
