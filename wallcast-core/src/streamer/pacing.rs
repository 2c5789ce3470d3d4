//! Frame pacing for single-node streamers.
//!
//! Sleeps in small steps until the frame interval has elapsed, tolerating
//! a drift of [`MAX_INTERVAL_ERROR`] of the interval. The drift carried
//! from one frame into the next is dropped once it exceeds that bound, so
//! a stall never turns into a burst of catch-up frames.

use std::thread;
use std::time::{Duration, Instant};

/// Permitted timing error as a fraction of the frame interval.
pub const MAX_INTERVAL_ERROR: f64 = 0.05;

const SLEEP_STEP: Duration = Duration::from_micros(500);

pub struct FramePacer {
    interval: Duration,
    last: Instant,
    /// Seconds; negative when the previous frame went out early.
    time_error: f64,
}

impl FramePacer {
    pub fn new(frame_rate: f64) -> Self {
        let mut pacer = Self {
            interval: Duration::ZERO,
            last: Instant::now(),
            time_error: 0.0,
        };
        pacer.set_frame_rate(frame_rate);
        pacer
    }

    pub fn set_frame_rate(&mut self, frame_rate: f64) {
        self.interval = if frame_rate.is_finite() && frame_rate > 0.0 {
            Duration::from_secs_f64(1.0 / frame_rate)
        } else {
            Duration::ZERO
        };
        self.time_error = 0.0;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until the next frame is due. Returns how long it slept.
    pub fn check_interval(&mut self) -> Duration {
        let interval = self.interval.as_secs_f64();
        let max_err = interval * MAX_INTERVAL_ERROR;
        let error = |last: Instant, carried: f64| last.elapsed().as_secs_f64() - interval + carried;

        // Bounded by the number of steps one interval holds.
        let max_steps = (interval / SLEEP_STEP.as_secs_f64()).ceil() as u32 + 1;
        let mut slept = Duration::ZERO;
        let mut err = error(self.last, self.time_error);
        let mut steps = 0;
        while err < -max_err && steps < max_steps {
            thread::sleep(SLEEP_STEP);
            slept += SLEEP_STEP;
            steps += 1;
            err = error(self.last, self.time_error);
        }

        self.time_error = if err > max_err { 0.0 } else { err };
        self.last = Instant::now();
        slept
    }
}
