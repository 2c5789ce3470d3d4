//! Throughput accounting for streamers.
//!
//! [`BandwidthEstimator`] keeps `(timestamp, bytes)` samples over a rolling
//! window; [`StreamStats`] wraps it with frame and byte counters that the
//! network thread updates and any other thread can snapshot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Rolling-window bandwidth estimator.
pub struct BandwidthEstimator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    total_bytes: u64,
}

impl BandwidthEstimator {
    /// Estimator over a 1-second window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(256),
            window,
            total_bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    /// Record with an explicit timestamp (useful for testing).
    pub fn record_at(&mut self, when: Instant, bytes: u64) {
        self.samples.push_back((when, bytes));
        self.total_bytes += bytes;
        self.evict(when);
    }

    /// Bytes/second over the samples still in the window.
    pub fn estimate_bps(&self) -> u64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        let elapsed = last.duration_since(*first).max(Duration::from_millis(1));
        (self.total_bytes as f64 / elapsed.as_secs_f64()) as u64
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, bytes)) = self.samples.front() {
            if now.duration_since(ts) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.total_bytes = self.total_bytes.saturating_sub(bytes);
        }
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ── StreamStats ──────────────────────────────────────────────────

/// Point-in-time copy of a streamer's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub bytes: u64,
    pub bandwidth_bps: u64,
}

/// Counters shared between a network thread and its owner.
#[derive(Default)]
pub struct StreamStats {
    frames: AtomicU64,
    bytes: AtomicU64,
    estimator: Mutex<BandwidthEstimator>,
}

impl StreamStats {
    pub fn record_bytes(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.estimator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(bytes as u64);
    }

    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            bandwidth_bps: self
                .estimator
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .estimate_bps(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
