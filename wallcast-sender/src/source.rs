//! Synthetic frame producer.
//!
//! Stands in for an application: renders a test pattern into the
//! streamer's back buffer as fast as the streamer consumes frames. The
//! streamer paces itself, so the producer simply blocks on the buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use wallcast_core::{BlockFrame, DoubleBuffer};

/// What the producer draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    /// Diagonal ramp that scrolls one step per frame.
    #[default]
    Gradient,
    /// Whole frame one value, changing every frame.
    Solid,
}

impl Pattern {
    /// Draw frame number `frame` into `pixels` (rows of `stride` bytes,
    /// `bpp` bytes per unit).
    pub fn render(self, pixels: &mut [u8], stride: usize, bpp: usize, frame: u64) {
        match self {
            Pattern::Solid => pixels.fill(frame as u8),
            Pattern::Gradient => {
                let bpp = bpp.max(1);
                for (y, row) in pixels.chunks_mut(stride.max(1)).enumerate() {
                    for (i, byte) in row.iter_mut().enumerate() {
                        *byte = ((i / bpp) as u64 + y as u64 + frame) as u8;
                    }
                }
            }
        }
    }
}

/// Spawn the producer thread. It stops after `limit` frames (0 = never),
/// when `running` clears, or when the buffer shuts down.
pub fn spawn_producer(
    frames: Arc<DoubleBuffer<BlockFrame>>,
    pattern: Pattern,
    limit: u64,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<u64>> {
    thread::Builder::new()
        .name("producer".into())
        .spawn(move || {
            let mut produced = 0u64;
            while running.load(Ordering::SeqCst) && (limit == 0 || produced < limit) {
                let Ok(mut slot) = frames.acquire_write() else {
                    break;
                };
                let stride = slot.stride();
                let bpp = slot.format().bytes_per_pixel();
                produced += 1;
                pattern.render(slot.pixels_mut(), stride, bpp, produced);
                slot.release();
                debug!(frame = produced, "frame produced");
            }
            info!(frames = produced, "producer stopped");
            produced
        })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_scrolls_per_frame() {
        let mut px = vec![0u8; 2 * 6];
        Pattern::Gradient.render(&mut px, 6, 3, 0);
        assert_eq!(px, vec![0, 0, 0, 1, 1, 1, 1, 1, 1, 2, 2, 2]);
        Pattern::Gradient.render(&mut px, 6, 3, 1);
        assert_eq!(&px[..6], &[1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn solid_fills_everything() {
        let mut px = vec![0u8; 16];
        Pattern::Solid.render(&mut px, 4, 4, 258);
        assert!(px.iter().all(|&b| b == 2));
    }

    #[test]
    fn producer_stops_on_shutdown() {
        use wallcast_core::{BlockPartition, PixelFormat, Rect, RowOrder};

        let mut partition = BlockPartition::new(8, 8, 16, 16).unwrap();
        partition.init_block_table();
        let frames = Arc::new(
            DoubleBuffer::new(false, || {
                BlockFrame::new(
                    PixelFormat::Rgb8,
                    RowOrder::TopToBottom,
                    Rect::new(0, 0, 16, 16),
                    &partition,
                )
            })
            .unwrap(),
        );
        let running = Arc::new(AtomicBool::new(true));
        let handle =
            spawn_producer(Arc::clone(&frames), Pattern::Solid, 0, Arc::clone(&running)).unwrap();

        // Both slots fill up; the third write blocks until shutdown.
        let slot = frames.acquire_read().unwrap();
        assert!(slot.pixels().iter().all(|&b| b == 1));
        slot.release();
        frames.shutdown();
        assert!(handle.join().unwrap() >= 1);
    }

    #[test]
    fn producer_honours_frame_limit() {
        use wallcast_core::{BlockPartition, PixelFormat, Rect, RowOrder};

        let mut partition = BlockPartition::new(8, 8, 8, 8).unwrap();
        partition.init_block_table();
        let frames = Arc::new(
            DoubleBuffer::new(false, || {
                BlockFrame::new(
                    PixelFormat::Rgb8,
                    RowOrder::TopToBottom,
                    Rect::new(0, 0, 8, 8),
                    &partition,
                )
            })
            .unwrap(),
        );
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_producer(Arc::clone(&frames), Pattern::Solid, 2, running).unwrap();
        assert_eq!(handle.join().unwrap(), 2);
        assert!(frames.acquire_read().unwrap().pixels().iter().all(|&b| b == 1));
    }
}
