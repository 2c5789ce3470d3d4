//! Stand-in for the rendering side: drains completed frames from the ring.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use wallcast_core::{BlockBuf, BlockFlag};

/// Reader id of the local consumer.
pub const CONSUMER_READER: u32 = 0;

/// What the consumer saw before the ring was released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub frames: u64,
    pub blocks: u64,
    pub layouts: u64,
    pub last_frame: u64,
}

/// Walk the ring until it is released, counting frames and blocks.
pub fn consume(ring: &BlockBuf) -> ConsumerStats {
    let mut stats = ConsumerStats::default();
    let mut frame_blocks = 0u64;
    while let Some(group) = ring.wait_front(CONSUMER_READER) {
        match group.flag() {
            BlockFlag::PixelData => frame_blocks += group.len() as u64,
            BlockFlag::EndFrame => {
                debug!(frame_id = group.frame_id(), blocks = frame_blocks, "frame complete");
                stats.frames += 1;
                stats.blocks += frame_blocks;
                stats.last_frame = group.frame_id();
                frame_blocks = 0;
            }
            BlockFlag::ConfigUpdate => {
                info!(
                    frame_id = group.frame_id(),
                    config_id = group.config_id(),
                    "display layout changed"
                );
                stats.layouts += 1;
            }
            BlockFlag::Control => {}
        }
        drop(group);
        ring.next(CONSUMER_READER);
    }
    stats
}

pub fn spawn_consumer(ring: Arc<BlockBuf>) -> std::io::Result<JoinHandle<ConsumerStats>> {
    thread::Builder::new()
        .name("consumer".into())
        .spawn(move || consume(&ring))
}

// ── Tests ────────────────────────────────────────────────────────
