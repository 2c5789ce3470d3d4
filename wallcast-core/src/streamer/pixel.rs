//! Streamer fed by an application's frames.
//!
//! The application renders into the back slot of a [`DoubleBuffer`]; the
//! network thread takes the front slot, cuts it into blocks and fans them
//! out. Per iteration:
//!
//! 1. wait for a ready frame (blocking)
//! 2. apply queued messages, or the sync round's messages with `node_num > 1`
//! 3. pace to the frame rate (single node only)
//! 4. stream every block, then the END_FRAME markers, then flush
//! 5. release the slot
//!
//! Any error in step 2 or 4 ends the thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::bandwidth::{StatsSnapshot, StreamStats};
use crate::config::{BlockGeometry, NetworkConfig, StreamerConfig};
use crate::double_buffer::DoubleBuffer;
use crate::error::{Result, WallError};
use crate::flags::SendCondition;
use crate::frame::BlockFrame;
use crate::message::{ConnectionDescriptor, LayoutKind, StreamMessage};
use crate::partition::BlockPartition;
use crate::pool::BlockPool;
use crate::streamer::pacing::FramePacer;
use crate::streamer::sync::FrameSync;
use crate::streamer::{ControlQueue, StreamCore, apply_messages, resolve};
use crate::transport::StreamProtocol;

/// Everything built by `set_nw_config`, consumed by `init_networks`.
struct Prepared {
    nw: NetworkConfig,
    geometry: BlockGeometry,
    partition: BlockPartition,
}

/// Per-window network pump for application frames.
pub struct Streamer {
    config: StreamerConfig,
    prepared: Option<Prepared>,
    pool: Option<Arc<BlockPool>>,
    frames: Option<Arc<DoubleBuffer<BlockFrame>>>,
    queue: Arc<ControlQueue>,
    sync: Option<Arc<dyn FrameSync>>,
    running: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    thread: Option<JoinHandle<StreamCore>>,
}

impl Streamer {
    pub fn new(mut config: StreamerConfig) -> Self {
        config.normalize();
        Self {
            config,
            prepared: None,
            pool: None,
            frames: None,
            queue: Arc::new(ControlQueue::new()),
            sync: None,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StreamStats::default()),
            thread: None,
        }
    }

    /// Barrier shared with the other nodes streaming this image.
    pub fn with_sync(mut self, sync: Arc<dyn FrameSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Derive the block geometry and allocate the partition, the block
    /// pool and the frame buffer.
    pub fn set_nw_config(&mut self, nw: &NetworkConfig) -> Result<BlockGeometry> {
        let geometry = self.config.block_geometry(nw)?;
        let mut partition = BlockPartition::new(
            geometry.block_x,
            geometry.block_y,
            self.config.total_width,
            self.config.total_height,
        )?;
        partition.init_block_table();

        let pool = BlockPool::new(geometry.block_size, partition.total_block_num())?;
        let region = self.config.image_region();
        let (format, order) = (self.config.pixel_format, self.config.row_order);
        let frames = DoubleBuffer::new(self.config.async_update, || {
            BlockFrame::new(format, order, region, &partition)
        })?;
        info!(
            window = self.config.window_id,
            block_x = geometry.block_x,
            block_y = geometry.block_y,
            block_size = geometry.block_size,
            blocks = partition.total_block_num(),
            "streamer geometry"
        );

        self.pool = Some(Arc::new(pool));
        self.frames = Some(Arc::new(frames));
        self.prepared = Some(Prepared {
            nw: nw.clone(),
            geometry,
            partition,
        });
        Ok(geometry)
    }

    /// Where the application writes its frames.
    pub fn frame_buffer(&self) -> Option<Arc<DoubleBuffer<BlockFrame>>> {
        self.frames.clone()
    }

    /// Connect to every receiver and start the network thread.
    pub fn init_networks(
        &mut self,
        descriptor: &ConnectionDescriptor,
        mut transport: Box<dyn StreamProtocol>,
    ) -> Result<()> {
        let (Some(prepared), Some(pool), Some(frames)) =
            (self.prepared.take(), self.pool.clone(), self.frames.clone())
        else {
            return Err(WallError::Config("set_nw_config must run first".into()));
        };
        let geometry = prepared.geometry;
        transport.set_config(geometry.block_size, geometry.group_size, &prepared.nw)?;
        transport.set_frame_rate(self.config.frame_rate);
        transport.setup_block_pool(pool.clone());

        let registration = self.config.registration(&geometry);
        let mut node_ids = Vec::with_capacity(descriptor.receivers.len());
        for endpoint in &descriptor.receivers {
            let addr = resolve(endpoint, descriptor.base_port, transport.as_ref())?;
            transport.connect(addr, &registration)?;
            node_ids.push(endpoint.node_id);
        }

        let core = StreamCore::new(
            prepared.partition,
            transport,
            &node_ids,
            geometry.block_size,
            Arc::clone(&self.stats),
        );
        let ctx = LoopContext {
            frames,
            pool,
            queue: Arc::clone(&self.queue),
            sync: self.sync.clone(),
            running: Arc::clone(&self.running),
            node_num: self.config.node_num,
            rank: self.config.rank,
            frame_rate: self.config.frame_rate,
        };
        self.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name(format!("streamer-{}", self.config.window_id))
            .spawn(move || stream_loop(core, ctx))?;
        self.thread = Some(handle);
        info!(
            window = self.config.window_id,
            receivers = node_ids.len(),
            "streamer started"
        );
        Ok(())
    }

    /// Parse a reconfiguration line and queue it.
    pub fn enqueue_msg(&self, text: &str) -> Result<()> {
        self.store_stream_config(StreamMessage::parse(LayoutKind::Direct, text)?)
    }

    /// Queue a message for the next iteration; with several nodes it goes
    /// through the sync group so every node applies it at the same frame.
    pub fn store_stream_config(&self, message: StreamMessage) -> Result<()> {
        match &self.sync {
            Some(sync) if self.config.node_num > 1 => {
                sync.enqueue(message);
                Ok(())
            }
            _ => self.queue.push(message),
        }
    }

    /// Publish the last frame again so a queued message takes effect
    /// without new pixels (async mode).
    pub fn resend(&self) -> Result<bool> {
        match &self.frames {
            Some(frames) => frames.resend(),
            None => Err(WallError::Config("streamer has no frame buffer".into())),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the thread, then close the connections.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.close();
        if let Some(frames) = &self.frames {
            frames.shutdown();
        }
        if let Some(sync) = &self.sync {
            sync.leave(self.config.rank);
        }
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(mut core) => core.close_all(),
                Err(_) => error!(window = self.config.window_id, "streamer thread panicked"),
            }
            info!(window = self.config.window_id, "streamer stopped");
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Network thread ───────────────────────────────────────────────

struct LoopContext {
    frames: Arc<DoubleBuffer<BlockFrame>>,
    pool: Arc<BlockPool>,
    queue: Arc<ControlQueue>,
    sync: Option<Arc<dyn FrameSync>>,
    running: Arc<AtomicBool>,
    node_num: u32,
    rank: u32,
    frame_rate: f64,
}

fn stream_loop(mut core: StreamCore, ctx: LoopContext) -> StreamCore {
    let mut pacer = FramePacer::new(ctx.frame_rate);
    let mut idle_warned = false;

    while ctx.running.load(Ordering::SeqCst) {
        let Ok(mut slot) = ctx.frames.acquire_read() else {
            break;
        };

        let mut messages = ctx.queue.drain();
        if ctx.node_num > 1 {
            if let Some(sync) = &ctx.sync {
                let Some(round) = sync.sync_frame(ctx.rank, core.frame_id()) else {
                    break;
                };
                core.set_frame_id(round.frame_id.max(core.frame_id()));
                messages.extend(round.messages);
            }
        }
        if let Err(e) = apply_messages(&mut core, Some(&mut pacer), messages) {
            error!("reconfiguration failed: {e}");
            break;
        }

        if ctx.node_num == 1 {
            pacer.check_interval();
        }

        if core.stream_num() == 0 {
            if !idle_warned {
                warn!("no receiver covers the image; frames are dropped");
                idle_warned = true;
            }
            continue;
        }
        idle_warned = false;

        if let Err(e) = stream_pixel_data(&mut core, &mut slot, &ctx.pool) {
            error!(frame_id = core.frame_id(), "streaming failed: {e}");
            break;
        }
        slot.release();
    }

    ctx.running.store(false, Ordering::SeqCst);
    ctx.frames.shutdown();
    if let Some(sync) = &ctx.sync {
        sync.leave(ctx.rank);
    }
    core
}

/// Send every block of `frame`, then finish the frame.
fn stream_pixel_data(core: &mut StreamCore, frame: &mut BlockFrame, pool: &BlockPool) -> Result<usize> {
    frame.reset_block_index();
    loop {
        let mut block = pool.take()?;
        match frame.extract_pixel_block(&mut block) {
            Ok(true) => {
                core.send_pixel_block(block, pool)?;
            }
            Ok(false) => {
                pool.push_back(block);
                break;
            }
            Err(e) => {
                pool.push_back(block);
                return Err(e);
            }
        }
    }
    core.finish_frame(SendCondition::All)
}

// ── Tests ────────────────────────────────────────────────────────
