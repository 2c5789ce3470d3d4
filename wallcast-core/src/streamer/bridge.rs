//! Relay streamer: forwards pre-cut blocks from a [`BlockBuf`].
//!
//! A receiver fills the ring with groups from an upstream sender; each
//! bridge streamer reads it with its own cursor and re-partitions the
//! blocks by id for its downstream receivers. Blocks are forwarded as
//! shared handles, never copied, and go back to the ring once every
//! downstream copy is on the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::bandwidth::{StatsSnapshot, StreamStats};
use crate::config::{BlockGeometry, NetworkConfig, StreamerConfig};
use crate::error::{Result, WallError};
use crate::flags::{BlockFlag, SendCondition};
use crate::message::{ConnectionDescriptor, LayoutKind, StreamMessage};
use crate::partition::BlockPartition;
use crate::pool::{BlockBuf, ReaderStart};
use crate::streamer::sync::FrameSync;
use crate::streamer::{ControlQueue, StreamCore, apply_messages, resolve};
use crate::transport::StreamProtocol;

/// Network pump relaying one upstream image.
pub struct BridgeStreamer {
    config: StreamerConfig,
    ring: Arc<BlockBuf>,
    reader: u32,
    prepared: Option<(NetworkConfig, BlockGeometry)>,
    queue: Arc<ControlQueue>,
    sync: Option<Arc<dyn FrameSync>>,
    running: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    thread: Option<JoinHandle<StreamCore>>,
}

impl BridgeStreamer {
    /// Attach to `ring` as reader `reader`, starting at the next frame.
    pub fn new(mut config: StreamerConfig, ring: Arc<BlockBuf>, reader: u32) -> Result<Self> {
        config.normalize();
        ring.add_reader(reader, ReaderStart::NextFrame)?;
        Ok(Self {
            config,
            ring,
            reader,
            prepared: None,
            queue: Arc::new(ControlQueue::new()),
            sync: None,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StreamStats::default()),
            thread: None,
        })
    }

    /// Frame barrier shared with the other relays covering this wall.
    pub fn with_sync(mut self, sync: Arc<dyn FrameSync>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Blocks keep the upstream geometry; only the group size is local.
    pub fn set_nw_config(&mut self, nw: &NetworkConfig) -> Result<BlockGeometry> {
        let block_size = self.ring.block_size();
        let geometry = BlockGeometry {
            block_x: self.config.block_x,
            block_y: self.config.block_y,
            block_size,
            group_size: self.config.group_size.max(block_size),
        };
        self.prepared = Some((nw.clone(), geometry));
        Ok(geometry)
    }

    pub fn init_networks(
        &mut self,
        descriptor: &ConnectionDescriptor,
        mut transport: Box<dyn StreamProtocol>,
    ) -> Result<()> {
        let Some((nw, geometry)) = self.prepared.take() else {
            return Err(WallError::Config("set_nw_config must run first".into()));
        };
        let mut partition = BlockPartition::new(
            geometry.block_x,
            geometry.block_y,
            self.config.total_width,
            self.config.total_height,
        )?;
        partition.init_block_table();

        transport.set_config(geometry.block_size, geometry.group_size, &nw)?;
        transport.set_frame_rate(self.config.frame_rate);
        transport.setup_block_pool(self.ring.clone());

        let registration = self.config.registration(&geometry);
        let mut node_ids = Vec::with_capacity(descriptor.receivers.len());
        for endpoint in &descriptor.receivers {
            let addr = resolve(endpoint, descriptor.base_port, transport.as_ref())?;
            transport.connect(addr, &registration)?;
            node_ids.push(endpoint.node_id);
        }

        let core = StreamCore::new(
            partition,
            transport,
            &node_ids,
            geometry.block_size,
            Arc::clone(&self.stats),
        );
        let ctx = RelayContext {
            ring: Arc::clone(&self.ring),
            reader: self.reader,
            queue: Arc::clone(&self.queue),
            sync: self.sync.clone().filter(|_| self.config.node_num > 1),
            rank: self.config.rank,
            running: Arc::clone(&self.running),
            parallel: self.config.from_bridge_parallel,
        };
        self.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name(format!("bridge-{}", self.config.window_id))
            .spawn(move || relay_loop(core, ctx))?;
        self.thread = Some(handle);
        info!(
            window = self.config.window_id,
            reader = self.reader,
            receivers = node_ids.len(),
            "bridge streamer started"
        );
        Ok(())
    }

    /// Parse a block-range layout line and queue it.
    pub fn enqueue_msg(&self, text: &str) -> Result<()> {
        self.store_stream_config(StreamMessage::parse(LayoutKind::Bridge, text)?)
    }

    pub fn store_stream_config(&self, message: StreamMessage) -> Result<()> {
        match &self.sync {
            Some(sync) if self.config.node_num > 1 => {
                sync.enqueue(message);
                Ok(())
            }
            _ => self.queue.push(message),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.close();
        self.ring.remove_reader(self.reader);
        if let Some(sync) = &self.sync {
            sync.leave(self.config.rank);
        }
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(mut core) => core.close_all(),
                Err(_) => error!(window = self.config.window_id, "bridge thread panicked"),
            }
            info!(window = self.config.window_id, "bridge streamer stopped");
        }
    }
}

impl Drop for BridgeStreamer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Relay thread ─────────────────────────────────────────────────

struct RelayContext {
    ring: Arc<BlockBuf>,
    reader: u32,
    queue: Arc<ControlQueue>,
    /// Only set with more than one node.
    sync: Option<Arc<dyn FrameSync>>,
    rank: u32,
    running: Arc<AtomicBool>,
    parallel: bool,
}

fn relay_loop(mut core: StreamCore, ctx: RelayContext) -> StreamCore {
    while ctx.running.load(Ordering::SeqCst) {
        let mut messages = ctx.queue.drain();
        if let Some(sync) = &ctx.sync {
            let Some(round) = sync.sync_frame(ctx.rank, core.frame_id()) else {
                break;
            };
            core.set_frame_id(round.frame_id.max(core.frame_id()));
            messages.extend(round.messages);
        }
        if let Err(e) = apply_messages(&mut core, None, messages) {
            error!("reconfiguration failed: {e}");
            break;
        }
        match relay_frame(&mut core, &ctx) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                error!(frame_id = core.frame_id(), "relay failed: {e}");
                break;
            }
        }
    }
    ctx.running.store(false, Ordering::SeqCst);
    ctx.ring.remove_reader(ctx.reader);
    if let Some(sync) = &ctx.sync {
        sync.leave(ctx.rank);
    }
    core
}

/// Forward one upstream frame. `Ok(false)` once the ring is gone.
///
/// A frame ends at its END_FRAME marker, or, for a single upstream sender,
/// as soon as every block of the image went by. Groups of frames older
/// than the current one are skipped.
fn relay_frame(core: &mut StreamCore, ctx: &RelayContext) -> Result<bool> {
    let total = core.partition().total_block_num();
    let mut frame = core.frame_id();
    let mut count = 0;
    loop {
        let Some(group) = ctx.ring.front_from(ctx.reader, core.frame_id()) else {
            return Ok(false);
        };
        match group.flag() {
            BlockFlag::PixelData => {
                frame = group.frame_id();
                if core.stream_num() > 0 {
                    for block in group.blocks() {
                        core.send_shared_block(block)?;
                    }
                }
                count += group.len();
                ctx.ring.next(ctx.reader);
                if !ctx.parallel && count >= total {
                    break;
                }
            }
            BlockFlag::EndFrame => {
                ctx.ring.next(ctx.reader);
                if count > 0 {
                    frame = group.frame_id();
                    break;
                }
            }
            flag => {
                debug!(?flag, "skipping control group");
                ctx.ring.next(ctx.reader);
            }
        }
    }

    core.set_frame_id(frame);
    if core.stream_num() == 0 {
        core.set_frame_id(frame + 1);
        return Ok(true);
    }
    core.finish_frame(SendCondition::All)?;
    Ok(true)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{BLOCK_HEADER_SIZE, GroupHeader};
    use crate::streamer::tests::{Record, RecordingTransport};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    const BLOCK: usize = BLOCK_HEADER_SIZE + 4 * 4 * 3;

    fn config(parallel: bool) -> StreamerConfig {
        // 4 x 2 blocks of 4 x 4 pixels.
        StreamerConfig {
            total_width: 16,
            total_height: 8,
            block_x: 4,
            block_y: 4,
            from_bridge_parallel: parallel,
            ..StreamerConfig::default()
        }
    }

    fn ring() -> Arc<BlockBuf> {
        Arc::new(BlockBuf::new(BLOCK, 2 * BLOCK, 64 * BLOCK, true).unwrap())
    }

    fn push_blocks(ring: &BlockBuf, frame_id: u64, ids: &[u32]) {
        for chunk in ids.chunks(ring.group_blocks()) {
            let mut g = ring.get_free_group().unwrap();
            for (i, &id) in chunk.iter().enumerate() {
                let b = g.block_mut(i).unwrap();
                b.set_block_id(id);
                b.set_frame_id(frame_id);
                b.update_buffer_header().unwrap();
            }
            g.apply_header(&GroupHeader {
                block_count: chunk.len(),
                flag: BlockFlag::PixelData,
                frame_id,
                config_id: 1,
            })
            .unwrap();
            ring.push_back(g).unwrap();
        }
    }

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::parse("20000 2 127.0.0.1 0 127.0.0.1 1", false).unwrap()
    }

    fn start(parallel: bool, ring: &Arc<BlockBuf>) -> (BridgeStreamer, Arc<Mutex<Vec<Record>>>) {
        let mut bridge = BridgeStreamer::new(config(parallel), Arc::clone(ring), 1).unwrap();
        let geo = bridge.set_nw_config(&NetworkConfig::default()).unwrap();
        assert_eq!(geo.block_size, BLOCK);
        let (transport, log) = RecordingTransport::new(0);
        bridge.enqueue_msg("2 0 0 3 1 2 7").unwrap();
        bridge.init_networks(&descriptor(), Box::new(transport)).unwrap();
        (bridge, log)
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn relays_blocks_by_range() {
        let ring = ring();
        let (mut bridge, log) = start(true, &ring);
        // The reader starts after the next END_FRAME.
        ring.finish_frame(0, 1).unwrap();
        push_blocks(&ring, 1, &[0, 1, 2, 3, 4, 5, 6, 7]);
        ring.finish_frame(1, 1).unwrap();
        wait_until(|| bridge.stats().frames == 1);
        bridge.shutdown();

        let log = log.lock().unwrap();
        let ids = |r: usize| log[r].blocks.iter().map(|b| b.0).collect::<Vec<_>>();
        assert_eq!(ids(0), vec![0, 1, 2, 3]);
        assert_eq!(ids(1), vec![2, 3, 4, 5, 6, 7]);
        assert!(log[0].blocks.iter().all(|&(_, f, c)| f == 1 && c == 1));
        assert_eq!(log[0].controls, vec![(1, 1)]);
        assert_eq!(log[1].controls, vec![(1, 1)]);
    }

    #[test]
    fn single_upstream_frame_ends_after_all_blocks() {
        let ring = ring();
        let (mut bridge, log) = start(false, &ring);
        ring.finish_frame(0, 1).unwrap();
        push_blocks(&ring, 4, &[0, 1, 2, 3, 4, 5, 6, 7]);
        // No END_FRAME yet: the full block count completes the frame.
        wait_until(|| bridge.stats().frames == 1);
        ring.finish_frame(4, 1).unwrap();
        push_blocks(&ring, 5, &[0, 1, 2, 3, 4, 5, 6, 7]);
        wait_until(|| bridge.stats().frames == 2);
        bridge.shutdown();

        let log = log.lock().unwrap();
        assert_eq!(log[0].controls, vec![(4, 1), (5, 1)]);
        assert_eq!(log[0].blocks.len(), 8);
    }

    #[test]
    fn forwarded_blocks_return_to_the_ring() {
        let ring = ring();
        let (mut bridge, _log) = start(true, &ring);
        let free = ring.status().free;
        ring.finish_frame(0, 1).unwrap();
        for frame in 1..=10 {
            push_blocks(&ring, frame, &[0, 1, 2, 3, 4, 5, 6, 7]);
            ring.finish_frame(frame, 1).unwrap();
            wait_until(|| bridge.stats().frames == frame);
        }
        bridge.shutdown();
        // Every group the relay touched can be handed out again.
        let groups: Vec<_> = (0..free).map(|_| ring.get_free_group().unwrap()).collect();
        assert_eq!(groups.len(), free);
    }

    #[test]
    fn shutdown_detaches_the_reader() {
        let ring = ring();
        let (mut bridge, _log) = start(true, &ring);
        assert_eq!(ring.status().readers, 1);
        bridge.shutdown();
        assert!(!bridge.is_running());
        assert_eq!(ring.status().readers, 0);
    }

    #[test]
    fn synced_relays_share_reconfiguration() {
        let sync = Arc::new(crate::streamer::SyncGroup::new([0, 1]));
        let mut relays = Vec::new();
        for rank in 0..2 {
            let ring = ring();
            let cfg = StreamerConfig {
                node_num: 2,
                rank,
                ..config(true)
            };
            let mut bridge = BridgeStreamer::new(cfg, Arc::clone(&ring), 1)
                .unwrap()
                .with_sync(sync.clone());
            bridge.set_nw_config(&NetworkConfig::default()).unwrap();
            let (transport, log) = RecordingTransport::new(0);
            bridge.init_networks(&descriptor(), Box::new(transport)).unwrap();
            relays.push((bridge, ring, log));
        }
        // Queued on one relay, applied by both at the same round.
        relays[0].0.enqueue_msg("1 0 0 7").unwrap();
        for (_, ring, _) in &relays {
            ring.finish_frame(0, 1).unwrap();
            push_blocks(ring, 1, &[0, 1, 2, 3, 4, 5, 6, 7]);
            ring.finish_frame(1, 1).unwrap();
            push_blocks(ring, 2, &[0, 1, 2, 3, 4, 5, 6, 7]);
            ring.finish_frame(2, 1).unwrap();
        }
        for (bridge, _, _) in &relays {
            wait_until(|| bridge.stats().frames >= 1);
        }
        for (bridge, _, log) in &mut relays {
            bridge.shutdown();
            let log = log.lock().unwrap();
            assert!(!log[0].blocks.is_empty());
            assert!(log[1].blocks.is_empty());
        }
    }

    #[test]
    fn single_reader_ring_is_rejected() {
        let ring = Arc::new(BlockBuf::new(BLOCK, BLOCK, 8 * BLOCK, false).unwrap());
        assert!(BridgeStreamer::new(config(false), ring, 1).is_err());
    }
}
