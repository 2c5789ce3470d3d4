//! Sender side: per-window network pumps.
//!
//! Both streamer flavours own one dedicated network thread that drives a
//! [`StreamCore`]:
//!
//! ```text
//!   control thread ──enqueue──▶ ControlQueue ─┐
//!                                             ▼   (once per iteration)
//!   producer ──▶ DoubleBuffer ──▶ Streamer thread ──▶ StreamCore ──▶ transport
//!   receiver ──▶ BlockBuf ─────▶ BridgeStreamer thread ─┘
//! ```
//!
//! The core holds the partition, the transport and the per-receiver state;
//! it is only ever touched by its network thread, so none of it is locked.

pub mod bridge;
pub mod pacing;
pub mod pixel;
pub mod sync;

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::bandwidth::StreamStats;
use crate::error::{Result, WallError};
use crate::flags::SendCondition;
use crate::message::{ReceiverEndpoint, StreamLayout, StreamMessage};
use crate::partition::BlockPartition;
use crate::pool::{BlockPool, PixelBlock, SharedBlock};
use crate::transport::StreamProtocol;

pub use bridge::BridgeStreamer;
pub use pacing::FramePacer;
pub use pixel::Streamer;
pub use sync::{FrameSync, SyncGroup, SyncMessage};

// ── ReceiverParam ────────────────────────────────────────────────

/// Per-connection state of a streamer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverParam {
    /// Receiver id used by layout messages.
    pub node_id: u32,
    /// Got at least one pixel block since the last reconfiguration.
    pub active: bool,
    /// Blocks mapped to this receiver under the current layout.
    pub blocks: usize,
}

// ── StreamCore ───────────────────────────────────────────────────

/// Partition, transport and fan-out bookkeeping of one streamer.
pub struct StreamCore {
    partition: BlockPartition,
    transport: Box<dyn StreamProtocol>,
    params: Vec<ReceiverParam>,
    block_size: usize,
    frame_id: u64,
    config_id: u32,
    stream_num: usize,
    stats: Arc<StreamStats>,
}

impl StreamCore {
    /// `node_ids[j]` is the layout id of transport receiver `j`.
    pub fn new(
        mut partition: BlockPartition,
        transport: Box<dyn StreamProtocol>,
        node_ids: &[u32],
        block_size: usize,
        stats: Arc<StreamStats>,
    ) -> Self {
        if !partition.is_initialized() {
            partition.init_block_table();
        }
        Self {
            partition,
            transport,
            params: node_ids
                .iter()
                .map(|&node_id| ReceiverParam {
                    node_id,
                    active: false,
                    blocks: 0,
                })
                .collect(),
            block_size,
            frame_id: 1,
            config_id: 0,
            stream_num: 0,
            stats,
        }
    }

    pub fn partition(&self) -> &BlockPartition {
        &self.partition
    }

    pub fn params(&self) -> &[ReceiverParam] {
        &self.params
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn set_frame_id(&mut self, frame_id: u64) {
        self.frame_id = frame_id;
    }

    pub fn config_id(&self) -> u32 {
        self.config_id
    }

    /// Receivers with at least one block under the current layout.
    pub fn stream_num(&self) -> usize {
        self.stream_num
    }

    pub fn transport_mut(&mut self) -> &mut dyn StreamProtocol {
        self.transport.as_mut()
    }

    /// Hand the transport back, e.g. to close it after the thread ended.
    pub fn into_transport(self) -> Box<dyn StreamProtocol> {
        self.transport
    }

    /// Rebuild the partition from scratch for a new layout.
    pub fn reconfigure(&mut self, layout: &StreamLayout) -> Result<()> {
        self.partition.clear_block_table();
        for param in &mut self.params {
            param.active = false;
            param.blocks = 0;
        }

        for (j, param) in self.params.iter().enumerate() {
            match layout {
                StreamLayout::Direct(list) => {
                    for a in list.iter().filter(|a| a.receiver_id == param.node_id) {
                        self.partition.set_stream_rect(j, a.rect)?;
                    }
                }
                StreamLayout::Bridge(list) => {
                    for a in list.iter().filter(|a| a.receiver_id == param.node_id) {
                        self.partition
                            .set_stream_range(j, a.first_block, a.last_block)?;
                    }
                }
            }
        }
        self.partition.seal();
        self.warn_unknown_receivers(layout);

        self.stream_num = 0;
        for (j, param) in self.params.iter_mut().enumerate() {
            param.blocks = self.partition.receiver_block_count(j);
            if param.blocks > 0 {
                self.stream_num += 1;
            }
            self.transport
                .set_frame_size(j, param.blocks.max(1) * self.block_size);
        }
        self.config_id += 1;
        info!(
            config_id = self.config_id,
            streams = self.stream_num,
            frame_id = self.frame_id,
            "streams reconfigured"
        );
        Ok(())
    }

    fn warn_unknown_receivers(&self, layout: &StreamLayout) {
        let ids: Vec<u32> = match layout {
            StreamLayout::Direct(list) => list.iter().map(|a| a.receiver_id).collect(),
            StreamLayout::Bridge(list) => list.iter().map(|a| a.receiver_id).collect(),
        };
        for id in ids {
            if !self.params.iter().any(|p| p.node_id == id) {
                warn!(receiver = id, "layout names a receiver that is not connected");
            }
        }
    }

    pub fn set_frame_rate(&mut self, frame_rate: f64) {
        self.transport.set_frame_rate(frame_rate);
    }

    /// Stamp a pool block with the current frame and fan it out.
    ///
    /// Off-screen blocks go straight back to `pool`.
    pub fn send_pixel_block(&mut self, mut block: PixelBlock, pool: &BlockPool) -> Result<usize> {
        let targets = match self.partition.block_map(block.header().block_id) {
            Ok(targets) => targets,
            Err(e) => {
                pool.push_back(block);
                return Err(e);
            }
        };
        let Some((&last, rest)) = targets.split_last() else {
            pool.push_back(block);
            return Ok(0);
        };
        block.set_frame_id(self.frame_id);
        block.update_buffer_header()?;
        block.reference(targets.len() as u32);

        let shared = Arc::new(block);
        let mut sent = 0;
        for &rcv in rest {
            sent += self
                .transport
                .send_grp(rcv, Arc::clone(&shared), self.config_id)?;
            self.params[rcv].active = true;
        }
        sent += self.transport.send_grp(last, shared, self.config_id)?;
        self.params[last].active = true;
        Ok(sent)
    }

    /// Fan out a block received from upstream; its header is sent as is.
    pub fn send_shared_block(&mut self, block: &SharedBlock) -> Result<usize> {
        let targets = self.partition.block_map(block.header().block_id)?;
        if targets.is_empty() {
            return Ok(0);
        }
        block.reference(targets.len() as u32);
        let mut sent = 0;
        for &rcv in targets {
            sent += self
                .transport
                .send_grp(rcv, Arc::clone(block), self.config_id)?;
            self.params[rcv].active = true;
        }
        Ok(sent)
    }

    /// Send the trailing END_FRAME to every receiver matching `condition`,
    /// flush all connections and move to the next frame.
    pub fn finish_frame(&mut self, condition: SendCondition) -> Result<usize> {
        let mut sent = 0;
        for j in 0..self.params.len() {
            if condition.includes(self.params[j].active) {
                sent += self
                    .transport
                    .send_control(j, self.frame_id, self.config_id)?;
            }
            sent += self.transport.flush(j, self.config_id)?;
        }
        self.stats.record_bytes(sent);
        self.stats.record_frame();
        debug!(frame_id = self.frame_id, bytes = sent, "frame sent");
        self.frame_id += 1;
        Ok(sent)
    }

    pub fn close_all(&mut self) {
        self.transport.close_all();
    }
}

/// Resolve a descriptor entry to the address its stream connects to.
pub(crate) fn resolve(
    endpoint: &ReceiverEndpoint,
    base_port: u16,
    transport: &dyn StreamProtocol,
) -> Result<SocketAddr> {
    let port = endpoint.port(base_port, transport.protocol());
    (endpoint.ip.as_str(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| WallError::Config(format!("{} does not resolve", endpoint.ip)))
}

// ── ControlQueue ─────────────────────────────────────────────────

#[derive(Default)]
struct QueueState {
    messages: VecDeque<StreamMessage>,
    closed: bool,
}

/// Messages waiting for a streamer's next loop iteration.
///
/// The lock is only held for a push or a drain, never across network I/O.
#[derive(Default)]
pub struct ControlQueue {
    state: Mutex<QueueState>,
}

impl ControlQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, message: StreamMessage) -> Result<()> {
        let mut st = self.lock();
        if st.closed {
            return Err(WallError::Shutdown);
        }
        st.messages.push_back(message);
        Ok(())
    }

    /// Everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<StreamMessage> {
        self.lock().messages.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further messages.
    pub fn close(&self) {
        self.lock().closed = true;
    }
}

/// Apply drained messages to a core at an iteration boundary.
pub(crate) fn apply_messages(
    core: &mut StreamCore,
    mut pacer: Option<&mut FramePacer>,
    messages: Vec<StreamMessage>,
) -> Result<()> {
    for message in messages {
        match message {
            StreamMessage::Reconfigure(layout) => core.reconfigure(&layout)?,
            StreamMessage::FrameRate(fps) => {
                info!(fps, "frame rate changed");
                core.set_frame_rate(fps);
                if let Some(p) = pacer.as_deref_mut() {
                    p.set_frame_rate(fps);
                }
            }
        }
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
