//! Frame assembly across independent sender streams.
//!
//! Senders deliver their share of each frame on their own sockets, with no
//! ordering between them. The assembler re-imposes a single frame boundary:
//!
//! ```text
//!   sender 0   P5 P5 E5 │ P6 …
//!   sender 1   P5 E5    │ P6 …        ring:  P5 P5 P5 E5 P6 P6 …
//!   sender 2   P5 E5 P6 │ (stashed)
//! ```
//!
//! Groups of the current frame go straight into the ring. A group of a
//! later frame is stashed and its sender paused until every sender has
//! caught up; the current frame is then closed with exactly one END_FRAME
//! and the stashed groups follow. Groups older than the current frame are
//! discarded.
//!
//! Any group with a newer config id, pixel or marker, is preceded in the
//! ring by one CONFIG_UPDATE.

use tracing::debug;

use crate::error::{Result, WallError};
use crate::flags::BlockFlag;
use crate::pool::{BlockBuf, BlockGroup};

#[derive(Debug, Default)]
struct SenderState {
    /// Frame the sender is working on; 0 until it reported anything.
    frame: u64,
    /// First group of a frame the others have not reached yet.
    stashed: Option<BlockGroup>,
    paused: bool,
}

/// Per-receiver frame assembly state; owned by the reader thread.
#[derive(Debug)]
pub struct FrameAssembler {
    senders: Vec<SenderState>,
    cur_frame: u64,
    config_id: u32,
    updated: bool,
}

impl FrameAssembler {
    pub fn new(senders: usize) -> Self {
        Self {
            senders: (0..senders).map(|_| SenderState::default()).collect(),
            cur_frame: 0,
            config_id: 0,
            updated: false,
        }
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// Frame currently being assembled; 0 before the first group.
    pub fn cur_frame(&self) -> u64 {
        self.cur_frame
    }

    pub fn config_id(&self) -> u32 {
        self.config_id
    }

    /// Paused senders are left out of the poll set.
    pub fn is_paused(&self, sender: usize) -> bool {
        self.senders.get(sender).is_some_and(|s| s.paused)
    }

    /// Route a received group. Returns whether the ring's consumer was
    /// waiting for data when something was pushed.
    ///
    /// Fails with [`WallError::OutOfOrder`] for groups of an already
    /// completed frame; the group is recycled.
    pub fn on_group(&mut self, sender: usize, group: BlockGroup, ring: &BlockBuf) -> Result<bool> {
        if sender >= self.senders.len() {
            ring.recycle(group);
            return Err(WallError::UnknownReceiver(sender));
        }
        let frame = group.frame_id();
        if self.cur_frame == 0 {
            self.cur_frame = frame;
        }
        if frame < self.cur_frame {
            ring.recycle(group);
            return Err(WallError::OutOfOrder {
                frame_id: frame,
                current: self.cur_frame,
            });
        }

        let mut waiting = false;
        match group.flag() {
            BlockFlag::PixelData if frame == self.cur_frame => {
                self.senders[sender].frame = frame;
                waiting |= self.push_pixels(group, ring)?;
            }
            BlockFlag::PixelData => {
                let state = &mut self.senders[sender];
                state.frame = frame;
                state.paused = true;
                if let Some(old) = state.stashed.replace(group) {
                    ring.recycle(old);
                }
            }
            BlockFlag::EndFrame => {
                let state = &mut self.senders[sender];
                state.frame = state.frame.max(frame + 1);
                state.paused = true;
                waiting |= self.on_marker(sender, group, ring)?;
            }
            flag => {
                debug!(sender, ?flag, frame_id = frame, "control group");
                waiting |= self.on_marker(sender, group, ring)?;
            }
        }
        waiting |= self.advance(ring)?;
        Ok(waiting)
    }

    /// A control group carrying a newer config id still has to reach the
    /// consumer: a receiver the layout moved the application off gets no
    /// pixel data, only markers, and must clear its stale tile.
    ///
    /// The CONFIG_UPDATE is queued now for the current frame, or held
    /// with the sender until its frame becomes current.
    fn on_marker(&mut self, sender: usize, group: BlockGroup, ring: &BlockBuf) -> Result<bool> {
        let frame = group.frame_id();
        let config_id = group.config_id();
        ring.recycle(group);
        if config_id <= self.config_id {
            return Ok(false);
        }
        self.config_id = config_id;
        debug!(config_id, frame_id = frame, "layout changed without pixel data");
        let update = BlockGroup::control(BlockFlag::ConfigUpdate, frame, config_id);
        if frame == self.cur_frame {
            return ring.push_back(update);
        }
        if let Some(old) = self.senders[sender].stashed.replace(update) {
            ring.recycle(old);
        }
        Ok(false)
    }

    /// Queue a pixel group of the current frame, announcing a new layout
    /// first if its config id is newer.
    fn push_pixels(&mut self, group: BlockGroup, ring: &BlockBuf) -> Result<bool> {
        let mut waiting = false;
        if group.config_id() > self.config_id {
            self.config_id = group.config_id();
            debug!(
                config_id = self.config_id,
                frame_id = self.cur_frame,
                "layout changed"
            );
            waiting |= ring.push_back(BlockGroup::control(
                BlockFlag::ConfigUpdate,
                self.cur_frame,
                self.config_id,
            ))?;
        }
        waiting |= ring.push_back(group)?;
        self.updated = true;
        Ok(waiting)
    }

    /// Move to the oldest frame any sender is still on, closing the
    /// current one if it had data.
    fn advance(&mut self, ring: &BlockBuf) -> Result<bool> {
        let Some(next) = self.senders.iter().map(|s| s.frame).min() else {
            return Ok(false);
        };
        if next <= self.cur_frame {
            return Ok(false);
        }

        let mut waiting = false;
        if self.updated {
            waiting |= ring.finish_frame(self.cur_frame, self.config_id)?;
            self.updated = false;
        } else {
            debug!(frame_id = self.cur_frame, "frame closed without pixel data");
        }
        debug!(from = self.cur_frame, to = next, "frame advanced");
        self.cur_frame = next;

        // Held layout announcements go ahead of held pixels.
        for state in &mut self.senders {
            let due = state
                .stashed
                .as_ref()
                .is_some_and(|g| g.flag() == BlockFlag::ConfigUpdate && g.frame_id() <= next);
            if let Some(update) = state.stashed.take_if(|_| due) {
                waiting |= ring.push_back(update)?;
            }
        }
        for i in 0..self.senders.len() {
            if self.senders[i].frame != next {
                continue;
            }
            self.senders[i].paused = false;
            if let Some(group) = self.senders[i].stashed.take() {
                waiting |= self.push_pixels(group, ring)?;
            }
        }
        Ok(waiting)
    }

    /// Return stashed groups to the ring, e.g. on shutdown.
    pub fn drain(&mut self, ring: &BlockBuf) {
        for state in &mut self.senders {
            if let Some(group) = state.stashed.take() {
                ring.recycle(group);
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
