//! Frame barrier for streamers that cooperate on one image.
//!
//! When several nodes each stream part of an image, none of them may move
//! on to frame N+1 before all of them finished frame N. Each member calls
//! [`FrameSync::sync_frame`] once per frame; the call returns when every
//! current member has arrived, together with the highest frame id any of
//! them announced and the messages queued for this round. Every member of
//! a round therefore applies the same reconfiguration at the same frame.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::message::StreamMessage;

/// Outcome of one barrier round.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncMessage {
    /// Frame every member continues with.
    pub frame_id: u64,
    pub messages: Vec<StreamMessage>,
}

pub trait FrameSync: Send + Sync {
    /// Announce `frame_id` and wait for the other members.
    ///
    /// `None` once the group is closed or `member` has left.
    fn sync_frame(&self, member: u32, frame_id: u64) -> Option<SyncMessage>;

    /// Deliver `message` to every member at the next round.
    fn enqueue(&self, message: StreamMessage);

    /// Stop waiting for `member`.
    fn leave(&self, member: u32);
}

#[derive(Default)]
struct SyncState {
    members: BTreeSet<u32>,
    arrived: BTreeSet<u32>,
    generation: u64,
    max_frame: u64,
    queued: Vec<StreamMessage>,
    released: SyncMessage,
    closed: bool,
}

impl SyncState {
    fn complete(&self) -> bool {
        !self.arrived.is_empty() && self.arrived.is_superset(&self.members)
    }

    fn release(&mut self) {
        self.released = SyncMessage {
            frame_id: self.max_frame,
            messages: std::mem::take(&mut self.queued),
        };
        self.generation += 1;
        self.max_frame = 0;
        self.arrived.clear();
        debug!(
            generation = self.generation,
            frame_id = self.released.frame_id,
            "sync round released"
        );
    }
}

/// In-process [`FrameSync`].
pub struct SyncGroup {
    state: Mutex<SyncState>,
    round: Condvar,
}

impl SyncGroup {
    pub fn new(members: impl IntoIterator<Item = u32>) -> Self {
        Self {
            state: Mutex::new(SyncState {
                members: members.into_iter().collect(),
                ..SyncState::default()
            }),
            round: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn join(&self, member: u32) {
        self.lock().members.insert(member);
    }

    pub fn member_count(&self) -> usize {
        self.lock().members.len()
    }

    /// Release every waiter for good.
    pub fn close(&self) {
        self.lock().closed = true;
        self.round.notify_all();
    }
}

impl FrameSync for SyncGroup {
    fn sync_frame(&self, member: u32, frame_id: u64) -> Option<SyncMessage> {
        let mut st = self.lock();
        if st.closed || !st.members.contains(&member) {
            return None;
        }
        st.arrived.insert(member);
        st.max_frame = st.max_frame.max(frame_id);
        let generation = st.generation;
        if st.complete() {
            st.release();
            self.round.notify_all();
        }
        while st.generation == generation {
            if st.closed || !st.members.contains(&member) {
                return None;
            }
            st = self.round.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        Some(st.released.clone())
    }

    fn enqueue(&self, message: StreamMessage) {
        self.lock().queued.push(message);
    }

    fn leave(&self, member: u32) {
        let mut st = self.lock();
        st.members.remove(&member);
        st.arrived.remove(&member);
        if st.complete() {
            st.release();
        }
        drop(st);
        self.round.notify_all();
    }
}
