//! Shared multi-reader ring of completed block groups.
//!
//! Producers (a [`Receiver`](crate::receiver::Receiver) or a relay) take a
//! free group, fill it and `push_back` it. Each reader walks the queue with
//! its own cursor (`front` / `next`), so several bridge streamers can fan
//! the same groups out at their own pace.
//!
//! ```text
//!            head_seq                               tail
//!   queue:   [g7][g8][g9][g10][g11]
//!   reader 0  ────────^
//!   reader 1  ──^
//! ```
//!
//! Groups behind the slowest reader leave the queue and wait in the vacant
//! list until every block handle a transport still holds has been dropped;
//! only then are they handed out again.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Result, WallError};
use crate::flags::BlockFlag;
use crate::pool::block::{BlockReturn, SharedBlock};
use crate::pool::group::BlockGroup;

/// Frames averaged per frame-interval estimate.
pub const INTERVAL_EVAL_COUNT: u64 = 100;

/// Re-check period while waiting for stragglers to drop block handles.
const FREE_WAIT: Duration = Duration::from_millis(20);

/// Where a newly added reader starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStart {
    /// At the current tail, even mid-frame.
    Tail,
    /// After the next END_FRAME marker.
    NextFrame,
}

/// Occupancy snapshot for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStatus {
    pub queued: usize,
    pub free: usize,
    pub vacant: usize,
    pub readers: usize,
}

#[derive(Debug)]
struct Cursor {
    seq: u64,
    align: bool,
}

struct FrameClock {
    count: u64,
    since: Instant,
    interval: Option<Duration>,
}

impl FrameClock {
    fn tick(&mut self) {
        self.count += 1;
        if self.count % INTERVAL_EVAL_COUNT == 0 {
            let now = Instant::now();
            self.interval = Some(now.duration_since(self.since) / INTERVAL_EVAL_COUNT as u32);
            self.since = now;
        }
    }
}

struct RingState {
    free: VecDeque<BlockGroup>,
    vacant: Vec<Arc<BlockGroup>>,
    queue: VecDeque<Arc<BlockGroup>>,
    head_seq: u64,
    readers: BTreeMap<u32, Cursor>,
    released: bool,
    waiting_data: bool,
    clock: FrameClock,
}

impl RingState {
    fn tail(&self) -> u64 {
        self.head_seq + self.queue.len() as u64
    }

    fn get(&self, seq: u64) -> Option<&Arc<BlockGroup>> {
        seq.checked_sub(self.head_seq)
            .and_then(|i| self.queue.get(i as usize))
    }

    /// Move an aligning reader past the next END_FRAME. False if none yet.
    fn align(&mut self, reader: u32) -> bool {
        let head = self.head_seq;
        let tail = self.tail();
        let Some(cursor) = self.readers.get_mut(&reader) else {
            return false;
        };
        if !cursor.align {
            return true;
        }
        for seq in cursor.seq.max(head)..tail {
            if self.queue[(seq - head) as usize].flag() == BlockFlag::EndFrame {
                cursor.seq = seq + 1;
                cursor.align = false;
                return true;
            }
        }
        cursor.seq = tail;
        false
    }

    fn peek(&mut self, reader: u32) -> Option<Arc<BlockGroup>> {
        if !self.align(reader) {
            return None;
        }
        let seq = self.readers.get(&reader)?.seq;
        self.get(seq).cloned()
    }

    fn collect(&mut self) {
        let tail = self.tail();
        let min = self.readers.values().map(|c| c.seq).min().unwrap_or(tail);
        while self.head_seq < min {
            match self.queue.pop_front() {
                Some(group) => {
                    self.vacant.push(group);
                    self.head_seq += 1;
                }
                None => break,
            }
        }
        self.reclaim_vacant();
    }

    fn reclaim_vacant(&mut self) {
        for group in std::mem::take(&mut self.vacant) {
            if Arc::strong_count(&group) == 1 && group.is_exclusive() {
                match Arc::try_unwrap(group) {
                    // Control groups own no blocks and are simply dropped.
                    Ok(owned) if owned.capacity() > 0 => self.free.push_back(owned),
                    Ok(_) => {}
                    Err(shared) => self.vacant.push(shared),
                }
            } else {
                self.vacant.push(group);
            }
        }
    }
}

// ── BlockBuf ─────────────────────────────────────────────────────

/// Ring buffer of block groups with one or many readers.
pub struct BlockBuf {
    state: Mutex<RingState>,
    data_ready: Condvar,
    group_freed: Condvar,
    block_size: usize,
    group_blocks: usize,
    multi_reader: bool,
}

impl BlockBuf {
    /// Allocate `buf_size` bytes worth of groups of `group_size` bytes.
    ///
    /// A single-reader buffer registers reader 0 up front.
    pub fn new(
        block_size: usize,
        group_size: usize,
        buf_size: usize,
        multi_reader: bool,
    ) -> Result<Self> {
        let group_blocks = (group_size / block_size.max(1)).max(1);
        let groups = (buf_size / (group_blocks * block_size.max(1))).max(4);
        let free = (0..groups)
            .map(|_| BlockGroup::new(block_size, group_blocks))
            .collect::<Result<VecDeque<_>>>()?;
        let mut readers = BTreeMap::new();
        if !multi_reader {
            readers.insert(0, Cursor { seq: 0, align: false });
        }
        debug!(groups, group_blocks, block_size, "block buffer allocated");
        Ok(Self {
            state: Mutex::new(RingState {
                free,
                vacant: Vec::new(),
                queue: VecDeque::new(),
                head_seq: 0,
                readers,
                released: false,
                waiting_data: false,
                clock: FrameClock {
                    count: 0,
                    since: Instant::now(),
                    interval: None,
                },
            }),
            data_ready: Condvar::new(),
            group_freed: Condvar::new(),
            block_size,
            group_blocks,
            multi_reader,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks per pixel group.
    pub fn group_blocks(&self) -> usize {
        self.group_blocks
    }

    /// Take an empty group, waiting while all of them are in use.
    ///
    /// Returns `None` once the buffer has been released.
    pub fn get_free_group(&self) -> Option<BlockGroup> {
        let mut st = self.lock();
        loop {
            if st.released {
                return None;
            }
            st.reclaim_vacant();
            if let Some(mut group) = st.free.pop_front() {
                group.reset();
                return Some(group);
            }
            let (guard, _) = self
                .group_freed
                .wait_timeout(st, FREE_WAIT)
                .unwrap_or_else(PoisonError::into_inner);
            st = guard;
        }
    }

    /// Hand back a group that was taken but never queued.
    pub fn recycle(&self, group: BlockGroup) {
        if group.capacity() == 0 {
            return;
        }
        self.lock().vacant.push(Arc::new(group));
        self.group_freed.notify_all();
    }

    /// Queue a filled group. Returns whether reader 0 was waiting for data.
    pub fn push_back(&self, group: BlockGroup) -> Result<bool> {
        let mut st = self.lock();
        if st.released {
            return Err(WallError::Shutdown);
        }
        st.queue.push_back(Arc::new(group));
        if st.readers.is_empty() {
            st.collect();
        }
        let waiting = std::mem::take(&mut st.waiting_data);
        drop(st);
        self.data_ready.notify_all();
        Ok(waiting)
    }

    /// Queue the END_FRAME marker of `frame_id`.
    pub fn finish_frame(&self, frame_id: u64, config_id: u32) -> Result<bool> {
        let waiting = self.push_back(BlockGroup::control(BlockFlag::EndFrame, frame_id, config_id))?;
        self.lock().clock.tick();
        Ok(waiting)
    }

    /// Average time between finished frames over the last
    /// [`INTERVAL_EVAL_COUNT`] frames.
    pub fn frame_interval(&self) -> Option<Duration> {
        self.lock().clock.interval
    }

    /// Register another reader.
    pub fn add_reader(&self, id: u32, start: ReaderStart) -> Result<()> {
        if !self.multi_reader {
            return Err(WallError::Config("block buffer is single-reader".into()));
        }
        let mut st = self.lock();
        if st.readers.contains_key(&id) {
            return Err(WallError::Config(format!("reader {id} already registered")));
        }
        let seq = st.tail();
        st.readers.insert(
            id,
            Cursor {
                seq,
                align: start == ReaderStart::NextFrame,
            },
        );
        debug!(reader = id, seq, "reader added");
        Ok(())
    }

    /// Drop a reader; wakes it if it is blocked in `wait_front`.
    pub fn remove_reader(&self, id: u32) {
        let mut st = self.lock();
        st.readers.remove(&id);
        st.collect();
        drop(st);
        self.data_ready.notify_all();
        self.group_freed.notify_all();
    }

    /// Group under the reader's cursor, without waiting.
    pub fn front(&self, reader: u32) -> Option<Arc<BlockGroup>> {
        let mut st = self.lock();
        let group = st.peek(reader);
        if group.is_none() && reader == 0 {
            st.waiting_data = true;
        }
        group
    }

    /// Group under the reader's cursor, waiting until one is queued.
    ///
    /// Returns `None` after `release_lock` or `remove_reader`.
    pub fn wait_front(&self, reader: u32) -> Option<Arc<BlockGroup>> {
        let mut st = self.lock();
        loop {
            if st.released || !st.readers.contains_key(&reader) {
                return None;
            }
            if let Some(group) = st.peek(reader) {
                return Some(group);
            }
            if reader == 0 {
                st.waiting_data = true;
            }
            st = self.data_ready.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like `wait_front`, skipping groups older than `min_frame`.
    pub fn front_from(&self, reader: u32, min_frame: u64) -> Option<Arc<BlockGroup>> {
        loop {
            let group = self.wait_front(reader)?;
            if group.frame_id() >= min_frame {
                return Some(group);
            }
            self.next(reader);
        }
    }

    /// Advance the reader's cursor by one group.
    pub fn next(&self, reader: u32) -> bool {
        let mut st = self.lock();
        let tail = st.tail();
        let Some(cursor) = st.readers.get_mut(&reader) else {
            return false;
        };
        if cursor.seq >= tail {
            return false;
        }
        cursor.seq += 1;
        st.collect();
        drop(st);
        self.group_freed.notify_all();
        true
    }

    /// Skip the reader past the next END_FRAME already queued.
    pub fn find_next_frame(&self, reader: u32) -> bool {
        let mut st = self.lock();
        if let Some(cursor) = st.readers.get_mut(&reader) {
            cursor.align = true;
        }
        let found = st.align(reader);
        st.collect();
        found
    }

    /// Whether reader 0 found the buffer empty since the last push.
    pub fn is_waiting_data(&self) -> bool {
        self.lock().waiting_data
    }

    /// Wake every waiter and refuse further pushes.
    pub fn release_lock(&self) {
        self.lock().released = true;
        self.data_ready.notify_all();
        self.group_freed.notify_all();
    }

    pub fn is_released(&self) -> bool {
        self.lock().released
    }

    pub fn status(&self) -> RingStatus {
        let st = self.lock();
        RingStatus {
            queued: st.queue.len(),
            free: st.free.len(),
            vacant: st.vacant.len(),
            readers: st.readers.len(),
        }
    }
}

impl BlockReturn for BlockBuf {
    fn release(&self, block: SharedBlock) {
        if let Err(e) = block.dereference() {
            warn!("{e}");
        }
        drop(block);
        self.group_freed.notify_all();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pixel_group(buf: &BlockBuf, frame_id: u64) -> BlockGroup {
        let mut g = buf.get_free_group().unwrap();
        g.apply_header(&crate::header::GroupHeader {
            block_count: 1,
            flag: BlockFlag::PixelData,
            frame_id,
            config_id: 1,
        })
        .unwrap();
        g
    }

    fn drain(buf: &BlockBuf, reader: u32) -> Vec<(BlockFlag, u64)> {
        let mut out = Vec::new();
        while let Some(g) = buf.front(reader) {
            out.push((g.flag(), g.frame_id()));
            buf.next(reader);
        }
        out
    }

    #[test]
    fn single_reader_sees_push_order() {
        let buf = BlockBuf::new(256, 512, 256 * 16, false).unwrap();
        buf.push_back(pixel_group(&buf, 1)).unwrap();
        buf.push_back(pixel_group(&buf, 1)).unwrap();
        buf.finish_frame(1, 1).unwrap();
        assert_eq!(
            drain(&buf, 0),
            vec![
                (BlockFlag::PixelData, 1),
                (BlockFlag::PixelData, 1),
                (BlockFlag::EndFrame, 1)
            ]
        );
        assert_eq!(buf.status().queued, 0);
    }

    #[test]
    fn groups_are_reused_after_consumption() {
        let buf = BlockBuf::new(256, 256, 256 * 4, false).unwrap();
        assert_eq!(buf.status().free, 4);
        for frame in 1..=20 {
            buf.push_back(pixel_group(&buf, frame)).unwrap();
            assert!(buf.front(0).is_some());
            buf.next(0);
        }
        assert_eq!(buf.status().free, 4);
    }

    #[test]
    fn outstanding_block_handle_blocks_reuse() {
        let buf = BlockBuf::new(256, 256, 256 * 4, false).unwrap();
        buf.push_back(pixel_group(&buf, 1)).unwrap();
        let group = buf.front(0).unwrap();
        let block = Arc::clone(&group.blocks()[0]);
        block.reference(1);
        drop(group);
        buf.next(0);
        assert_eq!(buf.status().vacant, 1);
        assert_eq!(buf.status().free, 3);

        buf.release(block);
        // Reclaimed lazily on the next free-group request.
        let g = buf.get_free_group().unwrap();
        assert_eq!(buf.status().vacant, 0);
        buf.recycle(g);
    }

    #[test]
    fn slowest_reader_holds_groups() {
        let buf = BlockBuf::new(256, 256, 256 * 8, true).unwrap();
        buf.add_reader(1, ReaderStart::Tail).unwrap();
        buf.add_reader(2, ReaderStart::Tail).unwrap();
        buf.push_back(pixel_group(&buf, 1)).unwrap();
        buf.push_back(pixel_group(&buf, 1)).unwrap();

        assert_eq!(drain(&buf, 1).len(), 2);
        assert_eq!(buf.status().queued, 2);
        assert_eq!(drain(&buf, 2).len(), 2);
        assert_eq!(buf.status().queued, 0);
        assert!(buf.add_reader(1, ReaderStart::Tail).is_err());
    }

    #[test]
    fn late_reader_aligns_to_frame_boundary() {
        let buf = BlockBuf::new(256, 256, 256 * 8, true).unwrap();
        buf.add_reader(0, ReaderStart::Tail).unwrap();
        buf.push_back(pixel_group(&buf, 1)).unwrap();
        buf.add_reader(1, ReaderStart::NextFrame).unwrap();
        buf.push_back(pixel_group(&buf, 1)).unwrap();
        buf.finish_frame(1, 1).unwrap();
        buf.push_back(pixel_group(&buf, 2)).unwrap();

        assert_eq!(drain(&buf, 1), vec![(BlockFlag::PixelData, 2)]);
        assert_eq!(drain(&buf, 0).len(), 4);
    }

    #[test]
    fn single_reader_buffer_rejects_readers() {
        let buf = BlockBuf::new(256, 256, 1024, false).unwrap();
        assert!(buf.add_reader(1, ReaderStart::Tail).is_err());
    }

    #[test]
    fn waiting_flag_reported_once() {
        let buf = BlockBuf::new(256, 256, 1024, false).unwrap();
        assert!(buf.front(0).is_none());
        assert!(buf.is_waiting_data());
        assert!(buf.push_back(pixel_group(&buf, 1)).unwrap());
        assert!(!buf.push_back(pixel_group(&buf, 1)).unwrap());
    }

    #[test]
    fn release_unblocks_waiters() {
        let buf = Arc::new(BlockBuf::new(256, 256, 1024, false).unwrap());
        let reader = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || buf.wait_front(0).is_none())
        };
        // Hold every free group so a second thread blocks in get_free_group.
        let held: Vec<_> = (0..4).map(|_| buf.get_free_group().unwrap()).collect();
        let taker = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || buf.get_free_group().is_none())
        };
        thread::sleep(Duration::from_millis(50));
        buf.release_lock();
        assert!(reader.join().unwrap());
        assert!(taker.join().unwrap());
        assert!(buf.push_back(BlockGroup::control(BlockFlag::EndFrame, 1, 0)).is_err());
        drop(held);
    }

    #[test]
    fn frame_interval_after_eval_window() {
        let buf = BlockBuf::new(256, 256, 1024, false).unwrap();
        for frame in 0..INTERVAL_EVAL_COUNT {
            buf.finish_frame(frame, 0).unwrap();
            buf.next(0);
        }
        assert!(buf.frame_interval().is_some());
    }
}
