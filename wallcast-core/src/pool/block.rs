//! Pixel blocks and the sender-side circular block pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::error::{Result, WallError};
use crate::flags::BlockFlag;
use crate::header::{BLOCK_HEADER_SIZE, BlockHeader};
use crate::types::Rect;

/// A block shared between the receivers it fans out to.
pub type SharedBlock = Arc<PixelBlock>;

// ── PixelBlock ───────────────────────────────────────────────────

/// One fixed-size wire unit: header region followed by payload.
///
/// The buffer is allocated once and never grows. `refs` counts the
/// receiver copies still in flight; each copy is released exactly once
/// through [`BlockReturn::release`].
#[derive(Debug)]
pub struct PixelBlock {
    buf: Vec<u8>,
    header: BlockHeader,
    refs: AtomicU32,
}

impl PixelBlock {
    pub fn new(buf_size: usize) -> Result<Self> {
        if buf_size <= BLOCK_HEADER_SIZE {
            return Err(WallError::BlockTooSmall {
                size: buf_size,
                header: BLOCK_HEADER_SIZE,
            });
        }
        Ok(Self {
            buf: vec![0; buf_size],
            header: BlockHeader {
                buf_size,
                flag: BlockFlag::PixelData,
                x: 0,
                y: 0,
                width: 0,
                height: 0,
                frame_id: 0,
                block_id: 0,
            },
            refs: AtomicU32::new(0),
        })
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn buf_size(&self) -> usize {
        self.buf.len()
    }

    pub fn payload_capacity(&self) -> usize {
        self.buf.len() - BLOCK_HEADER_SIZE
    }

    pub fn rect(&self) -> Rect {
        Rect::new(self.header.x, self.header.y, self.header.width, self.header.height)
    }

    pub fn set_rect(&mut self, rect: Rect) {
        self.header.x = rect.x;
        self.header.y = rect.y;
        self.header.width = rect.width;
        self.header.height = rect.height;
    }

    pub fn set_block_id(&mut self, id: u32) {
        self.header.block_id = id;
    }

    pub fn set_frame_id(&mut self, frame_id: u64) {
        self.header.frame_id = frame_id;
    }

    pub fn set_flag(&mut self, flag: BlockFlag) {
        self.header.flag = flag;
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[BLOCK_HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[BLOCK_HEADER_SIZE..]
    }

    /// The whole buffer as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The whole buffer, for receiving into.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Serialize the header fields into the header region.
    pub fn update_buffer_header(&mut self) -> Result<()> {
        self.header.encode_into(&mut self.buf)
    }

    /// Re-read the header fields from a freshly received buffer.
    pub fn update_block_config(&mut self) -> Result<()> {
        let header = BlockHeader::decode(&self.buf)?;
        if header.buf_size != self.buf.len() {
            return Err(WallError::InvalidHeader(format!(
                "block size {} does not match buffer {}",
                header.buf_size,
                self.buf.len()
            )));
        }
        self.header = header;
        Ok(())
    }

    /// Add `count` outstanding receiver copies. Returns the new total.
    pub fn reference(&self, count: u32) -> u32 {
        self.refs.fetch_add(count, Ordering::AcqRel) + count
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Drop one receiver copy. Returns how many remain.
    pub fn dereference(&self) -> Result<u32> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .map_err(|_| WallError::DoubleRelease(self.header.block_id))
    }

    fn reset_refs(&mut self) {
        *self.refs.get_mut() = 0;
    }
}

// ── BlockReturn ──────────────────────────────────────────────────

/// Where a transport hands a block back once a receiver copy is on the
/// wire, or once the connection closes with the copy still unsent.
/// Called exactly once per copy; a failed write keeps the copy pending.
pub trait BlockReturn: Send + Sync {
    fn release(&self, block: SharedBlock);
}

// ── BlockPool ────────────────────────────────────────────────────

/// Circular pool of equally sized blocks.
///
/// `take` pops from the front, recycled blocks go to the back, so slots
/// rotate without reallocating their buffers.
pub struct BlockPool {
    free: Mutex<VecDeque<PixelBlock>>,
    block_size: usize,
    capacity: usize,
}

impl BlockPool {
    pub fn new(block_size: usize, capacity: usize) -> Result<Self> {
        let mut free = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            free.push_back(PixelBlock::new(block_size)?);
        }
        Ok(Self {
            free: Mutex::new(free),
            block_size,
            capacity,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Next free block.
    pub fn take(&self) -> Result<PixelBlock> {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or(WallError::PoolExhausted("block"))
    }

    /// Recycle a block that was never sent or whose copies are all done.
    pub fn push_back(&self, mut block: PixelBlock) {
        block.reset_refs();
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(block);
    }

    fn reclaim(&self, mut block: SharedBlock) {
        // Other holders drop their handle right after their own decrement.
        loop {
            match Arc::try_unwrap(block) {
                Ok(owned) => return self.push_back(owned),
                Err(shared) => {
                    block = shared;
                    std::thread::yield_now();
                }
            }
        }
    }
}

impl BlockReturn for BlockPool {
    fn release(&self, block: SharedBlock) {
        match block.dereference() {
            Ok(0) => self.reclaim(block),
            Ok(_) => {}
            Err(e) => warn!("{e}"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_needs_room_for_payload() {
        assert!(PixelBlock::new(BLOCK_HEADER_SIZE).is_err());
        let b = PixelBlock::new(BLOCK_HEADER_SIZE + 1).unwrap();
        assert_eq!(b.payload_capacity(), 1);
    }

    #[test]
    fn header_roundtrip_through_buffer() {
        let mut b = PixelBlock::new(532).unwrap();
        b.set_rect(Rect::new(64, 128, 64, 64));
        b.set_frame_id(42);
        b.set_block_id(17);
        b.update_buffer_header().unwrap();

        let mut rx = PixelBlock::new(532).unwrap();
        rx.as_bytes_mut().copy_from_slice(b.as_bytes());
        rx.update_block_config().unwrap();
        assert_eq!(rx.header().to_token_string(), "532 1 64 128 64 64 42 17");
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut b = PixelBlock::new(532).unwrap();
        b.update_buffer_header().unwrap();
        let mut rx = PixelBlock::new(600).unwrap();
        rx.as_bytes_mut()[..532].copy_from_slice(b.as_bytes());
        assert!(rx.update_block_config().is_err());
    }

    #[test]
    fn refcount_underflow_is_detected() {
        let b = PixelBlock::new(256).unwrap();
        assert_eq!(b.reference(2), 2);
        assert_eq!(b.dereference().unwrap(), 1);
        assert_eq!(b.dereference().unwrap(), 0);
        assert!(matches!(b.dereference(), Err(WallError::DoubleRelease(_))));
    }

    #[test]
    fn shared_block_returns_after_last_release() {
        let pool = BlockPool::new(256, 2).unwrap();
        let block = pool.take().unwrap();
        assert_eq!(pool.available(), 1);

        let shared = Arc::new(block);
        shared.reference(2);
        let copy = Arc::clone(&shared);

        pool.release(copy);
        assert_eq!(pool.available(), 1, "one copy still in flight");
        pool.release(shared);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.take().unwrap().ref_count(), 0);
    }

    #[test]
    fn empty_pool_reports_exhaustion() {
        let pool = BlockPool::new(256, 1).unwrap();
        let _held = pool.take().unwrap();
        assert!(matches!(pool.take(), Err(WallError::PoolExhausted(_))));
    }
}
