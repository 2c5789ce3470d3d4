//! Block partition: which receivers need which blocks.
//!
//! The image is cut into a row-major grid of `block_x × block_y` tiles
//! (edge tiles are clipped to the image). Each tile keeps the ordered,
//! duplicate-free list of receivers whose region overlaps it.
//!
//! ```text
//!   0   1   2   3        receiver A: rect covering columns 0..2
//!   4   5   6   7        receiver B: rect covering columns 1..4
//!   8   9  10  11        → blocks in column 1 map to [A, B]
//! ```
//!
//! The table is rebuilt from scratch on every reconfiguration:
//! `clear_block_table` → `set_stream_*`… → `seal`. Registering streams on a
//! sealed table without clearing it first is rejected.

use crate::error::{Result, WallError};
use crate::types::Rect;

/// Population state of the block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Freshly cleared; no receiver registered.
    Cleared,
    /// Receivers are being registered.
    Populating,
    /// Registration finished; the map is in use.
    Sealed,
}

#[derive(Debug, Clone)]
struct BlockEntry {
    rect: Rect,
    receivers: Vec<usize>,
}

/// Maps block ids to the receivers that display them.
#[derive(Debug, Clone)]
pub struct BlockPartition {
    block_x: u32,
    block_y: u32,
    width: u32,
    height: u32,
    cols: u32,
    rows: u32,
    blocks: Vec<BlockEntry>,
    state: TableState,
}

impl BlockPartition {
    /// Describe the grid. Call [`init_block_table`](Self::init_block_table)
    /// before using it.
    pub fn new(block_x: u32, block_y: u32, width: u32, height: u32) -> Result<Self> {
        if block_x == 0 || block_y == 0 {
            return Err(WallError::Config("block dimensions must be non-zero".into()));
        }
        if width == 0 || height == 0 {
            return Err(WallError::Config("image dimensions must be non-zero".into()));
        }
        Ok(Self {
            block_x,
            block_y,
            width,
            height,
            cols: width.div_ceil(block_x),
            rows: height.div_ceil(block_y),
            blocks: Vec::new(),
            state: TableState::Cleared,
        })
    }

    /// Build the row-major block table.
    pub fn init_block_table(&mut self) {
        let mut blocks = Vec::with_capacity(self.total_block_num());
        for row in 0..self.rows {
            for col in 0..self.cols {
                let x = col * self.block_x;
                let y = row * self.block_y;
                let rect = Rect::new(
                    x,
                    y,
                    self.block_x.min(self.width - x),
                    self.block_y.min(self.height - y),
                );
                blocks.push(BlockEntry {
                    rect,
                    receivers: Vec::new(),
                });
            }
        }
        self.blocks = blocks;
        self.state = TableState::Cleared;
    }

    pub fn is_initialized(&self) -> bool {
        !self.blocks.is_empty()
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn block_size(&self) -> (u32, u32) {
        (self.block_x, self.block_y)
    }

    pub fn image_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// `cols × rows`.
    pub fn total_block_num(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    pub fn state(&self) -> TableState {
        self.state
    }

    /// Id of the block containing pixel `(x, y)`.
    pub fn block_id_at(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some((y / self.block_y) * self.cols + x / self.block_x)
    }

    /// Clipped image rectangle of a block.
    pub fn block_rect(&self, block_id: u32) -> Option<Rect> {
        self.blocks.get(block_id as usize).map(|b| b.rect)
    }

    /// Forget every receiver registration.
    pub fn clear_block_table(&mut self) {
        for block in &mut self.blocks {
            block.receivers.clear();
        }
        self.state = TableState::Cleared;
    }

    fn begin_update(&mut self) -> Result<()> {
        if !self.is_initialized() {
            return Err(WallError::PartitionNotInitialized);
        }
        if self.state == TableState::Sealed {
            return Err(WallError::PartitionDirty);
        }
        self.state = TableState::Populating;
        Ok(())
    }

    fn assign(block: &mut BlockEntry, receiver: usize) {
        if !block.receivers.contains(&receiver) {
            block.receivers.push(receiver);
        }
    }

    /// Assign the inclusive block-id range to `receiver`.
    ///
    /// Returns the number of blocks in the range after clipping.
    pub fn set_stream_range(&mut self, receiver: usize, first: u32, last: u32) -> Result<usize> {
        self.begin_update()?;
        let Some(end) = (last as usize).checked_add(1) else {
            return Ok(0);
        };
        let end = end.min(self.blocks.len());
        let start = first as usize;
        if start >= end {
            return Ok(0);
        }
        for block in &mut self.blocks[start..end] {
            Self::assign(block, receiver);
        }
        Ok(end - start)
    }

    /// Assign every block overlapping `rect` (image coordinates).
    ///
    /// Returns the number of blocks touched.
    pub fn set_stream_rect(&mut self, receiver: usize, rect: Rect) -> Result<usize> {
        self.begin_update()?;
        let image = Rect::new(0, 0, self.width, self.height);
        let Some(clip) = rect.intersection(&image) else {
            return Ok(0);
        };
        let col0 = clip.x / self.block_x;
        let col1 = (clip.right() - 1) / self.block_x;
        let row0 = clip.y / self.block_y;
        let row1 = (clip.bottom() - 1) / self.block_y;
        let mut count = 0;
        for row in row0..=row1 {
            for col in col0..=col1 {
                let id = (row * self.cols + col) as usize;
                Self::assign(&mut self.blocks[id], receiver);
                count += 1;
            }
        }
        Ok(count)
    }

    /// Finish a registration pass.
    pub fn seal(&mut self) {
        self.state = TableState::Sealed;
    }

    /// Receivers that need `block_id`; empty when the block is off-screen
    /// or out of range.
    pub fn block_map(&self, block_id: u32) -> Result<&[usize]> {
        if !self.is_initialized() {
            return Err(WallError::PartitionNotInitialized);
        }
        Ok(self
            .blocks
            .get(block_id as usize)
            .map(|b| b.receivers.as_slice())
            .unwrap_or(&[]))
    }

    /// Number of blocks mapped to `receiver`.
    pub fn receiver_block_count(&self, receiver: usize) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.receivers.contains(&receiver))
            .count()
    }

    /// Ids of blocks overlapping `region`, row-major.
    pub fn blocks_in(&self, region: &Rect) -> Vec<u32> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.rect.intersects(region))
            .map(|(id, _)| id as u32)
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(bx: u32, by: u32, w: u32, h: u32) -> BlockPartition {
        let mut p = BlockPartition::new(bx, by, w, h).unwrap();
        p.init_block_table();
        p
    }

    fn snapshot(p: &BlockPartition) -> Vec<Vec<usize>> {
        (0..p.total_block_num() as u32)
            .map(|id| p.block_map(id).unwrap().to_vec())
            .collect()
    }

    #[test]
    fn block_count_is_ceil_product() {
        for &(bx, by, w, h) in &[
            (64, 64, 1920, 1080),
            (64, 64, 64, 64),
            (7, 3, 100, 10),
            (100, 100, 1, 1),
            (16, 9, 17, 10),
        ] {
            let p = partition(bx, by, w, h);
            let expected = w.div_ceil(bx) as usize * h.div_ceil(by) as usize;
            assert_eq!(p.total_block_num(), expected, "{bx}x{by} over {w}x{h}");
        }
    }

    #[test]
    fn every_pixel_maps_to_exactly_one_block() {
        let p = partition(7, 5, 30, 17);
        let mut hits = vec![0u32; p.total_block_num()];
        for y in 0..17 {
            for x in 0..30 {
                let id = p.block_id_at(x, y).unwrap();
                assert!(p.block_rect(id).unwrap().contains(x, y));
                hits[id as usize] += 1;
            }
        }
        let area: u32 = (0..p.total_block_num() as u32)
            .map(|id| {
                let r = p.block_rect(id).unwrap();
                r.width * r.height
            })
            .sum();
        assert_eq!(area, 30 * 17);
        assert!(hits.iter().all(|&h| h > 0));
        assert_eq!(p.block_id_at(30, 0), None);
    }

    #[test]
    fn edge_blocks_are_clipped() {
        let p = partition(64, 64, 100, 70);
        assert_eq!(p.block_rect(1), Some(Rect::new(64, 0, 36, 64)));
        assert_eq!(p.block_rect(3), Some(Rect::new(64, 64, 36, 6)));
    }

    #[test]
    fn straddling_block_maps_to_both_receivers() {
        let mut p = partition(64, 64, 256, 64);
        assert_eq!(p.set_stream_rect(0, Rect::new(0, 0, 100, 64)).unwrap(), 2);
        assert_eq!(p.set_stream_rect(1, Rect::new(100, 0, 156, 64)).unwrap(), 3);
        p.seal();
        assert_eq!(p.block_map(0).unwrap(), &[0]);
        assert_eq!(p.block_map(1).unwrap(), &[0, 1]);
        assert_eq!(p.block_map(3).unwrap(), &[1]);
        assert_eq!(p.receiver_block_count(1), 3);
    }

    #[test]
    fn off_screen_blocks_have_empty_map() {
        let mut p = partition(64, 64, 256, 128);
        p.set_stream_rect(0, Rect::new(0, 0, 64, 64)).unwrap();
        p.seal();
        assert!(p.block_map(5).unwrap().is_empty());
        assert!(p.block_map(999).unwrap().is_empty());
    }

    #[test]
    fn reconfiguration_is_idempotent() {
        let rects = [
            (0, Rect::new(0, 0, 130, 70)),
            (1, Rect::new(120, 0, 200, 200)),
            (2, Rect::new(0, 60, 500, 500)),
        ];
        let mut p = partition(32, 32, 320, 240);
        for &(r, rect) in &rects {
            p.set_stream_rect(r, rect).unwrap();
        }
        p.seal();
        let first = snapshot(&p);

        p.clear_block_table();
        for &(r, rect) in &rects {
            p.set_stream_rect(r, rect).unwrap();
        }
        p.seal();
        assert_eq!(snapshot(&p), first);
    }

    #[test]
    fn sealed_table_must_be_cleared() {
        let mut p = partition(32, 32, 64, 64);
        p.set_stream_range(0, 0, 1).unwrap();
        p.seal();
        assert!(matches!(
            p.set_stream_range(1, 2, 3),
            Err(WallError::PartitionDirty)
        ));
        p.clear_block_table();
        assert_eq!(p.set_stream_range(1, 2, 3).unwrap(), 2);
    }

    #[test]
    fn duplicate_registration_counts_once_per_block() {
        let mut p = partition(32, 32, 64, 64);
        p.set_stream_range(0, 0, 3).unwrap();
        p.set_stream_range(0, 1, 2).unwrap();
        p.seal();
        assert_eq!(p.block_map(1).unwrap(), &[0]);
    }

    #[test]
    fn ranges_are_clipped() {
        let mut p = partition(32, 32, 64, 64);
        assert_eq!(p.set_stream_range(0, 2, 100).unwrap(), 2);
        assert_eq!(p.set_stream_range(0, 5, 9).unwrap(), 0);
        assert_eq!(p.set_stream_range(0, 3, 1).unwrap(), 0);
    }

    #[test]
    fn uninitialised_table_is_an_error() {
        let mut p = BlockPartition::new(32, 32, 64, 64).unwrap();
        assert!(matches!(p.block_map(0), Err(WallError::PartitionNotInitialized)));
        assert!(p.set_stream_range(0, 0, 1).is_err());
    }
}
