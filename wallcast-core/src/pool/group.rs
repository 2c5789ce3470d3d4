//! Block groups: the atomic transport unit.

use std::sync::Arc;

use crate::error::{Result, WallError};
use crate::flags::BlockFlag;
use crate::header::GroupHeader;
use crate::pool::block::{PixelBlock, SharedBlock};

/// A batch of blocks sharing one frame id, one flag and one config id.
///
/// Pixel groups own a fixed set of preallocated blocks; `len` says how many
/// of them hold data. Control groups (END_FRAME, CONFIG_UPDATE) own none.
#[derive(Debug)]
pub struct BlockGroup {
    flag: BlockFlag,
    frame_id: u64,
    config_id: u32,
    blocks: Vec<SharedBlock>,
    len: usize,
}

impl BlockGroup {
    /// A pixel group with `capacity` blocks of `block_size` bytes.
    pub fn new(block_size: usize, capacity: usize) -> Result<Self> {
        let blocks = (0..capacity)
            .map(|_| PixelBlock::new(block_size).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            flag: BlockFlag::PixelData,
            frame_id: 0,
            config_id: 0,
            blocks,
            len: 0,
        })
    }

    /// A payload-free marker group.
    pub fn control(flag: BlockFlag, frame_id: u64, config_id: u32) -> Self {
        Self {
            flag,
            frame_id,
            config_id,
            blocks: Vec::new(),
            len: 0,
        }
    }

    pub fn flag(&self) -> BlockFlag {
        self.flag
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn config_id(&self) -> u32 {
        self.config_id
    }

    pub fn set_frame_id(&mut self, frame_id: u64) {
        self.frame_id = frame_id;
    }

    pub fn set_config_id(&mut self, config_id: u32) {
        self.config_id = config_id;
    }

    /// Blocks holding data.
    pub fn blocks(&self) -> &[SharedBlock] {
        &self.blocks[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn header(&self) -> GroupHeader {
        GroupHeader {
            block_count: self.len,
            flag: self.flag,
            frame_id: self.frame_id,
            config_id: self.config_id,
        }
    }

    /// Adopt a received group header; block buffers follow separately.
    pub fn apply_header(&mut self, header: &GroupHeader) -> Result<()> {
        if header.block_count > self.capacity() {
            return Err(WallError::GroupTooLarge {
                size: header.block_count,
                max: self.capacity(),
            });
        }
        self.flag = header.flag;
        self.frame_id = header.frame_id;
        self.config_id = header.config_id;
        self.len = header.block_count;
        Ok(())
    }

    /// Mutable access to slot `index` for filling.
    ///
    /// Fails while any downstream copy of that block is still alive.
    pub fn block_mut(&mut self, index: usize) -> Result<&mut PixelBlock> {
        let max = self.blocks.len();
        let slot = self.blocks.get_mut(index).ok_or(WallError::GroupTooLarge {
            size: index + 1,
            max,
        })?;
        let id = slot.header().block_id;
        Arc::get_mut(slot).ok_or(WallError::BlockBusy(id))
    }

    /// No block of this group is referenced from outside.
    pub fn is_exclusive(&self) -> bool {
        self.blocks.iter().all(|b| Arc::strong_count(b) == 1)
    }

    /// Make the group reusable.
    pub fn reset(&mut self) {
        self.flag = BlockFlag::PixelData;
        self.frame_id = 0;
        self.config_id = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_group_has_no_blocks() {
        let g = BlockGroup::control(BlockFlag::EndFrame, 4, 2);
        assert_eq!(g.capacity(), 0);
        assert!(g.is_empty());
        assert_eq!(g.header().to_token_string(), "0 3 4 2");
    }

    #[test]
    fn header_respects_capacity() {
        let mut g = BlockGroup::new(256, 2).unwrap();
        let ok = GroupHeader {
            block_count: 2,
            flag: BlockFlag::PixelData,
            frame_id: 7,
            config_id: 1,
        };
        g.apply_header(&ok).unwrap();
        assert_eq!(g.blocks().len(), 2);
        let too_many = GroupHeader { block_count: 3, ..ok };
        assert!(g.apply_header(&too_many).is_err());
    }

    #[test]
    fn shared_blocks_are_not_writable() {
        let mut g = BlockGroup::new(256, 1).unwrap();
        assert!(g.block_mut(0).is_ok());
        g.len = 1;
        let copy = Arc::clone(&g.blocks()[0]);
        assert!(!g.is_exclusive());
        assert!(matches!(g.block_mut(0), Err(WallError::BlockBusy(_))));
        drop(copy);
        assert!(g.is_exclusive());
        assert!(g.block_mut(0).is_ok());
    }
}
