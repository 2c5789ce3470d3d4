//! Application frames and block extraction.
//!
//! A [`BlockFrame`] holds the pixels a producer rendered for its region of
//! the image. The streamer walks it block by block, copying each block's
//! rows into a [`PixelBlock`] payload.

use crate::error::{Result, WallError};
use crate::partition::BlockPartition;
use crate::pool::PixelBlock;
use crate::types::{PixelFormat, Rect, RowOrder};

/// Pixel buffer for one frame of the producer's region.
#[derive(Debug, Clone)]
pub struct BlockFrame {
    format: PixelFormat,
    row_order: RowOrder,
    region: Rect,
    stride: usize,
    data: Vec<u8>,
    blocks: Vec<(u32, Rect)>,
    block_index: usize,
}

impl BlockFrame {
    /// Allocate a frame covering `region` of the partitioned image.
    pub fn new(
        format: PixelFormat,
        row_order: RowOrder,
        region: Rect,
        partition: &BlockPartition,
    ) -> Result<Self> {
        if region.is_empty() {
            return Err(WallError::Config("frame region is empty".into()));
        }
        if format.is_block_compressed() {
            let (bx, by) = partition.block_size();
            let aligned = [region.x, region.y, region.width, region.height, bx, by]
                .iter()
                .all(|v| v % 4 == 0);
            if !aligned {
                return Err(WallError::Config(
                    "compressed frames need 4-aligned regions and blocks".into(),
                ));
            }
        }
        let (cx, cy) = format.compression();
        let stride = region.width.div_ceil(cx) as usize * format.bytes_per_pixel();
        let rows = region.height.div_ceil(cy) as usize;
        let mut frame = Self {
            format,
            row_order,
            region,
            stride,
            data: vec![0; stride * rows],
            blocks: Vec::new(),
            block_index: 0,
        };
        frame.init_frame(partition)?;
        Ok(frame)
    }

    /// Recompute which blocks this frame contributes to.
    pub fn init_frame(&mut self, partition: &BlockPartition) -> Result<()> {
        if !partition.is_initialized() {
            return Err(WallError::PartitionNotInitialized);
        }
        self.blocks = partition
            .blocks_in(&self.region)
            .into_iter()
            .filter_map(|id| {
                let rect = partition.block_rect(id)?.intersection(&self.region)?;
                Some((id, rect))
            })
            .collect();
        self.block_index = 0;
        Ok(())
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn region(&self) -> Rect {
        self.region
    }

    /// Bytes per row (per tile row for compressed formats).
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn reset_block_index(&mut self) {
        self.block_index = 0;
    }

    /// Copy the next block into `block`. Returns `false` once every block
    /// of the frame has been extracted.
    pub fn extract_pixel_block(&mut self, block: &mut PixelBlock) -> Result<bool> {
        let Some(&(id, rect)) = self.blocks.get(self.block_index) else {
            return Ok(false);
        };
        self.block_index += 1;

        let bpp = self.format.bytes_per_pixel();
        let (cx, cy) = self.format.compression();
        let row_bytes = rect.width.div_ceil(cx) as usize * bpp;
        let tile_rows = rect.height.div_ceil(cy);
        let total_rows = self.region.height.div_ceil(cy);
        let needed = row_bytes * tile_rows as usize;
        if needed > block.payload_capacity() {
            return Err(WallError::PayloadTooLarge {
                size: needed,
                max: block.payload_capacity(),
            });
        }

        let src_col = ((rect.x - self.region.x) / cx) as usize * bpp;
        let first_row = (rect.y - self.region.y) / cy;
        let payload = block.payload_mut();
        for r in 0..tile_rows {
            let row = match self.row_order {
                RowOrder::TopToBottom => first_row + r,
                RowOrder::BottomToTop => total_rows - 1 - (first_row + r),
            };
            let src = row as usize * self.stride + src_col;
            let dst = r as usize * row_bytes;
            payload[dst..dst + row_bytes].copy_from_slice(&self.data[src..src + row_bytes]);
        }

        block.set_rect(rect);
        block.set_block_id(id);
        block.set_flag(crate::flags::BlockFlag::PixelData);
        Ok(true)
    }
}

// ── Tests ────────────────────────────────────────────────────────
