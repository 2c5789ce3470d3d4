//! Shared geometry and pixel-layout types.
//!
//! These describe frames as the producer hands them over. The wire form
//! of the same data lives in [`crate::header`] and [`crate::pool`].

use serde::{Deserialize, Serialize};

use crate::error::WallError;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of application frames.
///
/// Block-compressed formats (DXT) are handled at the granularity of 4×4
/// tiles: `bytes_per_pixel` is then the size of one compressed tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 3 bytes per pixel: Red, Green, Blue.
    #[default]
    Rgb8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 2 bytes per pixel, 5-6-5 packed.
    Rgb565,
    /// 2 bytes per pixel, 4:2:2 chroma subsampled.
    Yuv422,
    /// 8 bytes per 4×4 tile.
    Dxt1,
    /// 16 bytes per 4×4 tile.
    Dxt5,
}

impl PixelFormat {
    /// Bytes per pixel, or per compressed tile for DXT.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::Rgb565 | PixelFormat::Yuv422 => 2,
            PixelFormat::Dxt1 => 8,
            PixelFormat::Dxt5 => 16,
        }
    }

    /// Tile dimensions of one compression unit.
    pub const fn compression(self) -> (u32, u32) {
        if self.is_block_compressed() {
            (4, 4)
        } else {
            (1, 1)
        }
    }

    /// Pixels per compression unit.
    pub const fn comp_factor(self) -> usize {
        let (cx, cy) = self.compression();
        (cx * cy) as usize
    }

    pub const fn is_block_compressed(self) -> bool {
        matches!(self, PixelFormat::Dxt1 | PixelFormat::Dxt5)
    }

    /// Block widths must be multiples of 4 for these formats.
    pub const fn needs_aligned_width(self) -> bool {
        matches!(self, PixelFormat::Dxt1 | PixelFormat::Dxt5 | PixelFormat::Yuv422)
    }

    /// Payload bytes for a `width × height` region.
    pub fn payload_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        (pixels * self.bytes_per_pixel()).div_ceil(self.comp_factor())
    }

    /// Code carried in the registration message.
    pub const fn code(self) -> i32 {
        match self {
            PixelFormat::Rgb8 => 0,
            PixelFormat::Rgba8 => 1,
            PixelFormat::Bgra8 => 2,
            PixelFormat::Rgb565 => 3,
            PixelFormat::Yuv422 => 4,
            PixelFormat::Dxt1 => 5,
            PixelFormat::Dxt5 => 6,
        }
    }
}

impl TryFrom<i32> for PixelFormat {
    type Error = WallError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PixelFormat::Rgb8,
            1 => PixelFormat::Rgba8,
            2 => PixelFormat::Bgra8,
            3 => PixelFormat::Rgb565,
            4 => PixelFormat::Yuv422,
            5 => PixelFormat::Dxt1,
            6 => PixelFormat::Dxt5,
            other => {
                return Err(WallError::UnknownVariant {
                    type_name: "PixelFormat",
                    value: other as i64,
                });
            }
        })
    }
}

// ── RowOrder ─────────────────────────────────────────────────────

/// Vertical order of rows in a producer's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOrder {
    #[default]
    TopToBottom,
    /// GL readback order; flipped during block extraction.
    BottomToTop,
}

// ── Rect ─────────────────────────────────────────────────────────

/// Axis-aligned rectangle in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge.
    pub const fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge.
    pub const fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Overlapping area, or `None` when the rectangles only touch.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        (x0 < x1 && y0 < y1).then(|| Rect::new(x0, y0, x1 - x0, y1 - y0))
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.intersection(other).is_some()
    }
}
