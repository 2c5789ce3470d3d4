//! Streamer and network configuration.
//!
//! Both types are plain values: a streamer copies them at construction
//! and only its own network thread changes the derived state afterwards.
//! They deserialize with defaults so binaries can embed them in TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WallError};
use crate::header::{BLOCK_HEADER_SIZE, RegistrationMessage};
use crate::transport::Protocol;
use crate::types::{PixelFormat, Rect, RowOrder};

/// Frame rates are clamped to this range.
const FRAME_RATE_RANGE: (f64, f64) = (0.1, 1000.0);

// ── StreamerConfig ───────────────────────────────────────────────

/// Everything a streamer needs to know about the image and its peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub protocol: Protocol,
    /// Opaque stream type forwarded in the registration message.
    pub stream_type: i32,
    pub window_id: u32,
    pub pixel_format: PixelFormat,
    pub row_order: RowOrder,
    /// Full image size across all nodes.
    pub total_width: u32,
    pub total_height: u32,
    /// Part of the image this node renders; whole image when unset.
    pub region: Option<Rect>,
    pub block_x: u32,
    pub block_y: u32,
    /// Derive block dimensions from the MTU (always on for UDP).
    pub auto_block_size: bool,
    /// Bytes of block data per group.
    pub group_size: usize,
    pub frame_rate: f64,
    /// Nodes cooperating on this image; above 1 frames go through a sync
    /// barrier instead of local pacing.
    pub node_num: u32,
    pub rank: u32,
    pub streamer_id: u32,
    /// Single-slot frame buffer.
    pub async_update: bool,
    /// Relay fed by several parallel upstream senders.
    pub from_bridge_parallel: bool,
    /// Cap for UDP shaping in bytes/second; 0 = unlimited.
    pub max_bandwidth: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            stream_type: 0,
            window_id: 0,
            pixel_format: PixelFormat::Rgb8,
            row_order: RowOrder::TopToBottom,
            total_width: 1920,
            total_height: 1080,
            region: None,
            block_x: 64,
            block_y: 64,
            auto_block_size: false,
            group_size: 65536,
            frame_rate: 30.0,
            node_num: 1,
            rank: 0,
            streamer_id: 0,
            async_update: false,
            from_bridge_parallel: false,
            max_bandwidth: 0,
        }
    }
}

/// Block layout derived from a config and the network limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    pub block_x: u32,
    pub block_y: u32,
    /// Bytes per block on the wire, header included.
    pub block_size: usize,
    pub group_size: usize,
}

impl StreamerConfig {
    /// Bring out-of-range values back into range.
    pub fn normalize(&mut self) {
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
            self.frame_rate = Self::default().frame_rate;
        }
        self.frame_rate = self.frame_rate.clamp(FRAME_RATE_RANGE.0, FRAME_RATE_RANGE.1);
        self.node_num = self.node_num.max(1);
        self.block_x = self.block_x.max(1);
        self.block_y = self.block_y.max(1);
    }

    pub fn image_region(&self) -> Rect {
        self.region
            .unwrap_or(Rect::new(0, 0, self.total_width, self.total_height))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(FRAME_RATE_RANGE.0))
    }

    /// Block and group sizes for this config.
    pub fn block_geometry(&self, nw: &NetworkConfig) -> Result<BlockGeometry> {
        let (block_x, block_y) = if self.protocol == Protocol::Udp || self.auto_block_size {
            auto_block_dims(self.pixel_format, nw.mtu)?
        } else {
            (self.block_x, self.block_y)
        };
        let block_size = self.pixel_format.payload_len(block_x, block_y) + BLOCK_HEADER_SIZE;
        Ok(BlockGeometry {
            block_x,
            block_y,
            block_size,
            // A group always holds at least one block.
            group_size: self.group_size.max(block_size),
        })
    }

    /// Registration message announcing this stream.
    pub fn registration(&self, geometry: &BlockGeometry) -> RegistrationMessage {
        RegistrationMessage {
            stream_type: self.stream_type,
            frame_rate: self.frame_rate.round() as u32,
            window_id: self.window_id,
            group_size: geometry.group_size,
            block_size: geometry.block_size,
            node_num: self.node_num,
            pixel_format: self.pixel_format.code(),
            block_x: geometry.block_x,
            block_y: geometry.block_y,
            total_width: self.total_width,
            total_height: self.total_height,
            async_update: self.async_update,
            from_bridge_parallel: self.from_bridge_parallel,
        }
    }
}

/// Largest roughly square block whose wire size fits in one datagram.
pub fn auto_block_dims(format: PixelFormat, mtu: usize) -> Result<(u32, u32)> {
    let payload = mtu
        .checked_sub(BLOCK_HEADER_SIZE)
        .filter(|p| *p > 0)
        .ok_or_else(|| WallError::Config(format!("mtu {mtu} leaves no room for payload")))?;
    let pixels = payload / format.bytes_per_pixel() * format.comp_factor();
    let mut block_x = pixels.isqrt();
    if format.needs_aligned_width() {
        block_x = block_x / 4 * 4;
    }
    if block_x == 0 {
        return Err(WallError::Config(format!("mtu {mtu} too small for one block row")));
    }
    let mut block_y = pixels / block_x;
    if format.is_block_compressed() {
        block_y = block_y / 4 * 4;
    }
    if block_y == 0 {
        return Err(WallError::Config(format!("mtu {mtu} too small for one block")));
    }
    Ok((block_x as u32, block_y as u32))
}

// ── NetworkConfig ────────────────────────────────────────────────

/// Socket-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub rcv_buf_size: usize,
    pub send_buf_size: usize,
    pub mtu: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rcv_buf_size: 8 * 1024 * 1024,
            send_buf_size: 8 * 1024 * 1024,
            mtu: 1450,
        }
    }
}

impl NetworkConfig {
    /// Parse an init line `"<windowID> <rcvBufSize> <sendBufSize> <mtu>"`.
    ///
    /// Returns the window id alongside the settings.
    pub fn parse_init(text: &str) -> Result<(u32, Self)> {
        let fields: Vec<u64> = text
            .split_ascii_whitespace()
            .map(|t| t.parse::<u64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| WallError::InvalidMessage(format!("init line {text:?}: {e}")))?;
        let [window, rcv, send, mtu] = fields[..] else {
            return Err(WallError::InvalidMessage(format!(
                "init line needs 4 fields, got {}",
                fields.len()
            )));
        };
        let window = u32::try_from(window)
            .map_err(|_| WallError::InvalidMessage(format!("window id {window} out of range")))?;
        Ok((
            window,
            Self {
                rcv_buf_size: rcv as usize,
                send_buf_size: send as usize,
                mtu: mtu as usize,
            },
        ))
    }
}

// ── Tests ────────────────────────────────────────────────────────
