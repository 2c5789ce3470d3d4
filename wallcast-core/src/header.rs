//! Fixed-width ASCII headers used on the wire.
//!
//! Every header is a whitespace-separated list of decimal integers written
//! into a zero-filled region of a fixed size. The text must leave room for
//! at least one NUL terminator; anything longer is an encoding error and
//! nothing is written.
//!
//! ```text
//! block header  (128 B): bufSize flag x y width height frameID blockID
//! group header  (128 B): blockCount flag frameID configID
//! registration  (512 B): streamType frameRate windowID groupSize blockSize
//!                        nodeNum pixelFormat blockX blockY totalWidth
//!                        totalHeight asyncUpdate fromBridgeParallel
//! ```

use std::fmt;

use crate::error::{Result, WallError};
use crate::flags::BlockFlag;
use crate::partition::BlockPartition;

// ── Constants ────────────────────────────────────────────────────

/// Bytes reserved at the front of every block buffer.
pub const BLOCK_HEADER_SIZE: usize = 128;

/// Bytes reserved in front of every block group.
pub const GROUP_HEADER_SIZE: usize = 128;

/// Size of the registration message sent once per connection.
pub const REG_MSG_SIZE: usize = 512;

// ── Fixed-region helpers ─────────────────────────────────────────

/// Write `text` into `region`, zero-filling the remainder.
pub(crate) fn write_fixed(region: &mut [u8], text: &str) -> Result<()> {
    if text.len() >= region.len() {
        return Err(WallError::HeaderOverflow {
            needed: text.len() + 1,
            capacity: region.len(),
        });
    }
    region[..text.len()].copy_from_slice(text.as_bytes());
    region[text.len()..].fill(0);
    Ok(())
}

/// Text of a fixed region up to the first NUL.
pub(crate) fn read_fixed(region: &[u8]) -> Result<&str> {
    let end = region.iter().position(|&b| b == 0).unwrap_or(region.len());
    std::str::from_utf8(&region[..end])
        .map_err(|_| WallError::InvalidHeader("header is not ASCII".into()))
}

fn parse_ints<const N: usize>(text: &str, what: &str) -> Result<[i64; N]> {
    let mut out = [0i64; N];
    let mut tokens = text.split_ascii_whitespace();
    for (i, slot) in out.iter_mut().enumerate() {
        let token = tokens.next().ok_or_else(|| {
            WallError::InvalidHeader(format!("{what}: expected {N} fields, got {i}"))
        })?;
        *slot = token
            .parse()
            .map_err(|_| WallError::InvalidHeader(format!("{what}: bad field {token:?}")))?;
    }
    Ok(out)
}

fn non_negative(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| WallError::InvalidHeader(format!("negative {what}")))
}

fn flag_code(value: i64) -> Result<BlockFlag> {
    let code = i32::try_from(value)
        .map_err(|_| WallError::InvalidHeader(format!("flag {value} out of range")))?;
    BlockFlag::try_from(code)
}

// ── BlockHeader ──────────────────────────────────────────────────

/// Per-block metadata in front of each pixel payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Total buffer size (header + payload region).
    pub buf_size: usize,
    pub flag: BlockFlag,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub frame_id: u64,
    pub block_id: u32,
}

impl BlockHeader {
    /// Render the header as its token string.
    pub fn to_token_string(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {}",
            self.buf_size,
            self.flag.code(),
            self.x,
            self.y,
            self.width,
            self.height,
            self.frame_id,
            self.block_id
        )
    }

    /// Encode into the fixed header region at the start of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Err(WallError::BlockTooSmall {
                size: buf.len(),
                header: BLOCK_HEADER_SIZE,
            });
        }
        write_fixed(&mut buf[..BLOCK_HEADER_SIZE], &self.to_token_string())
    }

    /// Parse a header from its token string.
    pub fn parse(text: &str) -> Result<Self> {
        let [buf_size, flag, x, y, w, h, frame, id] = parse_ints::<8>(text, "block header")?;
        let field = |v: i64, name: &str| -> Result<u32> {
            u32::try_from(v).map_err(|_| WallError::InvalidHeader(format!("block {name} out of range")))
        };
        Ok(Self {
            buf_size: non_negative(buf_size, "buffer size")? as usize,
            flag: flag_code(flag)?,
            x: field(x, "x")?,
            y: field(y, "y")?,
            width: field(w, "width")?,
            height: field(h, "height")?,
            frame_id: non_negative(frame, "frame id")?,
            block_id: field(id, "id")?,
        })
    }

    /// Parse the fixed header region at the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let region = buf.get(..BLOCK_HEADER_SIZE).ok_or_else(|| {
            WallError::InvalidHeader(format!("block shorter than header: {}", buf.len()))
        })?;
        Self::parse(read_fixed(region)?)
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_token_string())
    }
}

// ── GroupHeader ──────────────────────────────────────────────────

/// Metadata in front of each block group.
///
/// A group with `block_count == 0` is a control group and carries no
/// block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupHeader {
    pub block_count: usize,
    pub flag: BlockFlag,
    pub frame_id: u64,
    pub config_id: u32,
}

impl GroupHeader {
    pub fn to_token_string(&self) -> String {
        format!(
            "{} {} {} {}",
            self.block_count,
            self.flag.code(),
            self.frame_id,
            self.config_id
        )
    }

    pub fn encode(&self) -> Result<[u8; GROUP_HEADER_SIZE]> {
        let mut region = [0u8; GROUP_HEADER_SIZE];
        write_fixed(&mut region, &self.to_token_string())?;
        Ok(region)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let region = buf.get(..GROUP_HEADER_SIZE).ok_or_else(|| {
            WallError::InvalidHeader(format!("group shorter than header: {}", buf.len()))
        })?;
        let [count, flag, frame, config] = parse_ints::<4>(read_fixed(region)?, "group header")?;
        let header = Self {
            block_count: non_negative(count, "block count")? as usize,
            flag: flag_code(flag)?,
            frame_id: non_negative(frame, "frame id")?,
            config_id: u32::try_from(config)
                .map_err(|_| WallError::InvalidHeader("config id out of range".into()))?,
        };
        if header.flag.is_pixel() == (header.block_count == 0) {
            return Err(WallError::InvalidHeader(format!(
                "{:?} group with {} blocks",
                header.flag, header.block_count
            )));
        }
        Ok(header)
    }
}

// ── RegistrationMessage ──────────────────────────────────────────

/// Sent by a streamer once per connection so the receiver can size its
/// buffers and rebuild the sender's block geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationMessage {
    pub stream_type: i32,
    pub frame_rate: u32,
    pub window_id: u32,
    pub group_size: usize,
    pub block_size: usize,
    pub node_num: u32,
    pub pixel_format: i32,
    pub block_x: u32,
    pub block_y: u32,
    pub total_width: u32,
    pub total_height: u32,
    pub async_update: bool,
    pub from_bridge_parallel: bool,
}

impl RegistrationMessage {
    pub fn to_token_string(&self) -> String {
        format!(
            "{} {} {} {} {} {} {} {} {} {} {} {} {}",
            self.stream_type,
            self.frame_rate,
            self.window_id,
            self.group_size,
            self.block_size,
            self.node_num,
            self.pixel_format,
            self.block_x,
            self.block_y,
            self.total_width,
            self.total_height,
            self.async_update as i32,
            self.from_bridge_parallel as i32
        )
    }

    /// Encode into a full `REG_MSG_SIZE` region.
    pub fn encode(&self) -> Result<[u8; REG_MSG_SIZE]> {
        let mut region = [0u8; REG_MSG_SIZE];
        write_fixed(&mut region, &self.to_token_string())?;
        Ok(region)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let f = parse_ints::<13>(text, "registration")
            .map_err(|e| WallError::InvalidRegistration(e.to_string()))?;
        let unsigned = |v: i64, name: &str| -> Result<u32> {
            u32::try_from(v).map_err(|_| WallError::InvalidRegistration(format!("{name} = {v}")))
        };
        let code = |v: i64, name: &str| -> Result<i32> {
            i32::try_from(v).map_err(|_| WallError::InvalidRegistration(format!("{name} = {v}")))
        };
        let msg = Self {
            stream_type: code(f[0], "stream type")?,
            frame_rate: unsigned(f[1], "frame rate")?,
            window_id: unsigned(f[2], "window id")?,
            group_size: unsigned(f[3], "group size")? as usize,
            block_size: unsigned(f[4], "block size")? as usize,
            node_num: unsigned(f[5], "node count")?,
            pixel_format: code(f[6], "pixel format")?,
            block_x: unsigned(f[7], "block width")?,
            block_y: unsigned(f[8], "block height")?,
            total_width: unsigned(f[9], "image width")?,
            total_height: unsigned(f[10], "image height")?,
            async_update: f[11] != 0,
            from_bridge_parallel: f[12] != 0,
        };
        if msg.block_x == 0 || msg.block_y == 0 {
            return Err(WallError::InvalidRegistration("zero block dimension".into()));
        }
        Ok(msg)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let region = buf.get(..REG_MSG_SIZE).ok_or_else(|| {
            WallError::InvalidRegistration(format!("short registration: {} bytes", buf.len()))
        })?;
        Self::parse(read_fixed(region)?)
    }

    /// Build and initialise the block partition this sender uses.
    pub fn block_partition(&self) -> Result<BlockPartition> {
        let mut partition = BlockPartition::new(
            self.block_x,
            self.block_y,
            self.total_width,
            self.total_height,
        )?;
        partition.init_block_table();
        Ok(partition)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_header_scenario() {
        let h = BlockHeader::parse("532 1 64 128 64 64 42 17").unwrap();
        assert_eq!(h.buf_size, 532);
        assert_eq!(h.flag, BlockFlag::PixelData);
        assert_eq!((h.x, h.y, h.width, h.height), (64, 128, 64, 64));
        assert_eq!(h.frame_id, 42);
        assert_eq!(h.block_id, 17);
        assert_eq!(h.to_token_string(), "532 1 64 128 64 64 42 17");
    }

    #[test]
    fn block_header_in_fixed_region() {
        let h = BlockHeader::parse("532 1 64 128 64 64 42 17").unwrap();
        let mut buf = vec![0xffu8; 532];
        h.encode_into(&mut buf).unwrap();
        // Region is NUL padded, payload untouched.
        assert_eq!(buf[BLOCK_HEADER_SIZE - 1], 0);
        assert_eq!(buf[BLOCK_HEADER_SIZE], 0xff);
        assert_eq!(BlockHeader::decode(&buf).unwrap(), h);
    }

    #[test]
    fn block_header_rejects_garbage() {
        assert!(BlockHeader::parse("532 1 64").is_err());
        assert!(BlockHeader::parse("532 1 64 128 64 64 x 17").is_err());
        assert!(BlockHeader::parse("532 7 64 128 64 64 42 17").is_err());
        assert!(BlockHeader::parse("532 1 -4 128 64 64 42 17").is_err());
        // 2^32 + 1 must not wrap around to PIXEL_DATA.
        assert!(matches!(
            BlockHeader::parse("532 4294967297 64 128 64 64 42 17"),
            Err(WallError::InvalidHeader(_))
        ));
    }

    #[test]
    fn overflow_is_an_error_and_writes_nothing() {
        let mut region = [7u8; 8];
        let err = write_fixed(&mut region, "123456789").unwrap_err();
        assert!(matches!(err, WallError::HeaderOverflow { needed: 10, capacity: 8 }));
        assert_eq!(region, [7u8; 8]);
        // Exactly full leaves no room for the terminator.
        assert!(write_fixed(&mut region, "12345678").is_err());
        assert!(write_fixed(&mut region, "1234567").is_ok());
    }

    #[test]
    fn group_header_roundtrip_and_consistency() {
        let g = GroupHeader {
            block_count: 2,
            flag: BlockFlag::PixelData,
            frame_id: 9,
            config_id: 3,
        };
        let bytes = g.encode().unwrap();
        assert_eq!(GroupHeader::decode(&bytes).unwrap(), g);

        let ctrl = GroupHeader {
            block_count: 0,
            flag: BlockFlag::EndFrame,
            frame_id: 9,
            config_id: 3,
        };
        assert_eq!(GroupHeader::decode(&ctrl.encode().unwrap()).unwrap(), ctrl);

        // Pixel groups must carry blocks, control groups must not.
        let bad = GroupHeader { block_count: 0, ..g };
        assert!(GroupHeader::decode(&bad.encode().unwrap()).is_err());
    }

    #[test]
    fn wide_flag_codes_are_rejected() {
        let mut region = [0u8; GROUP_HEADER_SIZE];
        write_fixed(&mut region, "1 4294967297 9 3").unwrap();
        assert!(matches!(
            GroupHeader::decode(&region),
            Err(WallError::InvalidHeader(_))
        ));
        assert!(RegistrationMessage::parse("4294967296 30 7 1024 512 1 0 64 64 1920 1080 0 0").is_err());
        assert!(RegistrationMessage::parse("0 30 7 1024 512 1 4294967296 64 64 1920 1080 0 0").is_err());
    }

    #[test]
    fn registration_scenario_partition() {
        let msg = RegistrationMessage::parse("0 30 7 1024 512 1 0 64 64 1920 1080 0 0").unwrap();
        assert_eq!(msg.frame_rate, 30);
        assert_eq!(msg.window_id, 7);
        assert_eq!(msg.group_size, 1024);
        assert_eq!(msg.block_size, 512);
        assert!(!msg.async_update);
        let partition = msg.block_partition().unwrap();
        assert_eq!(partition.cols(), 30);
        assert_eq!(partition.rows(), 17);
        assert_eq!(partition.total_block_num(), 510);
    }

    #[test]
    fn registration_region_roundtrip() {
        let msg = RegistrationMessage::parse("0 30 7 1024 512 1 0 64 64 1920 1080 1 0").unwrap();
        let region = msg.encode().unwrap();
        assert_eq!(region.len(), REG_MSG_SIZE);
        assert_eq!(RegistrationMessage::decode(&region).unwrap(), msg);
    }

    #[test]
    fn registration_rejects_zero_blocks() {
        assert!(RegistrationMessage::parse("0 30 7 1024 512 1 0 0 64 1920 1080 0 0").is_err());
        assert!(RegistrationMessage::parse("0 30 7").is_err());
    }
}
