//! Domain-specific error types for the wallcast engine.
//!
//! Every fallible operation returns `Result<T, WallError>`. Low-level
//! components never decide to stop a thread themselves; they return the
//! error and the owning loop logs it and clears its run flag.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, WallError>;

/// The canonical error type for block streaming.
#[derive(Debug, Error)]
pub enum WallError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A header region could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Encoding a header would not fit into its fixed region.
    #[error("header overflow: {needed} bytes do not fit in {capacity}")]
    HeaderOverflow { needed: usize, capacity: usize },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value}")]
    UnknownVariant { type_name: &'static str, value: i64 },

    /// A peer violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A group arrived for a frame the receiver has already completed.
    #[error("out-of-order group: frame {frame_id} < current {current}")]
    OutOfOrder { frame_id: u64, current: u64 },

    /// The registration message sent on connect was malformed.
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    /// A reconfiguration or descriptor message could not be parsed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    // ── Resource Errors ──────────────────────────────────────────
    /// No free block or group was available.
    #[error("{0} pool exhausted")]
    PoolExhausted(&'static str),

    /// A block buffer was sized too small to hold its header.
    #[error("block buffer too small: {size} bytes (header needs {header})")]
    BlockTooSmall { size: usize, header: usize },

    /// A payload does not fit into the block's fixed buffer.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A group exceeds what the transport can carry in one unit.
    #[error("group too large: {size} bytes (max {max})")]
    GroupTooLarge { size: usize, max: usize },

    /// A block was still shared when exclusive access was required.
    #[error("block {0} is still referenced")]
    BlockBusy(u32),

    /// A block was released more often than it was referenced.
    #[error("block {0} released more times than referenced")]
    DoubleRelease(u32),

    // ── Configuration Errors ─────────────────────────────────────
    /// The block table was used before `init_block_table`.
    #[error("block partition not initialised")]
    PartitionNotInitialized,

    /// The block table was repopulated without being cleared first.
    #[error("block partition must be cleared before reconfiguration")]
    PartitionDirty,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The streamer has no receiver covering any part of the image.
    #[error("no active streams")]
    NoActiveStreams,

    // ── Connection Errors ────────────────────────────────────────
    /// The socket layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// A peer closed its connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A receiver index that was never connected.
    #[error("unknown receiver {0}")]
    UnknownReceiver(usize),

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// The structure was shut down while waiting.
    #[error("shut down")]
    Shutdown,

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl WallError {
    /// Whether the error should end the owning thread's loop.
    ///
    /// Header and ordering problems only cost the offending unit.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            WallError::InvalidHeader(_) | WallError::OutOfOrder { .. } | WallError::UnknownVariant { .. }
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for WallError {
    fn from(s: String) -> Self {
        WallError::Other(s)
    }
}

impl From<&str> for WallError {
    fn from(s: &str) -> Self {
        WallError::Other(s.to_string())
    }
}

impl From<nix::errno::Errno> for WallError {
    fn from(e: nix::errno::Errno) -> Self {
        WallError::Connection(std::io::Error::from(e))
    }
}
