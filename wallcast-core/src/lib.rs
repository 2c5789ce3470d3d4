//! # wallcast-core
//!
//! Pixel-block streaming engine for tiled display walls.
//!
//! This crate contains:
//! - **Partitioning**: `BlockPartition` maps image blocks to the receivers whose tiles they overlap
//! - **Wire units**: `PixelBlock`, `BlockGroup` and the fixed-size ASCII headers
//! - **Buffers**: `DoubleBuffer` producer handoff, `BlockPool`, the multi-reader `BlockBuf` ring
//! - **Streamers**: `Streamer` for application frames, `BridgeStreamer` for relayed blocks
//! - **Receiver**: multi-sender reader that re-imposes frame boundaries
//! - **Transport**: `StreamProtocol` with TCP and rate-shaped UDP bindings
//! - **Error**: `WallError`, a `thiserror`-based error hierarchy

pub mod bandwidth;
pub mod config;
pub mod double_buffer;
pub mod error;
pub mod flags;
pub mod frame;
pub mod header;
pub mod message;
pub mod partition;
pub mod pool;
pub mod receiver;
pub mod session;
pub mod streamer;
pub mod transport;
pub mod types;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bandwidth::{BandwidthEstimator, StatsSnapshot, StreamStats};
pub use config::{BlockGeometry, NetworkConfig, StreamerConfig, auto_block_dims};
pub use double_buffer::{DoubleBuffer, ReadSlot, SlotPhase, WriteSlot};
pub use error::{Result, WallError};
pub use flags::{BlockFlag, SendCondition};
pub use frame::BlockFrame;
pub use header::{
    BLOCK_HEADER_SIZE, BlockHeader, GROUP_HEADER_SIZE, GroupHeader, REG_MSG_SIZE,
    RegistrationMessage,
};
pub use message::{
    ConnectionDescriptor, LayoutKind, RangeAssignment, ReceiverEndpoint, RegionAssignment,
    StreamLayout, StreamMessage,
};
pub use partition::{BlockPartition, TableState};
pub use pool::{BlockBuf, BlockGroup, BlockPool, BlockReturn, PixelBlock, ReaderStart, SharedBlock};
pub use receiver::{FrameAssembler, Receiver, ReceiverEvent};
pub use session::StreamSession;
pub use streamer::{BridgeStreamer, FrameSync, Streamer, SyncGroup, SyncMessage};
pub use transport::listener::{GroupListener, ListenerWaker};
pub use transport::tcp::TcpModule;
pub use transport::udp::UdpModule;
pub use transport::{GroupSource, Protocol, StreamProtocol};
pub use types::{PixelFormat, Rect, RowOrder};
