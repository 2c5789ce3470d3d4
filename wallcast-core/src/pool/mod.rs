//! Block storage: pixel blocks, groups, the sender's circular block pool
//! and the receiver-side multi-reader ring.

pub mod block;
pub mod group;
pub mod ring;

pub use block::{BlockPool, BlockReturn, PixelBlock, SharedBlock};
pub use group::BlockGroup;
pub use ring::{BlockBuf, INTERVAL_EVAL_COUNT, ReaderStart, RingStatus};
