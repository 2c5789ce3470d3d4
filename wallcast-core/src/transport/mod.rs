//! Pluggable block-group transport.
//!
//! A streamer talks to its receivers through a [`StreamProtocol`]; two
//! bindings exist, [`tcp::TcpModule`] (reliable, ordered) and
//! [`udp::UdpModule`] (datagrams with rate shaping). Both batch blocks into
//! groups with the same [`GroupWriter`], so group framing and block
//! release behave identically whatever carries the bytes.
//!
//! ## Wire format
//!
//! ```text
//! connect:  [registration 512]                 (always over TCP)
//! group:    [group header 128][block 0]...[block n-1]
//! control:  [group header 128]                 (block count 0)
//! block:    [block header 128][payload]        (exactly blockSize bytes)
//! ```
//!
//! The receiving half is a [`GroupSource`] per sender, produced by
//! [`listener::GroupListener`].

pub mod listener;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::socket::{setsockopt, sockopt};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::NetworkConfig;
use crate::error::{Result, WallError};
use crate::flags::BlockFlag;
use crate::header::{GroupHeader, RegistrationMessage};
use crate::pool::{BlockGroup, BlockReturn, SharedBlock};

/// Consecutive `WouldBlock`/`Interrupted` results tolerated per write.
const RETRY_LIMIT: u32 = 2000;

/// Pause between retries after `WouldBlock`.
const RETRY_BACKOFF: Duration = Duration::from_micros(100);

// ── Protocol ─────────────────────────────────────────────────────

/// Which binding carries block groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    /// Added to a receiver's base port.
    pub const fn port_offset(self) -> u16 {
        match self {
            Protocol::Tcp => 0,
            Protocol::Udp => 1,
        }
    }

    /// Fresh sending binding; `max_bandwidth` caps UDP shaping (0 = none).
    pub fn transport(self, max_bandwidth: u64) -> Box<dyn StreamProtocol> {
        match self {
            Protocol::Tcp => Box::new(tcp::TcpModule::new()),
            Protocol::Udp => Box::new(udp::UdpModule::new(max_bandwidth)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

// ── StreamProtocol ───────────────────────────────────────────────

/// Sending half of a transport binding, one connection per receiver.
///
/// Receiver indices are the values returned by [`connect`](Self::connect).
/// Every block handed to [`send_grp`](Self::send_grp) goes back through
/// the pool installed with [`setup_block_pool`](Self::setup_block_pool)
/// exactly once.
pub trait StreamProtocol: Send {
    fn protocol(&self) -> Protocol;

    /// Block and group geometry plus socket settings for new connections.
    fn set_config(&mut self, block_size: usize, group_size: usize, nw: &NetworkConfig)
    -> Result<()>;

    fn set_frame_rate(&mut self, _frame_rate: f64) {}

    fn setup_block_pool(&mut self, pool: Arc<dyn BlockReturn>);

    /// Open a connection and register the stream on it.
    fn connect(&mut self, addr: SocketAddr, registration: &RegistrationMessage) -> Result<usize>;

    /// Bytes one frame puts on this receiver's connection.
    fn set_frame_size(&mut self, _receiver: usize, _bytes: usize) {}

    /// Queue a block; a group goes out once full or when the frame changes.
    fn send_grp(&mut self, receiver: usize, block: SharedBlock, config_id: u32) -> Result<usize>;

    /// Send pending blocks, then a payload-free END_FRAME group.
    fn send_control(&mut self, receiver: usize, frame_id: u64, config_id: u32) -> Result<usize>;

    /// Send pending blocks and push buffered bytes to the socket.
    fn flush(&mut self, receiver: usize, config_id: u32) -> Result<usize>;

    fn close(&mut self, receiver: usize);

    fn close_all(&mut self);

    fn receiver_count(&self) -> usize;

    /// Socket of a connected receiver, for readiness polling.
    fn rcv_sock_fd(&self, receiver: usize) -> Option<BorrowedFd<'_>>;
}

// ── GroupSink ────────────────────────────────────────────────────

/// Byte-level half of one connection.
pub trait GroupSink: Send {
    /// Write one group header followed by its blocks. Returns bytes sent.
    fn send_group(&mut self, header: &[u8], blocks: &[SharedBlock]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Expected bytes per frame and frame rate, for shaping bindings.
    fn set_pacing(&mut self, _frame_bytes: usize, _frame_rate: f64) {}

    fn socket_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

/// Write all of `buf`, retrying partial writes, `WouldBlock` and
/// `Interrupted`. Gives up with `TimedOut` after [`RETRY_LIMIT`] attempts
/// without progress.
pub fn write_all_retry<W: Write + ?Sized>(w: &mut W, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    let mut stalled = 0;
    while written < buf.len() {
        match w.write(&buf[written..]) {
            Ok(n) if n > 0 => {
                written += n;
                stalled = 0;
                continue;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(RETRY_BACKOFF),
            Err(e) => return Err(e),
        }
        stalled += 1;
        if stalled > RETRY_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write stalled after {written} of {} bytes", buf.len()),
            ));
        }
    }
    Ok(())
}

/// Stream framing shared by the stream-oriented sinks.
pub fn write_group<W: Write + ?Sized>(
    w: &mut W,
    header: &[u8],
    blocks: &[SharedBlock],
) -> io::Result<usize> {
    write_all_retry(w, header)?;
    let mut sent = header.len();
    for block in blocks {
        write_all_retry(w, block.as_bytes())?;
        sent += block.buf_size();
    }
    Ok(sent)
}

/// Apply the configured socket buffer sizes; failures are only logged.
pub(crate) fn set_buffer_sizes<F: AsFd>(sock: &F, nw: &NetworkConfig) {
    if let Err(e) = setsockopt(sock, sockopt::SndBuf, &nw.send_buf_size) {
        warn!(size = nw.send_buf_size, "SO_SNDBUF: {e}");
    }
    if let Err(e) = setsockopt(sock, sockopt::RcvBuf, &nw.rcv_buf_size) {
        warn!(size = nw.rcv_buf_size, "SO_RCVBUF: {e}");
    }
}

// ── GroupWriter ──────────────────────────────────────────────────

/// Batches one receiver's blocks into groups.
///
/// A block leaves `pending` only after the group holding it was written
/// completely; at that point it is released to the pool. A failed write
/// leaves the blocks pending so they are released once, on close.
pub struct GroupWriter<S> {
    sink: S,
    pending: Vec<SharedBlock>,
    pending_frame: u64,
    group_blocks: usize,
    returns: Option<Arc<dyn BlockReturn>>,
}

impl<S: GroupSink> GroupWriter<S> {
    pub fn new(sink: S, group_blocks: usize) -> Self {
        let group_blocks = group_blocks.max(1);
        Self {
            sink,
            pending: Vec::with_capacity(group_blocks),
            pending_frame: 0,
            group_blocks,
            returns: None,
        }
    }

    pub fn set_returns(&mut self, returns: Arc<dyn BlockReturn>) {
        self.returns = Some(returns);
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, block: SharedBlock, config_id: u32) -> Result<usize> {
        let frame_id = block.header().frame_id;
        let mut sent = 0;
        if !self.pending.is_empty() && frame_id != self.pending_frame {
            sent += self.send_pending(config_id)?;
        }
        self.pending_frame = frame_id;
        self.pending.push(block);
        if self.pending.len() >= self.group_blocks {
            sent += self.send_pending(config_id)?;
        }
        Ok(sent)
    }

    /// Send whatever is pending as a (possibly short) group.
    pub fn send_pending(&mut self, config_id: u32) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let header = GroupHeader {
            block_count: self.pending.len(),
            flag: BlockFlag::PixelData,
            frame_id: self.pending_frame,
            config_id,
        }
        .encode()?;
        let sent = self.sink.send_group(&header, &self.pending)?;
        self.release_pending();
        Ok(sent)
    }

    pub fn send_control(&mut self, frame_id: u64, config_id: u32) -> Result<usize> {
        let sent = self.send_pending(config_id)?;
        let header = BlockGroup::control(BlockFlag::EndFrame, frame_id, config_id)
            .header()
            .encode()?;
        Ok(sent + self.sink.send_group(&header, &[])?)
    }

    pub fn flush(&mut self, config_id: u32) -> Result<usize> {
        let sent = self.send_pending(config_id)?;
        self.sink.flush()?;
        Ok(sent)
    }

    /// Release unsent blocks and hand back the sink.
    pub fn close(mut self) -> S {
        self.release_pending();
        self.sink
    }

    fn release_pending(&mut self) {
        for block in self.pending.drain(..) {
            if let Some(returns) = &self.returns {
                returns.release(block);
            }
        }
    }
}

// ── PeerSet ──────────────────────────────────────────────────────

/// Connected receivers of one binding, indexed by connect order.
pub(crate) struct PeerSet<S> {
    peers: Vec<Option<GroupWriter<S>>>,
    group_blocks: usize,
    returns: Option<Arc<dyn BlockReturn>>,
}

impl<S: GroupSink> PeerSet<S> {
    pub(crate) fn new() -> Self {
        Self {
            peers: Vec::new(),
            group_blocks: 1,
            returns: None,
        }
    }

    pub(crate) fn set_group_blocks(&mut self, group_blocks: usize) {
        self.group_blocks = group_blocks.max(1);
    }

    pub(crate) fn set_returns(&mut self, returns: Arc<dyn BlockReturn>) {
        for writer in self.peers.iter_mut().flatten() {
            writer.set_returns(Arc::clone(&returns));
        }
        self.returns = Some(returns);
    }

    pub(crate) fn add(&mut self, sink: S) -> usize {
        let mut writer = GroupWriter::new(sink, self.group_blocks);
        if let Some(returns) = &self.returns {
            writer.set_returns(Arc::clone(returns));
        }
        self.peers.push(Some(writer));
        self.peers.len() - 1
    }

    pub(crate) fn get(&self, receiver: usize) -> Option<&GroupWriter<S>> {
        self.peers.get(receiver).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, receiver: usize) -> Result<&mut GroupWriter<S>> {
        self.peers
            .get_mut(receiver)
            .and_then(Option::as_mut)
            .ok_or(WallError::UnknownReceiver(receiver))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut GroupWriter<S>> {
        self.peers.iter_mut().flatten()
    }

    pub(crate) fn close(&mut self, receiver: usize) -> Option<S> {
        self.peers
            .get_mut(receiver)
            .and_then(Option::take)
            .map(GroupWriter::close)
    }

    pub(crate) fn close_all(&mut self) {
        for receiver in 0..self.peers.len() {
            self.close(receiver);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }
}

// ── GroupSource ──────────────────────────────────────────────────

/// Receiving half of one sender's connection.
///
/// The descriptor returned by `as_fd` becomes readable when a group can be
/// read without blocking on the first byte.
pub trait GroupSource: Send + AsFd {
    /// Read one group into `group`. Returns bytes consumed.
    ///
    /// `ConnectionClosed` once the sender is gone; non-fatal errors
    /// (see [`WallError::is_fatal`]) cost only the offending group.
    fn recv_grp(&mut self, group: &mut BlockGroup) -> Result<usize>;

    fn registration(&self) -> &RegistrationMessage;
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BlockPool;

    /// Writer that stalls and accepts short writes before making progress.
    struct FlakyWriter {
        out: Vec<u8>,
        calls: usize,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            match self.calls % 4 {
                1 => Err(io::ErrorKind::WouldBlock.into()),
                2 => Err(io::ErrorKind::Interrupted.into()),
                3 => Ok(0),
                _ => {
                    let n = buf.len().min(7);
                    self.out.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FlakySink(FlakyWriter);

    impl GroupSink for FlakySink {
        fn send_group(&mut self, header: &[u8], blocks: &[SharedBlock]) -> io::Result<usize> {
            write_group(&mut self.0, header, blocks)
        }
    }

    struct BrokenSink;

    impl GroupSink for BrokenSink {
        fn send_group(&mut self, _: &[u8], _: &[SharedBlock]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
    }

    const BLOCK: usize = 160;

    fn pool_block(pool: &BlockPool, frame_id: u64, refs: u32) -> SharedBlock {
        let mut block = pool.take().unwrap();
        block.set_frame_id(frame_id);
        block.update_buffer_header().unwrap();
        block.reference(refs);
        Arc::new(block)
    }

    #[test]
    fn retried_writes_release_each_copy_once() {
        let pool = Arc::new(BlockPool::new(BLOCK, 2).unwrap());
        let sink = FlakySink(FlakyWriter {
            out: Vec::new(),
            calls: 0,
        });
        let mut a = GroupWriter::new(sink, 4);
        a.set_returns(pool.clone());
        let mut b = GroupWriter::new(BrokenSink, 4);
        b.set_returns(pool.clone());

        // One block fanned out to two receivers.
        let block = pool_block(&pool, 1, 2);
        assert_eq!(pool.available(), 1);
        a.push(Arc::clone(&block), 0).unwrap();
        b.push(block, 0).unwrap();

        let sent = a.send_control(1, 0).unwrap();
        assert_eq!(sent, 128 + BLOCK + 128);
        assert_eq!(a.sink().0.out.len(), sent);
        assert_eq!(pool.available(), 1, "b still holds its copy");

        // The failed write keeps the copy; closing releases it once.
        assert!(b.flush(0).is_err());
        assert_eq!(b.pending(), 1);
        b.close();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn groups_split_on_capacity_and_frame_change() {
        let pool = Arc::new(BlockPool::new(BLOCK, 4).unwrap());
        let sink = FlakySink(FlakyWriter {
            out: Vec::new(),
            calls: 3,
        });
        let mut w = GroupWriter::new(sink, 2);
        w.set_returns(pool.clone());

        assert_eq!(w.push(pool_block(&pool, 1, 1), 3).unwrap(), 0);
        assert_eq!(w.push(pool_block(&pool, 1, 1), 3).unwrap(), 128 + 2 * BLOCK);
        assert_eq!(w.push(pool_block(&pool, 1, 1), 3).unwrap(), 0);
        // Frame 2 pushes the short frame-1 group out first.
        assert_eq!(w.push(pool_block(&pool, 2, 1), 3).unwrap(), 128 + BLOCK);
        assert_eq!(w.pending(), 1);
        assert_eq!(pool.available(), 3);

        let out = &w.sink().0.out;
        let first = GroupHeader::decode(out).unwrap();
        assert_eq!((first.block_count, first.frame_id, first.config_id), (2, 1, 3));
        let second = GroupHeader::decode(&out[128 + 2 * BLOCK..]).unwrap();
        assert_eq!((second.block_count, second.frame_id), (1, 1));
    }

    #[test]
    fn stalled_writer_times_out() {
        struct Stuck;
        impl Write for Stuck {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::Interrupted.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let err = write_all_retry(&mut Stuck, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn control_group_has_no_blocks() {
        let sink = FlakySink(FlakyWriter {
            out: Vec::new(),
            calls: 3,
        });
        let mut w = GroupWriter::new(sink, 2);
        assert_eq!(w.send_control(9, 4).unwrap(), 128);
        let header = GroupHeader::decode(&w.sink().0.out).unwrap();
        assert_eq!(header.flag, BlockFlag::EndFrame);
        assert_eq!((header.block_count, header.frame_id, header.config_id), (0, 9, 4));
    }

    #[test]
    fn peer_set_rejects_unknown_receivers() {
        let mut peers: PeerSet<BrokenSink> = PeerSet::new();
        assert_eq!(peers.add(BrokenSink), 0);
        assert!(peers.get_mut(0).is_ok());
        assert!(matches!(peers.get_mut(3), Err(WallError::UnknownReceiver(3))));
        peers.close(0);
        assert!(peers.get(0).is_none());
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn protocol_ports_and_names() {
        assert_eq!(Protocol::default(), Protocol::Tcp);
        assert_eq!(Protocol::Udp.port_offset(), 1);
        assert_eq!(Protocol::Udp.to_string(), "udp");
        assert_eq!(Protocol::Udp.transport(0).protocol(), Protocol::Udp);
        assert_eq!(Protocol::Tcp.transport(0).receiver_count(), 0);
    }
}
