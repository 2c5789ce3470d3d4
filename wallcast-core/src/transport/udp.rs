//! Datagram binding: one UDP datagram per block group.
//!
//! Registration still travels over a TCP connection, which the receiver
//! answers with the port of the datagram socket it opened for this
//! sender. The TCP connection stays open for the lifetime of the stream.
//! Sending is paced by a [`RateShaper`] so a frame's groups are spread
//! over the frame interval instead of bursting into the receiver's
//! socket buffer.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::error::{Result, WallError};
use crate::header::{GROUP_HEADER_SIZE, GroupHeader, RegistrationMessage};
use crate::pool::{BlockGroup, BlockReturn, SharedBlock};
use crate::transport::{GroupSink, GroupSource, PeerSet, Protocol, StreamProtocol, set_buffer_sizes};

/// Largest group a datagram stream accepts.
pub const MAX_GROUP_SIZE: usize = 65536;

/// Largest UDP payload over IPv4.
const MAX_DATAGRAM: usize = 65507;

/// Shaped rate relative to the nominal frame bandwidth.
const RATE_HEADROOM: f64 = 2.0;

/// Shaping restarts its accounting after this long.
const SHAPING_WINDOW: Duration = Duration::from_secs(1);

const SEND_RETRY_LIMIT: u32 = 2000;

// ── RateShaper ───────────────────────────────────────────────────

/// Token-free pacing: sleeps whenever the bytes sent in the current window
/// are ahead of `rate`.
#[derive(Debug)]
pub struct RateShaper {
    rate: f64,
    cap: u64,
    started: Instant,
    sent: u64,
}

impl RateShaper {
    /// `cap` in bytes/second; 0 means uncapped.
    pub fn new(cap: u64) -> Self {
        Self {
            rate: cap as f64,
            cap,
            started: Instant::now(),
            sent: 0,
        }
    }

    pub fn configure(&mut self, frame_bytes: usize, frame_rate: f64) {
        let mut rate = frame_bytes as f64 * frame_rate * RATE_HEADROOM;
        if self.cap > 0 && (rate <= 0.0 || rate > self.cap as f64) {
            rate = self.cap as f64;
        }
        self.rate = rate;
        self.reset();
    }

    /// Bytes/second; 0 when unshaped.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// How long to wait before sending `bytes` more.
    pub fn delay_for(&mut self, bytes: usize) -> Duration {
        if self.rate <= 0.0 {
            return Duration::ZERO;
        }
        let elapsed = self.started.elapsed();
        if elapsed > SHAPING_WINDOW {
            self.reset();
        }
        self.sent += bytes as u64;
        let due = Duration::from_secs_f64(self.sent as f64 / self.rate);
        due.saturating_sub(self.started.elapsed())
    }

    pub fn throttle(&mut self, bytes: usize) {
        let delay = self.delay_for(bytes);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    fn reset(&mut self) {
        self.started = Instant::now();
        self.sent = 0;
    }
}

// ── Sender side ──────────────────────────────────────────────────

pub struct DatagramSink {
    socket: UdpSocket,
    /// Registration connection; dropping it tells the receiver we left.
    _control: TcpStream,
    buf: BytesMut,
    shaper: RateShaper,
}

impl DatagramSink {
    fn send_datagram(&self) -> io::Result<usize> {
        let mut stalled = 0;
        loop {
            match self.socket.send(&self.buf) {
                Ok(n) if n == self.buf.len() => return Ok(n),
                Ok(n) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("datagram truncated to {n} of {} bytes", self.buf.len()),
                    ));
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) && stalled < SEND_RETRY_LIMIT =>
                {
                    stalled += 1;
                    thread::sleep(Duration::from_micros(100));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl GroupSink for DatagramSink {
    fn send_group(&mut self, header: &[u8], blocks: &[SharedBlock]) -> io::Result<usize> {
        self.buf.clear();
        self.buf.extend_from_slice(header);
        for block in blocks {
            self.buf.extend_from_slice(block.as_bytes());
        }
        self.shaper.throttle(self.buf.len());
        self.send_datagram()
    }

    fn set_pacing(&mut self, frame_bytes: usize, frame_rate: f64) {
        self.shaper.configure(frame_bytes, frame_rate);
    }

    fn socket_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.socket.as_fd())
    }
}

/// [`StreamProtocol`] over UDP datagrams.
pub struct UdpModule {
    peers: PeerSet<DatagramSink>,
    frame_sizes: Vec<usize>,
    nw: NetworkConfig,
    frame_rate: f64,
    max_bandwidth: u64,
    datagram_bytes: usize,
}

impl UdpModule {
    /// `max_bandwidth` caps each connection in bytes/second (0 = uncapped).
    pub fn new(max_bandwidth: u64) -> Self {
        Self {
            peers: PeerSet::new(),
            frame_sizes: Vec::new(),
            nw: NetworkConfig::default(),
            frame_rate: 30.0,
            max_bandwidth,
            datagram_bytes: 0,
        }
    }

    fn repace(&mut self, receiver: usize) {
        let frame_bytes = self.frame_sizes.get(receiver).copied().unwrap_or(0);
        let frame_rate = self.frame_rate;
        if let Ok(writer) = self.peers.get_mut(receiver) {
            writer.sink_mut().set_pacing(frame_bytes, frame_rate);
        }
    }
}

impl StreamProtocol for UdpModule {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn set_config(&mut self, block_size: usize, group_size: usize, nw: &NetworkConfig) -> Result<()> {
        if group_size > MAX_GROUP_SIZE {
            return Err(WallError::GroupTooLarge {
                size: group_size,
                max: MAX_GROUP_SIZE,
            });
        }
        if block_size == 0 || block_size + GROUP_HEADER_SIZE > MAX_DATAGRAM {
            return Err(WallError::Config(format!(
                "block size {block_size} does not fit a datagram"
            )));
        }
        let group_blocks = (group_size / block_size)
            .min((MAX_DATAGRAM - GROUP_HEADER_SIZE) / block_size)
            .max(1);
        self.peers.set_group_blocks(group_blocks);
        self.datagram_bytes = GROUP_HEADER_SIZE + group_blocks * block_size;
        self.nw = nw.clone();
        debug!(group_blocks, datagram = self.datagram_bytes, "udp geometry");
        Ok(())
    }

    fn set_frame_rate(&mut self, frame_rate: f64) {
        self.frame_rate = frame_rate;
        for receiver in 0..self.peers.len() {
            self.repace(receiver);
        }
    }

    fn setup_block_pool(&mut self, pool: Arc<dyn BlockReturn>) {
        self.peers.set_returns(pool);
    }

    fn connect(&mut self, addr: SocketAddr, registration: &RegistrationMessage) -> Result<usize> {
        let mut control = TcpStream::connect(addr)?;
        control.write_all(&registration.encode()?)?;
        let mut line = String::new();
        BufReader::new(control.try_clone()?).read_line(&mut line)?;
        if line.is_empty() {
            return Err(WallError::ConnectionClosed);
        }
        let port: u16 = line
            .trim()
            .parse()
            .map_err(|_| WallError::InvalidMessage(format!("datagram port {:?}", line.trim())))?;

        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(SocketAddr::new(addr.ip(), port))?;
        set_buffer_sizes(&socket, &self.nw);

        let index = self.peers.add(DatagramSink {
            socket,
            _control: control,
            buf: BytesMut::with_capacity(self.datagram_bytes),
            shaper: RateShaper::new(self.max_bandwidth),
        });
        self.frame_sizes.push(0);
        self.repace(index);
        info!(%addr, port, receiver = index, "udp stream connected");
        Ok(index)
    }

    fn set_frame_size(&mut self, receiver: usize, bytes: usize) {
        if let Some(size) = self.frame_sizes.get_mut(receiver) {
            *size = bytes;
            self.repace(receiver);
        }
    }

    fn send_grp(&mut self, receiver: usize, block: SharedBlock, config_id: u32) -> Result<usize> {
        self.peers.get_mut(receiver)?.push(block, config_id)
    }

    fn send_control(&mut self, receiver: usize, frame_id: u64, config_id: u32) -> Result<usize> {
        self.peers.get_mut(receiver)?.send_control(frame_id, config_id)
    }

    fn flush(&mut self, receiver: usize, config_id: u32) -> Result<usize> {
        self.peers.get_mut(receiver)?.flush(config_id)
    }

    fn close(&mut self, receiver: usize) {
        if let Some(sink) = self.peers.close(receiver) {
            // An empty datagram tells the receiver the stream ended.
            if let Err(e) = sink.socket.send(&[]) {
                debug!(receiver, "goodbye datagram: {e}");
            }
        }
    }

    fn close_all(&mut self) {
        for receiver in 0..self.peers.len() {
            self.close(receiver);
        }
    }

    fn receiver_count(&self) -> usize {
        self.peers.len()
    }

    fn rcv_sock_fd(&self, receiver: usize) -> Option<BorrowedFd<'_>> {
        self.peers.get(receiver)?.sink().socket_fd()
    }
}

impl Drop for UdpModule {
    fn drop(&mut self) {
        self.close_all();
    }
}

// ── Receiver side ────────────────────────────────────────────────

/// One sender's datagram socket.
///
/// A damaged or truncated datagram costs only its own group; the error
/// is non-fatal and the next datagram is read normally.
pub struct UdpGroupSource {
    socket: UdpSocket,
    _control: TcpStream,
    registration: RegistrationMessage,
    scratch: Vec<u8>,
}

impl UdpGroupSource {
    pub(crate) fn new(
        socket: UdpSocket,
        control: TcpStream,
        registration: RegistrationMessage,
    ) -> Self {
        let block_size = registration.block_size.max(1);
        let group_blocks = (registration.group_size / block_size).max(1);
        let len = (GROUP_HEADER_SIZE + group_blocks * block_size).min(MAX_DATAGRAM);
        Self {
            socket,
            _control: control,
            registration,
            scratch: vec![0; len.max(GROUP_HEADER_SIZE)],
        }
    }
}

impl GroupSource for UdpGroupSource {
    fn recv_grp(&mut self, group: &mut BlockGroup) -> Result<usize> {
        let n = self.socket.recv(&mut self.scratch)?;
        if n == 0 {
            return Err(WallError::ConnectionClosed);
        }
        let datagram = &self.scratch[..n];
        let header = GroupHeader::decode(datagram)?;
        let block_size = self.registration.block_size;
        let expected = header
            .block_count
            .checked_mul(block_size)
            .and_then(|payload| payload.checked_add(GROUP_HEADER_SIZE))
            .ok_or_else(|| {
                WallError::InvalidHeader(format!("group of {} blocks", header.block_count))
            })?;
        if n != expected {
            return Err(WallError::InvalidHeader(format!(
                "datagram of {n} bytes, header announces {expected}"
            )));
        }
        group.apply_header(&header)?;
        for i in 0..header.block_count {
            let start = GROUP_HEADER_SIZE + i * block_size;
            let block = group.block_mut(i)?;
            if block.buf_size() != block_size {
                return Err(WallError::ProtocolViolation("block size differs from registration"));
            }
            block
                .as_bytes_mut()
                .copy_from_slice(&datagram[start..start + block_size]);
            block.update_block_config()?;
        }
        Ok(n)
    }

    fn registration(&self) -> &RegistrationMessage {
        &self.registration
    }
}

impl AsFd for UdpGroupSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

// ── Tests ────────────────────────────────────────────────────────
