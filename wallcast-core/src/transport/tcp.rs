//! Reliable binding: one TCP stream per receiver.

use std::io::{self, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::{Result, WallError};
use crate::header::{GROUP_HEADER_SIZE, GroupHeader, RegistrationMessage};
use crate::pool::{BlockGroup, BlockReturn, SharedBlock};
use crate::transport::{
    GroupSink, GroupSource, PeerSet, Protocol, StreamProtocol, set_buffer_sizes, write_all_retry,
    write_group,
};

// ── Sender side ──────────────────────────────────────────────────

pub struct TcpSink {
    writer: BufWriter<TcpStream>,
}

impl GroupSink for TcpSink {
    fn send_group(&mut self, header: &[u8], blocks: &[SharedBlock]) -> io::Result<usize> {
        write_group(&mut self.writer, header, blocks)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn socket_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.writer.get_ref().as_fd())
    }
}

/// [`StreamProtocol`] over TCP.
pub struct TcpModule {
    peers: PeerSet<TcpSink>,
    nw: NetworkConfig,
    group_bytes: usize,
}

impl TcpModule {
    pub fn new() -> Self {
        Self {
            peers: PeerSet::new(),
            nw: NetworkConfig::default(),
            group_bytes: 0,
        }
    }
}

impl Default for TcpModule {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamProtocol for TcpModule {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn set_config(&mut self, block_size: usize, group_size: usize, nw: &NetworkConfig) -> Result<()> {
        if block_size == 0 {
            return Err(WallError::Config("block size is zero".into()));
        }
        let group_blocks = (group_size / block_size).max(1);
        self.peers.set_group_blocks(group_blocks);
        self.group_bytes = GROUP_HEADER_SIZE + group_blocks * block_size;
        self.nw = nw.clone();
        Ok(())
    }

    fn setup_block_pool(&mut self, pool: Arc<dyn BlockReturn>) {
        self.peers.set_returns(pool);
    }

    fn connect(&mut self, addr: SocketAddr, registration: &RegistrationMessage) -> Result<usize> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        set_buffer_sizes(&stream, &self.nw);
        let mut writer = BufWriter::with_capacity(self.group_bytes.max(8192), stream);
        write_all_retry(&mut writer, &registration.encode()?)?;
        writer.flush()?;
        let index = self.peers.add(TcpSink { writer });
        info!(%addr, receiver = index, "tcp stream connected");
        Ok(index)
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
        if let Some(mut sink) = self.peers.close(receiver) {
            if let Err(e) = sink.flush() {
                debug!(receiver, "flush on close: {e}");
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

impl Drop for TcpModule {
    fn drop(&mut self) {
        self.close_all();
    }
}

// ── Receiver side ────────────────────────────────────────────────

/// One sender's TCP stream, read group by group.
///
/// Reads go straight to the socket: a buffered reader could hold a whole
/// group that `poll` would then never report.
pub struct TcpGroupSource {
    stream: TcpStream,
    registration: RegistrationMessage,
}

impl TcpGroupSource {
    pub(crate) fn new(stream: TcpStream, registration: RegistrationMessage) -> Self {
        Self {
            stream,
            registration,
        }
    }
}

/// `read_exact` with end-of-stream mapped to `ConnectionClosed`.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => WallError::ConnectionClosed,
        _ => WallError::Connection(e),
    })
}

impl GroupSource for TcpGroupSource {
    fn recv_grp(&mut self, group: &mut BlockGroup) -> Result<usize> {
        let mut region = [0u8; GROUP_HEADER_SIZE];
        read_full(&mut self.stream, &mut region)?;
        // The stream cannot resynchronise after a bad header.
        let header = GroupHeader::decode(&region).map_err(|e| {
            warn!("group header: {e}");
            WallError::ProtocolViolation("malformed group header")
        })?;
        group.apply_header(&header)?;
        let block_size = self.registration.block_size;
        for i in 0..header.block_count {
            let block = group.block_mut(i)?;
            if block.buf_size() != block_size {
                return Err(WallError::ProtocolViolation("block size differs from registration"));
            }
            read_full(&mut self.stream, block.as_bytes_mut())?;
            block.update_block_config().map_err(|e| {
                warn!("block header: {e}");
                WallError::ProtocolViolation("malformed block header")
            })?;
        }
        Ok(GROUP_HEADER_SIZE + header.block_count * block_size)
    }

    fn registration(&self) -> &RegistrationMessage {
        &self.registration
    }
}

impl AsFd for TcpGroupSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::BlockFlag;
    use crate::header::{BLOCK_HEADER_SIZE, REG_MSG_SIZE};
    use crate::pool::BlockPool;
    use crate::types::Rect;
    use std::net::TcpListener;

    fn registration(block_size: usize) -> RegistrationMessage {
        RegistrationMessage::parse(&format!("0 30 7 1024 {block_size} 1 0 8 8 32 16 0 0")).unwrap()
    }

    #[test]
    fn blocks_cross_a_tcp_connection() {
        let block_size = BLOCK_HEADER_SIZE + 8 * 8 * 3;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let pool = Arc::new(BlockPool::new(block_size, 2).unwrap());
        let mut module = TcpModule::new();
        module.set_config(block_size, 2 * block_size, &NetworkConfig::default()).unwrap();
        module.setup_block_pool(pool.clone());
        let rcv = module.connect(addr, &registration(block_size)).unwrap();
        assert_eq!(module.receiver_count(), 1);
        assert!(module.rcv_sock_fd(rcv).is_some());
        assert!(module.rcv_sock_fd(5).is_none());

        let (mut stream, _) = listener.accept().unwrap();
        let mut reg = [0u8; REG_MSG_SIZE];
        stream.read_exact(&mut reg).unwrap();
        let reg = RegistrationMessage::decode(&reg).unwrap();
        assert_eq!(reg.block_size, block_size);

        let mut block = pool.take().unwrap();
        block.set_rect(Rect::new(8, 0, 8, 8));
        block.set_block_id(1);
        block.set_frame_id(1);
        block.payload_mut().fill(0xAB);
        block.update_buffer_header().unwrap();
        block.reference(1);
        module.send_grp(rcv, Arc::new(block), 2).unwrap();
        module.send_control(rcv, 1, 2).unwrap();
        module.flush(rcv, 2).unwrap();
        assert_eq!(pool.available(), 2);

        let mut source = TcpGroupSource::new(stream, reg);
        let mut group = BlockGroup::new(block_size, 2).unwrap();
        source.recv_grp(&mut group).unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group.config_id(), 2);
        let got = &group.blocks()[0];
        assert_eq!(got.header().block_id, 1);
        assert_eq!(got.rect(), Rect::new(8, 0, 8, 8));
        assert!(got.payload().iter().all(|&b| b == 0xAB));

        let mut marker = BlockGroup::new(block_size, 2).unwrap();
        source.recv_grp(&mut marker).unwrap();
        assert_eq!(marker.flag(), BlockFlag::EndFrame);
        assert!(marker.is_empty());

        module.close_all();
        assert!(matches!(
            source.recv_grp(&mut marker),
            Err(WallError::ConnectionClosed)
        ));
    }

    #[test]
    fn garbage_header_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        client.write_all(&[b'x'; GROUP_HEADER_SIZE]).unwrap();

        let mut source = TcpGroupSource::new(stream, registration(BLOCK_HEADER_SIZE + 192));
        let mut group = BlockGroup::new(BLOCK_HEADER_SIZE + 192, 1).unwrap();
        let err = source.recv_grp(&mut group).unwrap_err();
        assert!(err.is_fatal());
    }
}
