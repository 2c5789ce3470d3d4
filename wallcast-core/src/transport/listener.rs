//! Accepting sender connections on the receive side.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};

use tracing::info;

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::header::{REG_MSG_SIZE, RegistrationMessage};
use crate::transport::tcp::{TcpGroupSource, read_full};
use crate::transport::udp::UdpGroupSource;
use crate::transport::{GroupSource, Protocol, set_buffer_sizes};

/// Listens for streamers of one protocol.
pub struct GroupListener {
    listener: TcpListener,
    protocol: Protocol,
    nw: NetworkConfig,
}

impl GroupListener {
    pub fn bind(addr: SocketAddr, protocol: Protocol, nw: NetworkConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!(addr = %listener.local_addr()?, %protocol, "listening for streams");
        Ok(Self {
            listener,
            protocol,
            nw,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Handle that unblocks a thread parked in [`GroupListener::accept`].
    pub fn waker(&self) -> Result<ListenerWaker> {
        let mut addr = self.local_addr()?;
        if addr.ip().is_unspecified() {
            addr.set_ip(match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        Ok(ListenerWaker { addr })
    }

    /// Wait for the next streamer and read its registration.
    pub fn accept(&self) -> Result<(Box<dyn GroupSource>, RegistrationMessage)> {
        let (mut stream, peer) = self.listener.accept()?;
        set_buffer_sizes(&stream, &self.nw);
        let mut region = [0u8; REG_MSG_SIZE];
        read_full(&mut stream, &mut region)?;
        let registration = RegistrationMessage::decode(&region)?;
        info!(
            %peer,
            window = registration.window_id,
            block_size = registration.block_size,
            "stream registered"
        );

        let source: Box<dyn GroupSource> = match self.protocol {
            Protocol::Tcp => Box::new(TcpGroupSource::new(stream, registration.clone())),
            Protocol::Udp => {
                let socket = UdpSocket::bind((stream.local_addr()?.ip(), 0))?;
                set_buffer_sizes(&socket, &self.nw);
                let port = socket.local_addr()?.port();
                writeln!(stream, "{port}")?;
                Box::new(UdpGroupSource::new(socket, stream, registration.clone()))
            }
        };
        Ok((source, registration))
    }
}

// ── ListenerWaker ────────────────────────────────────────────────

/// Connects to a listener and hangs up without registering, so a pending
/// `accept` fails with [`WallError::ConnectionClosed`](crate::WallError).
#[derive(Debug, Clone, Copy)]
pub struct ListenerWaker {
    addr: SocketAddr,
}

impl ListenerWaker {
    pub fn wake(&self) -> Result<()> {
        drop(TcpStream::connect(self.addr)?);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::BlockFlag;
    use crate::header::BLOCK_HEADER_SIZE;
    use crate::pool::{BlockGroup, BlockPool};
    use crate::transport::StreamProtocol;
    use crate::transport::udp::UdpModule;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn waker_unblocks_accept() {
        let listener = GroupListener::bind(
            "0.0.0.0:0".parse().unwrap(),
            Protocol::Tcp,
            NetworkConfig::default(),
        )
        .unwrap();
        let waker = listener.waker().unwrap();
        let acceptor = thread::spawn(move || listener.accept().map(|(_, reg)| reg));
        thread::sleep(std::time::Duration::from_millis(50));
        waker.wake().unwrap();
        let err = acceptor.join().unwrap().unwrap_err();
        assert!(matches!(err, crate::WallError::ConnectionClosed), "{err:?}");
    }

    #[test]
    fn udp_stream_registers_and_delivers() {
        let block_size = BLOCK_HEADER_SIZE + 4 * 4 * 3;
        let listener = GroupListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Protocol::Udp,
            NetworkConfig::default(),
        )
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = thread::spawn(move || listener.accept().unwrap());

        let reg = RegistrationMessage::parse(&format!(
            "0 30 1 {} {block_size} 1 0 4 4 8 8 0 0",
            2 * block_size
        ))
        .unwrap();
        let pool = Arc::new(BlockPool::new(block_size, 1).unwrap());
        let mut udp = UdpModule::new(0);
        udp.set_config(block_size, 2 * block_size, &NetworkConfig::default())
            .unwrap();
        udp.setup_block_pool(pool.clone());
        let rcv = udp.connect(addr, &reg).unwrap();
        let (mut source, got) = acceptor.join().unwrap();
        assert_eq!(got, reg);

        let mut block = pool.take().unwrap();
        block.set_frame_id(3);
        block.set_block_id(2);
        block.update_buffer_header().unwrap();
        block.reference(1);
        udp.send_grp(rcv, Arc::new(block), 0).unwrap();
        udp.send_control(rcv, 3, 0).unwrap();
        assert_eq!(pool.available(), 1);

        let mut group = BlockGroup::new(block_size, 2).unwrap();
        source.recv_grp(&mut group).unwrap();
        assert_eq!((group.len(), group.frame_id()), (1, 3));
        assert_eq!(group.blocks()[0].header().block_id, 2);
        source.recv_grp(&mut group).unwrap();
        assert_eq!(group.flag(), BlockFlag::EndFrame);

        udp.close(rcv);
        assert!(source.recv_grp(&mut group).is_err());
    }
}
