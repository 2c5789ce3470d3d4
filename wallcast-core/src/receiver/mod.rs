//! Receive side: one reader thread per application.
//!
//! The [`Receiver`] polls one socket per sender plus a local wake socket,
//! reads whole groups into slots taken from the application's
//! [`BlockBuf`], and lets a [`FrameAssembler`] decide what reaches the
//! ring and when a frame is complete. Senders whose next group belongs to
//! a later frame drop out of the poll set until the others catch up.
//!
//! ```text
//!   sender 0 ─┐
//!   sender 1 ─┼─▶ poll ─▶ recv_grp ─▶ FrameAssembler ─▶ BlockBuf ─▶ consumer
//!   sender N ─┘    ▲
//!   wake pair ─────┘ (shutdown)
//! ```

pub mod assembler;

use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Result, WallError};
use crate::pool::BlockBuf;
use crate::transport::GroupSource;

pub use assembler::FrameAssembler;

/// Notifications for the application's consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    /// Every expected sender has registered.
    AppConnected { window_id: u32, senders: usize },
    /// Data was queued while the consumer was waiting for it.
    BlockReady { frame_id: u64 },
}

// ── Stream registry ──────────────────────────────────────────────

#[derive(Default)]
struct Streams {
    sources: Vec<Box<dyn GroupSource>>,
    complete: bool,
    shutdown: bool,
}

/// Senders registered so far; the reader thread waits here until all of
/// them are in.
#[derive(Default)]
struct Registry {
    state: Mutex<Streams>,
    connected: Condvar,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, Streams> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the full sender set to the reader, or `None` on shutdown.
    fn wait_complete(&self) -> Option<Vec<Box<dyn GroupSource>>> {
        let mut st = self.lock();
        while !st.complete && !st.shutdown {
            st = self.connected.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        if st.shutdown {
            return None;
        }
        Some(std::mem::take(&mut st.sources))
    }

    fn shutdown(&self) {
        self.lock().shutdown = true;
        self.connected.notify_all();
    }
}

// ── Receiver ─────────────────────────────────────────────────────

/// Multi-sender reader for one application.
pub struct Receiver {
    expected: usize,
    registered: usize,
    ring: Arc<BlockBuf>,
    registry: Arc<Registry>,
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ReceiverEvent>,
    wake: UnixStream,
    thread: Option<JoinHandle<()>>,
}

impl Receiver {
    /// Start the reader thread; it stays idle until `expected` senders
    /// were added with [`add_stream`](Self::add_stream).
    pub fn new(
        expected: usize,
        ring: Arc<BlockBuf>,
        events: mpsc::UnboundedSender<ReceiverEvent>,
    ) -> Result<Self> {
        if expected == 0 {
            return Err(WallError::Config("a receiver needs at least one sender".into()));
        }
        let (wake, wake_rx) = UnixStream::pair()?;
        let registry = Arc::new(Registry::default());
        let running = Arc::new(AtomicBool::new(true));
        let ctx = ReaderContext {
            ring: Arc::clone(&ring),
            registry: Arc::clone(&registry),
            running: Arc::clone(&running),
            events: events.clone(),
            wake: wake_rx,
        };
        let thread = thread::Builder::new()
            .name("receiver".into())
            .spawn(move || read_data(ctx))?;
        Ok(Self {
            expected,
            registered: 0,
            ring,
            registry,
            running,
            events,
            wake,
            thread: Some(thread),
        })
    }

    /// Register the next sender. Returns its index.
    pub fn add_stream(&mut self, source: Box<dyn GroupSource>) -> Result<usize> {
        if self.registered == self.expected {
            return Err(WallError::Config(format!(
                "all {} senders already registered",
                self.expected
            )));
        }
        let reg = source.registration().clone();
        if reg.block_size != self.ring.block_size() {
            return Err(WallError::InvalidRegistration(format!(
                "block size {} does not match buffer block size {}",
                reg.block_size,
                self.ring.block_size()
            )));
        }
        if reg.group_size / reg.block_size.max(1) > self.ring.group_blocks() {
            return Err(WallError::InvalidRegistration(format!(
                "groups of {} bytes exceed the buffer's group slots",
                reg.group_size
            )));
        }

        let index = self.registered;
        self.registered += 1;
        let complete = self.registered == self.expected;
        {
            let mut st = self.registry.lock();
            st.sources.push(source);
            st.complete = complete;
        }
        debug!(sender = index, window = reg.window_id, "sender added");
        if complete {
            self.registry.connected.notify_all();
            info!(window = reg.window_id, senders = self.expected, "application connected");
            let _ = self.events.send(ReceiverEvent::AppConnected {
                window_id: reg.window_id,
                senders: self.expected,
            });
        }
        Ok(index)
    }

    pub fn expected_senders(&self) -> usize {
        self.expected
    }

    pub fn is_connected(&self) -> bool {
        self.registered == self.expected
    }

    pub fn ring(&self) -> &Arc<BlockBuf> {
        &self.ring
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the reader: wake it, release the ring, join it. Sockets close
    /// when the thread drops them.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.registry.shutdown();
        if let Err(e) = (&self.wake).write_all(&[1]) {
            debug!("wake write: {e}");
        }
        self.ring.release_lock();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("receiver thread panicked");
            }
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Reader thread ────────────────────────────────────────────────

struct ReaderContext {
    ring: Arc<BlockBuf>,
    registry: Arc<Registry>,
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ReceiverEvent>,
    wake: UnixStream,
}

fn read_data(ctx: ReaderContext) {
    let Some(mut sources) = ctx.registry.wait_complete() else {
        return;
    };
    let mut asm = FrameAssembler::new(sources.len());
    let result = poll_loop(&ctx, &mut sources, &mut asm);
    asm.drain(&ctx.ring);
    ctx.running.store(false, Ordering::SeqCst);
    match result {
        Ok(()) => info!(frame_id = asm.cur_frame(), "receiver stopped"),
        Err(e) => error!(frame_id = asm.cur_frame(), "receiver stopped: {e}"),
    }
}

fn poll_loop(
    ctx: &ReaderContext,
    sources: &mut [Box<dyn GroupSource>],
    asm: &mut FrameAssembler,
) -> Result<()> {
    while ctx.running.load(Ordering::SeqCst) {
        let Some(ready) = wait_readable(sources, asm, &ctx.wake)? else {
            break;
        };
        for sender in ready {
            let Some(mut group) = ctx.ring.get_free_group() else {
                return Ok(());
            };
            if let Err(e) = sources[sender].recv_grp(&mut group) {
                ctx.ring.recycle(group);
                match e {
                    WallError::ConnectionClosed => {
                        info!(sender, "sender disconnected");
                        return Ok(());
                    }
                    e if e.is_fatal() => return Err(e),
                    e => {
                        warn!(sender, "group dropped: {e}");
                        continue;
                    }
                }
            }

            let frame_id = group.frame_id();
            match asm.on_group(sender, group, &ctx.ring) {
                Ok(true) => {
                    let _ = ctx.events.send(ReceiverEvent::BlockReady {
                        frame_id: asm.cur_frame(),
                    });
                }
                Ok(false) => {}
                Err(e) if !e.is_fatal() => warn!(sender, frame_id, "group discarded: {e}"),
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

/// Block until an armed sender or the wake socket is readable.
///
/// `None` when woken for shutdown.
fn wait_readable(
    sources: &[Box<dyn GroupSource>],
    asm: &FrameAssembler,
    wake: &UnixStream,
) -> Result<Option<Vec<usize>>> {
    let armed: Vec<usize> = (0..sources.len()).filter(|&i| !asm.is_paused(i)).collect();
    let mut fds: Vec<PollFd> = armed
        .iter()
        .map(|&i| PollFd::new(sources[i].as_fd(), PollFlags::POLLIN))
        .collect();
    fds.push(PollFd::new(wake.as_fd(), PollFlags::POLLIN));

    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let readable = |fd: &PollFd| {
        fd.revents().is_some_and(|r| {
            r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
        })
    };
    if fds.last().is_some_and(readable) {
        return Ok(None);
    }
    Ok(Some(
        armed
            .iter()
            .zip(&fds)
            .filter(|(_, fd)| readable(fd))
            .map(|(&i, _)| i)
            .collect(),
    ))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::flags::BlockFlag;
    use crate::header::{BLOCK_HEADER_SIZE, RegistrationMessage};
    use crate::pool::BlockPool;
    use crate::transport::listener::GroupListener;
    use crate::transport::tcp::TcpModule;
    use crate::transport::{Protocol, StreamProtocol};
    use std::time::{Duration, Instant};

    const BLOCK: usize = BLOCK_HEADER_SIZE + 4 * 4 * 3;

    fn registration() -> RegistrationMessage {
        RegistrationMessage::parse(&format!("0 30 9 {} {BLOCK} 2 0 4 4 16 8 0 0", 2 * BLOCK))
            .unwrap()
    }

    struct Sender {
        module: TcpModule,
        pool: Arc<BlockPool>,
        rcv: usize,
    }

    impl Sender {
        fn send_frame(&mut self, frame_id: u64, ids: &[u32]) {
            for &id in ids {
                let mut b = self.pool.take().unwrap();
                b.set_block_id(id);
                b.set_frame_id(frame_id);
                b.update_buffer_header().unwrap();
                b.reference(1);
                self.module.send_grp(self.rcv, Arc::new(b), 1).unwrap();
            }
            self.module.send_control(self.rcv, frame_id, 1).unwrap();
            self.module.flush(self.rcv, 1).unwrap();
        }
    }

    /// Two TCP senders connected to a running receiver.
    fn setup() -> (
        Receiver,
        Vec<Sender>,
        mpsc::UnboundedReceiver<ReceiverEvent>,
    ) {
        let listener = GroupListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Protocol::Tcp,
            NetworkConfig::default(),
        )
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let ring = Arc::new(BlockBuf::new(BLOCK, 2 * BLOCK, 64 * BLOCK, false).unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut receiver = Receiver::new(2, ring, tx).unwrap();

        let mut senders = Vec::new();
        for _ in 0..2 {
            let pool = Arc::new(BlockPool::new(BLOCK, 8).unwrap());
            let mut module = TcpModule::new();
            module
                .set_config(BLOCK, 2 * BLOCK, &NetworkConfig::default())
                .unwrap();
            module.setup_block_pool(pool.clone());
            let rcv = module.connect(addr, &registration()).unwrap();
            let (source, _) = listener.accept().unwrap();
            receiver.add_stream(source).unwrap();
            senders.push(Sender { module, pool, rcv });
        }
        (receiver, senders, rx)
    }

    fn collect(ring: &BlockBuf, until: usize) -> Vec<(BlockFlag, u64)> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while out.len() < until {
            assert!(Instant::now() < deadline, "timed out with {out:?}");
            match ring.front(0) {
                Some(g) => {
                    out.push((g.flag(), g.frame_id()));
                    ring.next(0);
                }
                None => thread::sleep(Duration::from_millis(2)),
            }
        }
        out
    }

    #[test]
    fn frames_from_two_senders_are_merged() {
        let (mut receiver, mut senders, mut events) = setup();
        assert!(receiver.is_connected());
        assert_eq!(
            events.try_recv().unwrap(),
            ReceiverEvent::AppConnected {
                window_id: 9,
                senders: 2
            }
        );

        senders[0].send_frame(1, &[0, 1]);
        senders[1].send_frame(1, &[2, 3]);
        senders[0].send_frame(2, &[0]);
        let got = collect(receiver.ring(), 4);
        assert_eq!(got[0], (BlockFlag::ConfigUpdate, 1));
        assert_eq!(got[3], (BlockFlag::EndFrame, 1));
        // Frame 2 waits until sender 1 finished frame 1, which it did.
        let got = collect(receiver.ring(), 1);
        assert_eq!(got, vec![(BlockFlag::PixelData, 2)]);

        receiver.shutdown();
        assert!(!receiver.is_running());
    }

    #[test]
    fn sender_disconnect_stops_the_reader() {
        let (receiver, mut senders, _events) = setup();
        senders[0].module.close_all();
        let deadline = Instant::now() + Duration::from_secs(5);
        while receiver.is_running() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn shutdown_before_connection_completes() {
        let ring = Arc::new(BlockBuf::new(BLOCK, BLOCK, 8 * BLOCK, false).unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut receiver = Receiver::new(3, ring, tx).unwrap();
        assert!(!receiver.is_connected());
        receiver.shutdown();
        assert!(!receiver.is_running());
    }

    #[test]
    fn zero_senders_rejected() {
        let ring = Arc::new(BlockBuf::new(BLOCK, BLOCK, 8 * BLOCK, false).unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(Receiver::new(0, ring, tx).is_err());
    }
}
