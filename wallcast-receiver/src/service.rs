//! Receiver service core logic.
//!
//! ```text
//!   senders ──► GroupListener ──► Receiver ──► BlockBuf ──► consumer (reader 0)
//!                                                   └─────► BridgeStreamer (reader 1) ──► downstream
//! ```
//!
//! The ring is sized from the first sender's registration, so listening
//! and accepting come before anything else is built.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use wallcast_core::{
    BlockBuf, BridgeStreamer, ConnectionDescriptor, GroupListener, ListenerWaker, ReaderStart,
    Receiver, ReceiverEvent, WallError,
};

use crate::config::ReceiverConfig;
use crate::consumer::{self, CONSUMER_READER, ConsumerStats};

/// Reader id the relay uses on the ring.
const RELAY_READER: u32 = 1;

/// How long the consumer may take to drain the ring after the senders left.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How long a stopped service waits for the accept thread to let go.
const ACCEPT_STOP_GRACE: Duration = Duration::from_secs(1);

// ── ReceiverService ──────────────────────────────────────────────

/// The top-level receiver service for one display node.
pub struct ReceiverService {
    config: ReceiverConfig,
    running: Arc<AtomicBool>,
}

impl ReceiverService {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run the service until stopped or every sender is gone.
    ///
    /// Returns what the consumer saw; `None` when the service was stopped
    /// before the senders connected.
    pub async fn run(&self) -> Result<Option<ConsumerStats>, Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);

        let listener = GroupListener::bind(
            self.config.listen_addr()?,
            self.config.listen.protocol,
            self.config.network.clone(),
        )?;
        let (events_tx, mut events) = mpsc::unbounded_channel();

        // Accepting blocks on a plain thread; a stop wakes it through the
        // listener so the socket closes with it.
        let expected = self.config.listen.senders;
        let multi_reader = self.config.relay.enabled;
        let buffer = self.config.clone();
        let waker = listener.waker()?;
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let acceptor = thread::Builder::new().name("accept".into()).spawn(move || {
            let accepted = accept_senders(&listener, expected, multi_reader, &buffer, events_tx);
            let _ = accepted_tx.send(accepted);
        })?;
        let mut receiver = tokio::select! {
            accepted = accepted_rx => accepted.map_err(|_| "accept thread exited")??,
            _ = wait_until(|| !self.running.load(Ordering::SeqCst)) => {
                info!("stopped before all senders connected");
                stop_acceptor(waker, acceptor).await;
                return Ok(None);
            }
        };
        let ring = Arc::clone(receiver.ring());

        let mut relay = if self.config.relay.enabled {
            ring.add_reader(CONSUMER_READER, ReaderStart::Tail)?;
            Some(self.start_relay(Arc::clone(&ring)).await?)
        } else {
            None
        };
        let consumer = consumer::spawn_consumer(Arc::clone(&ring))?;

        let stats_every = self.config.logging.stats_interval_secs;
        let mut stats_tick = tokio::time::interval(Duration::from_secs(stats_every.max(1)));
        stats_tick.tick().await;

        while self.running.load(Ordering::SeqCst) && receiver.is_running() {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ReceiverEvent::AppConnected { window_id, senders }) => {
                        info!(window = window_id, senders, "application connected");
                    }
                    Some(ReceiverEvent::BlockReady { frame_id }) => {
                        debug!(frame_id, "data ready");
                    }
                    None => break,
                },
                _ = stats_tick.tick(), if stats_every > 0 => {
                    let status = ring.status();
                    info!(
                        queued = status.queued,
                        free = status.free,
                        vacant = status.vacant,
                        readers = status.readers,
                        interval_ms = ring.frame_interval().map(|d| d.as_millis() as u64),
                        relayed = relay.as_ref().map(|r| r.stats().frames),
                        "ring stats"
                    );
                }
                _ = wait_until(|| {
                    !self.running.load(Ordering::SeqCst) || !receiver.is_running()
                }) => break,
            }
        }
        if !receiver.is_running() {
            warn!("senders disconnected");
            // Let the consumer see what is already queued.
            let deadline = Instant::now() + DRAIN_GRACE;
            while ring.status().queued > 0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        if let Some(relay) = relay.as_mut() {
            relay.shutdown();
        }
        receiver.shutdown();
        let stats = match consumer.join() {
            Ok(stats) => stats,
            Err(_) => {
                error!("consumer thread panicked");
                ConsumerStats::default()
            }
        };
        info!(
            frames = stats.frames,
            blocks = stats.blocks,
            layouts = stats.layouts,
            "receiver service stopped"
        );
        Ok(Some(stats))
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Connect a bridge streamer to the downstream receivers.
    async fn start_relay(&self, ring: Arc<BlockBuf>) -> Result<BridgeStreamer, WallError> {
        let cfg = &self.config.relay;
        let descriptor = ConnectionDescriptor::parse(&cfg.descriptor, cfg.local_ports)?;
        let streamer_config = self.config.relay_streamer();
        let transport = streamer_config.protocol.transport(streamer_config.max_bandwidth);

        let mut bridge = BridgeStreamer::new(streamer_config, ring, RELAY_READER)?;
        bridge.set_nw_config(&self.config.network)?;
        if !cfg.layout.trim().is_empty() {
            bridge.enqueue_msg(&cfg.layout)?;
        }
        let bridge = tokio::task::spawn_blocking(move || {
            bridge
                .init_networks(&descriptor, transport)
                .map(|()| bridge)
        })
        .await
        .map_err(|e| WallError::Other(format!("relay start: {e}")))??;
        info!(receivers = cfg.descriptor.as_str(), "relay started");
        Ok(bridge)
    }
}

/// Accept `expected` senders, sizing the ring from the first registration.
fn accept_senders(
    listener: &GroupListener,
    expected: usize,
    multi_reader: bool,
    config: &ReceiverConfig,
    events: mpsc::UnboundedSender<ReceiverEvent>,
) -> Result<Receiver, WallError> {
    let (first, reg) = listener.accept()?;
    let ring = Arc::new(BlockBuf::new(
        reg.block_size,
        reg.group_size,
        config.buffer_bytes(reg.group_size),
        multi_reader,
    )?);
    let mut receiver = Receiver::new(expected, ring, events)?;
    receiver.add_stream(first)?;
    while !receiver.is_connected() {
        let (source, _) = listener.accept()?;
        let index = receiver.add_stream(source)?;
        info!(sender = index, expected, "sender added");
    }
    Ok(receiver)
}

/// Wake the accept thread and wait a moment for it to release the
/// listener.
async fn stop_acceptor(waker: ListenerWaker, acceptor: thread::JoinHandle<()>) {
    if let Err(e) = waker.wake() {
        warn!("could not wake the accept thread: {e}");
        return;
    }
    let joined = tokio::task::spawn_blocking(move || acceptor.join());
    match tokio::time::timeout(ACCEPT_STOP_GRACE, joined).await {
        Ok(Ok(Ok(()))) => debug!("accept thread stopped"),
        Ok(_) => error!("accept thread panicked"),
        Err(_) => warn!("accept thread still busy with a connecting sender"),
    }
}

/// Resolves once `done` returns true.
async fn wait_until(done: impl Fn() -> bool) {
    loop {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wallcast_core::{NetworkConfig, Protocol, SlotPhase, Streamer, StreamerConfig};

    #[test]
    fn stop_handle_works() {
        let svc = ReceiverService::new(ReceiverConfig::default());
        let handle = svc.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(port: u16) -> ReceiverConfig {
        let mut cfg = ReceiverConfig::default();
        cfg.listen.bind = "127.0.0.1".into();
        cfg.listen.port = port;
        cfg.logging.stats_interval_secs = 0;
        cfg
    }

    #[tokio::test]
    async fn stop_while_waiting_for_senders_releases_the_port() {
        let port = free_port();
        let svc = ReceiverService::new(config(port));
        let stop = svc.stop_handle();
        let (result, ()) = tokio::join!(svc.run(), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stop.store(false, Ordering::SeqCst);
        });
        assert_eq!(result.unwrap(), None);
        // The accept thread is gone, so the port can be bound again.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[tokio::test]
    async fn frames_are_consumed_until_the_sender_leaves() {
        let port = free_port();
        let svc = ReceiverService::new(config(port));

        let sender = tokio::task::spawn_blocking(move || {
            let mut streamer = Streamer::new(StreamerConfig {
                total_width: 32,
                total_height: 32,
                block_x: 16,
                block_y: 16,
                frame_rate: 100.0,
                ..StreamerConfig::default()
            });
            streamer.enqueue_msg("1 0 0 0 32 32").unwrap();
            let descriptor =
                ConnectionDescriptor::parse(&format!("{port} 1 127.0.0.1 0"), false).unwrap();
            // The service binds asynchronously; retry until it listens.
            let mut tries = 0;
            loop {
                streamer.set_nw_config(&NetworkConfig::default()).unwrap();
                match streamer.init_networks(&descriptor, Protocol::Tcp.transport(0)) {
                    Ok(()) => break,
                    Err(e) => {
                        tries += 1;
                        assert!(tries < 100, "receiver never listened: {e}");
                        thread::sleep(Duration::from_millis(20));
                    }
                }
            }
            let frames = streamer.frame_buffer().unwrap();
            for _ in 0..3 {
                let mut slot = frames.acquire_write().unwrap();
                slot.pixels_mut().fill(5);
                slot.release();
            }
            // Both slots empty again means every frame went out.
            while frames.phases().iter().any(|p| *p != SlotPhase::Empty) {
                thread::sleep(Duration::from_millis(5));
            }
            streamer.shutdown();
        });

        let (result, sent) = tokio::time::timeout(
            Duration::from_secs(10),
            async { tokio::join!(svc.run(), sender) },
        )
        .await
        .unwrap();
        sent.unwrap();
        let stats = result.unwrap().unwrap();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.blocks, 12);
        assert_eq!(stats.layouts, 1);
    }
}
