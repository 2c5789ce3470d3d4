//! Sender service core logic.
//!
//! Owns the stream session, the synthetic producer and the control
//! listener, and ties their lifetimes to one running flag.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use wallcast_core::{StreamSession, Streamer};

use crate::config::SenderConfig;
use crate::control;
use crate::source;

// ── SenderService ────────────────────────────────────────────────

/// The top-level sender service.
///
/// Connects one streamer to its receivers, feeds it synthetic frames and
/// accepts reconfiguration lines until stopped.
pub struct SenderService {
    config: SenderConfig,
    running: Arc<AtomicBool>,
}

impl SenderService {
    pub fn new(config: SenderConfig) -> Self {
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

    /// Run the service until stopped.
    ///
    /// 1. Prepares the streamer and connects to every receiver.
    /// 2. Queues the initial layout and starts the producer thread.
    /// 3. Serves the control port and logs statistics.
    /// 4. Shuts everything down when `running` becomes `false` or the
    ///    producer finishes.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);

        let streamer_config = self.config.streamer_config();
        let window = streamer_config.window_id;
        let protocol = streamer_config.protocol;
        let max_bandwidth = streamer_config.max_bandwidth;
        let descriptor = self.config.descriptor()?;
        let layout = self.config.initial_layout(&descriptor);

        let mut streamer = Streamer::new(streamer_config);
        let geometry = streamer.set_nw_config(&self.config.network)?;
        info!(
            block_x = geometry.block_x,
            block_y = geometry.block_y,
            block_size = geometry.block_size,
            group_size = geometry.group_size,
            "block geometry"
        );
        streamer.enqueue_msg(&layout)?;

        // Connecting blocks until every receiver accepted.
        let streamer = tokio::task::spawn_blocking(move || {
            streamer
                .init_networks(&descriptor, protocol.transport(max_bandwidth))
                .map(|()| streamer)
        })
        .await??;
        let frames = streamer
            .frame_buffer()
            .ok_or("streamer has no frame buffer")?;

        let session = Arc::new(Mutex::new(StreamSession::new()));
        session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(streamer)?;

        let producer = source::spawn_producer(
            frames,
            self.config.source.pattern,
            self.config.source.frames,
            Arc::clone(&self.running),
        )?;

        let listener = if self.config.control.port == 0 {
            None
        } else {
            let addr: SocketAddr =
                format!("{}:{}", self.config.control.bind, self.config.control.port).parse()?;
            let listener = TcpListener::bind(addr).await?;
            info!("control port listening on {addr}");
            Some(listener)
        };

        let stats_every = self.config.logging.stats_interval_secs;
        let mut stats_tick =
            tokio::time::interval(Duration::from_secs(stats_every.max(1)));
        stats_tick.tick().await;

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                accepted = accept(listener.as_ref()) => match accepted {
                    Ok((stream, peer)) => {
                        info!("control client connected from {peer}");
                        tokio::spawn(control::serve_client(stream, Arc::clone(&session), window));
                    }
                    Err(e) => warn!("accept error: {e}"),
                },
                _ = stats_tick.tick(), if stats_every > 0 => {
                    self.log_stats(&session, window);
                }
                _ = wait_for_stop(&self.running, &producer) => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.log_stats(&session, window);
        session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown_all();
        match producer.join() {
            Ok(n) => info!(frames = n, "sender service stopped"),
            Err(_) => error!("producer thread panicked"),
        }
        Ok(())
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn log_stats(&self, session: &Mutex<StreamSession>, window: u32) {
        let session = session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(streamer) = session.get(window) {
            let s = streamer.stats();
            info!(
                window,
                frames = s.frames,
                bytes = s.bytes,
                bps = s.bandwidth_bps,
                running = streamer.is_running(),
                "stream stats"
            );
        }
    }
}

// ── Internal ─────────────────────────────────────────────────────

/// Accept on the control listener; never resolves when there is none.
async fn accept(
    listener: Option<&TcpListener>,
) -> std::io::Result<(tokio::net::TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Resolves when `running` becomes false or the producer has finished.
async fn wait_for_stop(running: &AtomicBool, producer: &std::thread::JoinHandle<u64>) {
    loop {
        if !running.load(Ordering::SeqCst) || producer.is_finished() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────
