//! Line-based TCP control port.
//!
//! ```text
//! client → "2 0 0 0 960 1080 1 960 0 960 1080"   layout, applied next frame
//!        ← "ok"
//! client → "rate 24"                              frame-rate change
//!        ← "ok"
//! client → "stats"
//!        ← "frames=120 bytes=9437184 bps=75497472"
//! client → "resend"                               async mode only
//!        ← "ok" | "busy" | "error: …"
//! ```
//!
//! Every line is answered with exactly one line.

use std::sync::{Arc, Mutex, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use wallcast_core::StreamSession;

/// Longest accepted control line.
const MAX_LINE: usize = 4096;

/// Answer one control line for `window`.
pub fn handle_line(session: &Mutex<StreamSession>, window: u32, line: &str) -> String {
    let session = session.lock().unwrap_or_else(PoisonError::into_inner);
    match line.trim() {
        "stats" => match session.get(window) {
            Some(streamer) => {
                let s = streamer.stats();
                format!("frames={} bytes={} bps={}", s.frames, s.bytes, s.bandwidth_bps)
            }
            None => format!("error: no streamer for window {window}"),
        },
        "resend" => match session.get(window).map(|s| s.resend()) {
            Some(Ok(true)) => "ok".into(),
            Some(Ok(false)) => "busy".into(),
            Some(Err(e)) => format!("error: {e}"),
            None => format!("error: no streamer for window {window}"),
        },
        text => match session.enqueue_msg(window, text) {
            Ok(()) => "ok".into(),
            Err(e) => format!("error: {e}"),
        },
    }
}

/// Serve one control client until it disconnects.
pub async fn serve_client(stream: TcpStream, session: Arc<Mutex<StreamSession>>, window: u32) {
    let peer = stream.peer_addr().ok();
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(?peer, "control read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&session, window, &line);
        debug!(?peer, %line, %reply, "control line");
        if let Err(e) = lines.send(reply).await {
            warn!(?peer, "control write error: {e}");
            break;
        }
    }
    info!(?peer, "control client disconnected");
}

// ── Tests ────────────────────────────────────────────────────────
