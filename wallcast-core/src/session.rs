//! Streamers of one application, keyed by window id.

use std::collections::BTreeMap;

use tracing::info;

use crate::error::{Result, WallError};
use crate::streamer::Streamer;

/// Owns every [`Streamer`] an application runs; shutting the session
/// down stops all of them.
#[derive(Default)]
pub struct StreamSession {
    streamers: BTreeMap<u32, Streamer>,
}

impl StreamSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a streamer under its config's window id.
    pub fn insert(&mut self, streamer: Streamer) -> Result<()> {
        let window = streamer.config().window_id;
        if self.streamers.contains_key(&window) {
            return Err(WallError::Config(format!("window {window} already streams")));
        }
        self.streamers.insert(window, streamer);
        Ok(())
    }

    pub fn get(&self, window: u32) -> Option<&Streamer> {
        self.streamers.get(&window)
    }

    pub fn get_mut(&mut self, window: u32) -> Option<&mut Streamer> {
        self.streamers.get_mut(&window)
    }

    /// Queue a reconfiguration line for one window.
    pub fn enqueue_msg(&self, window: u32, text: &str) -> Result<()> {
        self.get(window)
            .ok_or_else(|| WallError::Config(format!("no streamer for window {window}")))?
            .enqueue_msg(text)
    }

    /// Detach and stop one streamer.
    pub fn remove(&mut self, window: u32) -> Option<Streamer> {
        let mut streamer = self.streamers.remove(&window)?;
        streamer.shutdown();
        Some(streamer)
    }

    pub fn windows(&self) -> impl Iterator<Item = u32> + '_ {
        self.streamers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.streamers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streamers.is_empty()
    }

    pub fn shutdown_all(&mut self) {
        for (window, streamer) in &mut self.streamers {
            streamer.shutdown();
            info!(window, "streamer shut down");
        }
        self.streamers.clear();
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamerConfig;

    fn streamer(window_id: u32) -> Streamer {
        Streamer::new(StreamerConfig {
            window_id,
            ..StreamerConfig::default()
        })
    }

    #[test]
    fn windows_are_unique() {
        let mut session = StreamSession::new();
        session.insert(streamer(3)).unwrap();
        session.insert(streamer(1)).unwrap();
        assert!(session.insert(streamer(3)).is_err());
        assert_eq!(session.windows().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn messages_route_by_window() {
        let mut session = StreamSession::new();
        session.insert(streamer(2)).unwrap();
        assert!(session.enqueue_msg(2, "rate 24").is_ok());
        assert!(session.enqueue_msg(5, "rate 24").is_err());
        assert!(session.enqueue_msg(2, "nonsense").is_err());
    }

    #[test]
    fn remove_and_shutdown() {
        let mut session = StreamSession::new();
        session.insert(streamer(1)).unwrap();
        session.insert(streamer(2)).unwrap();
        assert!(session.remove(1).is_some_and(|s| !s.is_running()));
        assert!(session.remove(1).is_none());
        session.shutdown_all();
        assert!(session.is_empty());
    }
}
