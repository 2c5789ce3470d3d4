//! Receiver configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use wallcast_core::{NetworkConfig, Protocol, StreamerConfig};

/// Top-level configuration for one display node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Where senders connect.
    pub listen: ListenConfig,
    /// Socket settings.
    pub network: NetworkConfig,
    /// Ring buffer sizing.
    pub buffer: BufferConfig,
    /// Optional forwarding of received blocks to further nodes.
    pub relay: RelayConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Listening socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub bind: String,
    /// Base port; the protocol's offset is added.
    pub port: u16,
    pub protocol: Protocol,
    /// Senders that contribute to each frame.
    pub senders: usize,
}

/// Ring buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Capacity in groups of the senders' group size.
    pub groups: usize,
}

/// Relay of the received stream to downstream receivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    /// Downstream receivers, same format as the sender's descriptor.
    pub descriptor: String,
    pub local_ports: bool,
    /// Block ranges per downstream receiver: `"<n> (<rcvId> <first> <last>)*"`.
    pub layout: String,
    /// Geometry and pacing of the relayed image; block size comes from
    /// the upstream registration.
    pub streamer: StreamerConfig,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Seconds between statistics lines; 0 disables them.
    pub stats_interval_secs: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7000,
            protocol: Protocol::Tcp,
            senders: 1,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { groups: 64 }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            descriptor: "7200 1 127.0.0.1 0".into(),
            local_ports: false,
            layout: String::new(),
            streamer: StreamerConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            stats_interval_secs: 5,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ReceiverConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Listening address with the protocol's port offset applied.
    pub fn listen_addr(&self) -> Result<std::net::SocketAddr, std::net::AddrParseError> {
        let port = self
            .listen
            .port
            .saturating_add(self.listen.protocol.port_offset());
        format!("{}:{port}", self.listen.bind).parse()
    }

    /// Ring size in bytes for `group_size`-byte groups.
    pub fn buffer_bytes(&self, group_size: usize) -> usize {
        self.buffer.groups.max(4) * group_size
    }

    /// Relay streamer settings; relays are fed by every upstream sender.
    pub fn relay_streamer(&self) -> StreamerConfig {
        let mut cfg = self.relay.streamer.clone();
        cfg.from_bridge_parallel = self.listen.senders > 1;
        cfg.normalize();
        cfg
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&ReceiverConfig::default()).unwrap();
        assert!(text.contains("senders"));
        assert!(text.contains("[relay.streamer]"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&ReceiverConfig::default()).unwrap();
        let parsed: ReceiverConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.listen.port, 7000);
        assert_eq!(parsed.buffer.groups, 64);
        assert!(!parsed.relay.enabled);
    }

    #[test]
    fn udp_listens_on_the_offset_port() {
        let mut cfg = ReceiverConfig::default();
        assert_eq!(cfg.listen_addr().unwrap().port(), 7000);
        cfg.listen.protocol = Protocol::Udp;
        assert_eq!(cfg.listen_addr().unwrap().port(), 7001);
    }

    #[test]
    fn buffer_has_a_floor() {
        let mut cfg = ReceiverConfig::default();
        cfg.buffer.groups = 1;
        assert_eq!(cfg.buffer_bytes(1000), 4000);
    }

    #[test]
    fn relay_is_parallel_with_several_senders() {
        let mut cfg = ReceiverConfig::default();
        assert!(!cfg.relay_streamer().from_bridge_parallel);
        cfg.listen.senders = 3;
        assert!(cfg.relay_streamer().from_bridge_parallel);
    }
}
