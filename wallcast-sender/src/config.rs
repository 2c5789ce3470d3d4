//! Configuration for the sender service.

use std::path::Path;

use serde::{Deserialize, Serialize};

use wallcast_core::{ConnectionDescriptor, NetworkConfig, StreamerConfig};

use crate::source::Pattern;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Image, block and pacing settings of the streamer.
    pub streamer: StreamerConfig,
    /// Socket settings.
    pub network: NetworkConfig,
    /// Where the receivers are.
    pub connection: ConnectionConfig,
    /// Reconfiguration control port.
    pub control: ControlConfig,
    /// Synthetic frame producer.
    pub source: SourceConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Receiver endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// `"<basePort> <rcvNum> (<ip> [<localPort>] <nodeId>)*"`.
    pub descriptor: String,
    /// Every descriptor entry carries its own port.
    pub local_ports: bool,
    /// Layout applied before the first frame. Empty sends the whole
    /// image to every receiver.
    pub initial_layout: String,
}

/// Line-based TCP control port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub bind: String,
    /// 0 disables the control port.
    pub port: u16,
}

/// Synthetic frame producer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub pattern: Pattern,
    /// Frames to produce before stopping; 0 runs until shut down.
    pub frames: u64,
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

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            descriptor: "7000 1 127.0.0.1 0".into(),
            local_ports: false,
            initial_layout: String::new(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7100,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            pattern: Pattern::Gradient,
            frames: 0,
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

impl SenderConfig {
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

    /// Streamer settings with out-of-range values corrected.
    pub fn streamer_config(&self) -> StreamerConfig {
        let mut cfg = self.streamer.clone();
        cfg.normalize();
        cfg
    }

    pub fn descriptor(&self) -> wallcast_core::Result<ConnectionDescriptor> {
        ConnectionDescriptor::parse(&self.connection.descriptor, self.connection.local_ports)
    }

    /// The layout line for the first frame.
    pub fn initial_layout(&self, descriptor: &ConnectionDescriptor) -> String {
        if !self.connection.initial_layout.trim().is_empty() {
            return self.connection.initial_layout.clone();
        }
        let region = self.streamer.image_region();
        let mut line = descriptor.receivers.len().to_string();
        for rcv in &descriptor.receivers {
            line.push_str(&format!(
                " {} {} {} {} {}",
                rcv.node_id, region.x, region.y, region.width, region.height
            ));
        }
        line
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&SenderConfig::default()).unwrap();
        assert!(text.contains("descriptor"));
        assert!(text.contains("frame_rate"));
        assert!(text.contains("stats_interval_secs"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&SenderConfig::default()).unwrap();
        let parsed: SenderConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.control.port, 7100);
        assert_eq!(parsed.streamer, StreamerConfig::default());
        assert_eq!(parsed.source.pattern, Pattern::Gradient);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: SenderConfig = toml::from_str(
            "[streamer]\ntotal_width = 640\nprotocol = \"udp\"\n[source]\npattern = \"solid\"\n",
        )
        .unwrap();
        assert_eq!(parsed.streamer.total_width, 640);
        assert_eq!(parsed.streamer.total_height, 1080);
        assert_eq!(parsed.source.pattern, Pattern::Solid);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn streamer_config_clamps() {
        let mut cfg = SenderConfig::default();
        cfg.streamer.frame_rate = 0.0;
        cfg.streamer.node_num = 0;
        let streamer = cfg.streamer_config();
        assert_eq!(streamer.frame_rate, 30.0);
        assert_eq!(streamer.node_num, 1);
    }

    #[test]
    fn default_layout_covers_every_receiver() {
        let mut cfg = SenderConfig::default();
        cfg.streamer.total_width = 64;
        cfg.streamer.total_height = 32;
        cfg.connection.descriptor = "7000 2 10.0.0.1 3 10.0.0.2 4".into();
        let descriptor = cfg.descriptor().unwrap();
        assert_eq!(
            cfg.initial_layout(&descriptor),
            "2 3 0 0 64 32 4 0 0 64 32"
        );

        cfg.connection.initial_layout = "1 3 0 0 32 32".into();
        assert_eq!(cfg.initial_layout(&descriptor), "1 3 0 0 32 32");
    }
}
