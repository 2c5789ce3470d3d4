//! wallcast receiver: entry point.
//!
//! ```text
//! wallcast-receiver                    Listen with wallcast-receiver.toml
//! wallcast-receiver --config <path>    Use custom config TOML
//! wallcast-receiver --senders <n>      Expected senders (overrides config)
//! wallcast-receiver --gen-config       Dump default config and exit
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wallcast_receiver::config::ReceiverConfig;
use wallcast_receiver::service::ReceiverService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "wallcast-receiver", about = "Receive pixel-block streams for a display node")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "wallcast-receiver.toml")]
    config: PathBuf,

    /// Base port to listen on (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// Number of senders per frame (overrides config).
    #[arg(short, long)]
    senders: Option<usize>,

    /// Write the default configuration to this path and exit.
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ReceiverConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    if let Some(path) = &cli.write_config {
        ReceiverConfig::write_default(path)?;
        println!("Default config written to {}.", path.display());
        return Ok(());
    }

    let mut config = ReceiverConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.listen.port = port;
    }
    if let Some(senders) = cli.senders {
        config.listen.senders = senders;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("wallcast-receiver v{}", env!("CARGO_PKG_VERSION"));
    info!("listen: {}:{} ({})", config.listen.bind, config.listen.port, config.listen.protocol);
    info!("senders per frame: {}", config.listen.senders);
    if config.relay.enabled {
        info!("relay to: {}", config.relay.descriptor);
    }

    let service = ReceiverService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, Ordering::SeqCst);
    });

    if let Some(stats) = service.run().await? {
        info!(frames = stats.frames, last_frame = stats.last_frame, "done");
    }

    Ok(())
}
