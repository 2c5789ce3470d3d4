//! wallcast sender: entry point.
//!
//! ```text
//! wallcast-sender                     Run with wallcast-sender.toml
//! wallcast-sender --config <path>     Load a custom config TOML
//! wallcast-sender --connect <desc>    Override the connection descriptor
//! wallcast-sender --gen-config        Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wallcast_sender::config::SenderConfig;
use wallcast_sender::service::SenderService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "wallcast-sender", about = "Stream frames to a tiled display wall")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "wallcast-sender.toml")]
    config: PathBuf,

    /// Connection descriptor (overrides config).
    /// Example: "7000 2 10.0.0.1 0 10.0.0.2 1"
    #[arg(long)]
    connect: Option<String>,

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

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&SenderConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    if let Some(path) = &cli.write_config {
        SenderConfig::write_default(path)?;
        println!("Default config written to {}.", path.display());
        return Ok(());
    }

    let mut config = SenderConfig::load(&cli.config);
    if let Some(descriptor) = cli.connect {
        config.connection.descriptor = descriptor;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("wallcast-sender v{}", env!("CARGO_PKG_VERSION"));
    info!("window: {}", config.streamer.window_id);
    info!("protocol: {}", config.streamer.protocol);
    info!("receivers: {}", config.connection.descriptor);
    info!(
        "image: {}x{} at {} fps",
        config.streamer.total_width, config.streamer.total_height, config.streamer.frame_rate
    );

    let service = SenderService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
