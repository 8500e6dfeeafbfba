//! vmcast relay entry point.
//!
//! ```text
//! vmcast-relay                  Run in the foreground
//! vmcast-relay --config <path>  Load a custom config TOML
//! vmcast-relay --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vmcast_relay::config::RelayConfig;
use vmcast_relay::service::RelayService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vmcast-relay", about = "Streams a desktop application to browsers")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vmcast-relay.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&RelayConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = RelayConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("vmcast-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("app: {} ({})", config.app.name, config.app.mode);
    info!("agent port: {}", config.network.agent_port);
    info!(
        "rtp ports: video {} audio {}",
        config.network.video_rtp_port, config.network.audio_rtp_port
    );
    info!("screen: {}x{}", config.app.screen_width, config.app.screen_height);

    let service = RelayService::new(config);
    let stop = service.shutdown_token();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("ctrl-c received, shutting down");
        stop.cancel();
    });

    service.run().await?;

    Ok(())
}
