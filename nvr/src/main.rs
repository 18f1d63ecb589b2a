mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use nvr_core::{bootstrap::load_config, logging};

use server::NvrServer;

/// Network video recorder: RTSP cameras to HLS and rotating MP4 archives.
#[derive(Debug, Parser)]
#[command(name = "nvr", version, about)]
struct Cli {
    /// Config file (YAML, TOML or JSON)
    #[arg(long, env = "NVR_CONFIG_PATH")]
    config: Option<String>,

    /// Overrides logging.level
    #[arg(long)]
    log_level: Option<String>,

    /// Always use the in-process HLS writer
    #[arg(long)]
    force_native_hls: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.force_native_hls {
        config.recording.force_native_hls = true;
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("NVR starting...");
    info!("Broker API: {}", config.broker.api_base_url());

    // 3. Broker, registry, monitor and sessions
    let server = NvrServer::init(&config).await?;

    // 4. Run until SIGINT/SIGTERM
    server.start().await?;

    Ok(())
}
