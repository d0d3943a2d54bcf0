mod config;
mod http;
mod logging;

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use confab_sfu::{Hub, MemoryMessageStore, RoomContext, RtcPeerFactory};

use crate::config::Config;

/// Confab real-time room server
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "CONFAB_CONFIG_PATH", default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = Config::load(Some(&cli.config))?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Confab server starting...");
    if !Path::new(&cli.config).exists() {
        warn!(path = %cli.config, "Config file not found, using defaults and environment");
    }
    info!("HTTP address: {}", config.http_address());

    // 3. Build the room engine
    let channels = config.channel_store()?;
    let peers = Arc::new(RtcPeerFactory::new(&config.sfu)?);
    let context = RoomContext::new(config.sfu.clone(), peers, Arc::new(MemoryMessageStore::new()));
    let hub = Arc::new(Hub::initialize(&channels, context).await?);
    info!(
        channels = hub.channel_ids().len(),
        rooms = hub.room_count(),
        "Hub initialized"
    );

    // 4. Serve
    let listener = tokio::net::TcpListener::bind(config.http_address()).await?;
    info!("HTTP server listening on {}", config.http_address());

    axum::serve(listener, http::create_router(Arc::clone(&hub)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for channel_id in hub.channel_ids() {
        hub.remove_channel(&channel_id);
    }
    info!("Confab server stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
