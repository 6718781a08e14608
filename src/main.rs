use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};

use std::path::PathBuf;

use updrift::config::AgentConfig;
use updrift::console::ConsoleServer;
use updrift::service::FileService;
use updrift::utils::setup_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Environment first: the config loader reads its whitelist from it.
    if let Err(e) = dotenv::dotenv() {
        if !e.to_string().contains("No such file or directory")
            && !e.to_string().contains("system cannot find the file")
        {
            eprintln!("Failed to load .env file: {e}");
        }
    }

    let config_file = std::env::var("UPDRIFT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"));

    let config = AgentConfig::load(&config_file)
        .with_context(|| format!("Failed to load configuration from {}", config_file.display()))?;

    setup_logging(&config.log.level)?;
    info!("Starting updrift v{}", env!("CARGO_PKG_VERSION"));

    let service = FileService::new(config.clone(), Some(config_file))
        .await
        .context("Failed to build file service")?;
    service.start().await.context("Failed to start file service")?;

    let console = ConsoleServer::new(service.clone(), &config.api);
    let console_task = tokio::spawn(async move {
        if let Err(e) = console.start().await {
            error!("Console server failed: {}", e);
        }
    });

    info!("updrift is running. Press Ctrl+C to stop.");
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = console_task => {
            if let Err(e) = result {
                warn!("Console server task ended: {}", e);
            }
        }
    }

    service.stop().await;
    info!("updrift stopped");
    Ok(())
}
