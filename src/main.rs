//! Hivemind daemon entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use hivemind::infrastructure::config::ConfigLoader;
use hivemind::infrastructure::logging::init_logging;
use hivemind::infrastructure::persistence::JsonBudgetStore;
use hivemind::services::session_bridge::LoopbackGateway;
use hivemind::{ControlPlane, Supervisor};

#[derive(Parser)]
#[command(name = "hivemind", about = "Fleet control plane for LLM agent workers", version)]
struct Cli {
    /// Path to a config file; defaults to hierarchical .hivemind/ loading
    #[arg(long, env = "HIVEMIND_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory for persisted documents
    #[arg(long, env = "HIVEMIND_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load().context("Failed to load configuration")?,
    };
    if cli.data_dir.is_some() {
        config.data_dir = cli.data_dir;
    }

    let _log_guard = init_logging(&config.logging);

    let data_dir = config.resolved_data_dir();
    let store = JsonBudgetStore::new(&data_dir);
    tracing::info!(data_dir = %data_dir.display(), "starting hivemind control plane");

    // The concrete session gateway is deployment-specific; the daemon boots
    // with the loopback gateway until one is wired in.
    let gateway = Arc::new(LoopbackGateway::new());
    let plane = Arc::new(ControlPlane::new(
        config.control_plane_config(),
        gateway,
        Some(store),
    ));
    plane.engine.load().await;

    let supervisor = Supervisor::new(Arc::clone(&plane), config.control_plane_config().supervisor);
    let handles = supervisor.spawn();
    tracing::info!(tasks = handles.len(), "supervisor background tasks running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received, stopping");
    for handle in &handles {
        handle.abort();
    }
    for result in futures::future::join_all(handles).await {
        if let Err(error) = result {
            if !error.is_cancelled() {
                tracing::warn!(%error, "background task ended abnormally");
            }
        }
    }
    Ok(())
}
