use std::sync::Arc;

use anyhow::{Context, Result};
use bridge::{NatsRegistry, Reconciler};
use clap::{Parser, Subcommand};
use common::catalog::SqlCatalog;
use common::cli::{CommonArgs, CommonCommands, utils};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "registry-bridge")]
#[command(about = "Mirrors the service instances of an external registry into the discovery catalog")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<BridgeCommands>,
}

#[derive(Subcommand)]
enum BridgeCommands {
    #[command(flatten)]
    Common(CommonCommands),
}

impl Default for BridgeCommands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    // Handle common commands that don't require starting the bridge
    let command = cli.command.unwrap_or_default();
    let BridgeCommands::Common(ref common_cmd) = command;
    if utils::handle_common_command(common_cmd, &config).await? {
        return Ok(());
    }

    utils::validate_config(&config)?;

    log::info!("Starting registry bridge");

    let catalog = Arc::new(
        SqlCatalog::new(&config.catalog.dsn)
            .await
            .context("Failed to open the discovery catalog")?,
    );

    let mut announcements = catalog.announcements();
    let announce_handle = tokio::spawn(async move {
        loop {
            match announcements.recv().await {
                Ok(record) => log::info!(
                    "Catalog announcement: {} {} ({})",
                    record.name,
                    record.status,
                    record.record_type
                ),
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Missed {missed} catalog announcements")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let registry = Arc::new(NatsRegistry::new(config.registry.clone()));
    let reconciler = Reconciler::new(registry, catalog.clone());
    reconciler
        .start()
        .await
        .context("Failed to start the registry bridge")?;

    log::info!(
        "Registry bridge running against {}",
        config.registry.connection
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c signal")?;

    log::info!("Shutting down registry bridge...");
    reconciler.close().await;

    announce_handle.abort();
    let _ = announce_handle.await;

    log::info!("Registry bridge stopped gracefully");

    Ok(())
}
