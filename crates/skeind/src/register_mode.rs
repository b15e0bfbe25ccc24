//! Register mode — hosts the cluster membership table.

use skein_cluster::{RegisterServer, RegisterServerConfig};
use skein_core::SkeinConfig;
use tracing::info;

pub async fn run(config: SkeinConfig) -> anyhow::Result<()> {
    info!("skein daemon starting in register mode");
    let server_config = RegisterServerConfig::from_config(&config)?;
    let handle = RegisterServer::start(server_config).await?;
    info!(addr = %handle.local_addr(), "accepting node registrations");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    handle.shutdown().await;
    Ok(())
}
