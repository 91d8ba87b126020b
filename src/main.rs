//! Presence Relay Server
//!
//! Reads configuration from the environment and serves until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use presence_relay::{AuthConfig, RelayServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let default_level = if cfg!(feature = "debug-tracing") { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = ServerConfig::from_env();
    info!("Presence Relay v{}", VERSION);
    info!("Tick interval: {:?}", config.tick_interval);

    let server = RelayServer::bind(config, AuthConfig::from_env())
        .await
        .context("failed to start relay server (is JWT_SECRET set?)")?;
    let server = Arc::new(server);

    let runner = server.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutting down");
    server.shutdown();

    handle.await.context("server task panicked")??;
    Ok(())
}
