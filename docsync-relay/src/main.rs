//! `docsync-relay`: standalone relay server.
//!
//! Configured from `DOCSYNC_*` environment variables (see
//! [`ServerConfig::from_env`]); log level via `RUST_LOG`.

use std::sync::Arc;

use docsync_collab::server::{RelayServer, ServerConfig};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    match &config.storage_path {
        Some(path) => info!("Starting docsync relay (store at {})", path.display()),
        None => info!("Starting docsync relay (in-memory)"),
    }

    let server = Arc::new(RelayServer::new(config)?);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Cannot listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await?;

    info!("Relay stopped");
    Ok(())
}
