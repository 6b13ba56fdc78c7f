//! Voice relay server binary.
//!
//! Thin wrapper around the server library: loads configuration, sets up
//! logging, runs the relay until ctrl-c.

use anyhow::Result;
use server::{RelayConfig, RelayServer};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::load()?;

    let env_filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!(port = config.port, "voice relay starting");

    let mut relay = RelayServer::start(config).await?;

    let shutdown = relay.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    });

    relay.run().await
}
