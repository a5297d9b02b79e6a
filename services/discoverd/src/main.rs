//! discoverd
//!
//! Runs the discovery agent over an in-process store and serves it on HTTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tug_discoverd::{config, http, Agent, MemoryStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to DISCOVERD_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting discoverd");
    info!(
        listen_addr = %config.listen_addr,
        heartbeat = ?config.agent.heartbeat,
        grace = ?config.agent.grace,
        external_ip = config.agent.external_ip.as_deref().unwrap_or(""),
        "Configuration loaded"
    );

    let store = Arc::new(MemoryStore::new());
    let expiry = MemoryStore::spawn_expiry(&store, Duration::from_millis(250));
    let agent = Arc::new(Agent::new(store, config.agent.clone()));

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let app = http::create_router(agent);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    expiry.abort();

    info!("discoverd shutdown complete");
    Ok(())
}
