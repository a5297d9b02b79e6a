//! deployer
//!
//! Works `deployment` jobs from the queue and accepts new ones over HTTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tug_controller::{ControllerClient, HttpControllerClient};
use tug_deployer::{config, http, Deployer, DeploymentHandler, DEPLOYMENT_JOB};
use tug_queue::{Queue, WorkerPool};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to DEPLOYER_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting deployer");
    info!(
        listen_addr = %config.listen_addr,
        controller = %config.controller_url,
        workers = config.workers.workers,
        db_max_connections = config.database.max_connections,
        "Configuration loaded"
    );

    let pool = config.database.connect().await?;
    let queue = Queue::new(pool);
    queue.migrate().await?;

    let controller: Arc<dyn ControllerClient> = Arc::new(HttpControllerClient::new(
        config.controller_url.clone(),
        config.controller_key.clone(),
    )?);
    let deployer = Arc::new(Deployer::new(controller.clone(), config.deployer.clone()));

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let mut workers = WorkerPool::new(queue.clone(), config.workers.clone());
    workers.register(DEPLOYMENT_JOB, DeploymentHandler::new(deployer));
    let workers_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { workers.run(shutdown_rx).await })
    };

    let app = http::create_router(http::AppState {
        controller,
        queue: Arc::new(queue),
    });
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
    // In-flight deployments get a while to reach a terminal event; anything
    // left is retried from the queue by the next deployer.
    if tokio::time::timeout(Duration::from_secs(60), workers_handle)
        .await
        .is_err()
    {
        error!("Workers did not stop in time");
    }

    info!("Deployer shutdown complete");
    Ok(())
}
