//! scheduler
//!
//! Follows hosts in discovery and formations in the controller, and keeps
//! the cluster's jobs converged to them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tug_controller::HttpControllerClient;
use tug_discoverd::{Discovery, HttpDiscovery, ServiceSet};
use tug_scheduler::{config, Election, HostPool, HttpConnector, Scheduler, HOST_SERVICE};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to SCHEDULER_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting scheduler");
    info!(
        discoverd = %config.discoverd_url,
        controller = %config.controller_url,
        scheduler_addr = config.scheduler_addr.as_deref().unwrap_or(""),
        anti_entropy = ?config.scheduler.sync_interval,
        host_grace = ?config.host_grace,
        crash_threshold = config.scheduler.crash_threshold,
        "Configuration loaded"
    );

    let discovery: Arc<dyn Discovery> = Arc::new(HttpDiscovery::new(config.discoverd_url.clone())?);
    let controller = Arc::new(HttpControllerClient::new(
        config.controller_url.clone(),
        config.controller_key.clone(),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let hosts = Arc::new(ServiceSet::connect(discovery.clone(), HOST_SERVICE).await?);
    let pool = Arc::new(HostPool::new(Arc::new(HttpConnector::new(config.auth_key.clone()))));
    let pool_handle = tokio::spawn(pool.clone().follow(
        hosts.clone(),
        config.host_grace,
        shutdown_rx.clone(),
    ));

    let election = config.scheduler_addr.clone().map(|addr| Election {
        discovery: discovery.clone(),
        addr,
    });
    let scheduler = Scheduler::new(controller, pool, config.scheduler.clone(), election);

    let mut scheduler_handle = {
        let scheduler = scheduler.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut scheduler_handle => {
            match result {
                Ok(Ok(())) => info!("Scheduler exited normally"),
                Ok(Err(e)) => error!(error = %e, "Scheduler error"),
                Err(e) => error!(error = %e, "Scheduler task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if !scheduler_handle.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(10), scheduler_handle).await;
    }
    let _ = pool_handle.await;
    hosts.close().await;

    info!("Scheduler shutdown complete");
    Ok(())
}
