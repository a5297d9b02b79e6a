//! Keeps a registration alive.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{Attrs, Discovery, DiscoveryError};

/// A registered instance that is heartbeating in the background.
///
/// Dropping the handle stops the heartbeats and leaves the instance to
/// expire.
pub struct Heartbeater {
    discovery: Arc<dyn Discovery>,
    service: String,
    addr: String,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Registers an instance and heartbeats it every
/// [`Discovery::heartbeat_interval`] until [`Heartbeater::stop`].
///
/// If a heartbeat finds the instance gone (its TTL ran out during a
/// partition, say) the instance is registered again.
pub async fn register_with_heartbeat(
    discovery: Arc<dyn Discovery>,
    service: &str,
    addr: &str,
    attrs: Attrs,
) -> Result<Heartbeater, DiscoveryError> {
    let addr = discovery.register(service, addr, &attrs).await?;
    let (stop, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(heartbeat_loop(
        discovery.clone(),
        service.to_string(),
        addr.clone(),
        attrs,
        stop_rx,
    ));

    Ok(Heartbeater {
        discovery,
        service: service.to_string(),
        addr,
        stop,
        handle,
    })
}

impl Heartbeater {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The resolved address the instance is registered under.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Stops heartbeating and unregisters the instance.
    pub async fn stop(self) -> Result<(), DiscoveryError> {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
        self.discovery.unregister(&self.service, &self.addr).await
    }
}

async fn heartbeat_loop(
    discovery: Arc<dyn Discovery>,
    service: String,
    addr: String,
    attrs: Attrs,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(discovery.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately and registration just happened.
    ticker.tick().await;

    let mut consecutive_failures = 0u32;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = match discovery.heartbeat(&service, &addr).await {
                    Err(e) if e.is_not_registered() => {
                        info!(service = %service, addr = %addr, "Instance expired, registering again");
                        discovery.register(&service, &addr, &attrs).await.map(|_| ())
                    }
                    other => other,
                };

                match result {
                    Ok(()) => {
                        consecutive_failures = 0;
                        debug!(service = %service, addr = %addr, "Heartbeat sent");
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(service = %service, error = %e, consecutive_failures, "Heartbeat failed");
                        } else {
                            error!(service = %service, error = %e, consecutive_failures, "Heartbeat failed repeatedly");
                        }
                    }
                }
            }
            _ = stop.changed() => break,
        }
    }
}
