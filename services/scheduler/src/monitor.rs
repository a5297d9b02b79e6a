//! Follows each host's job event stream.
//!
//! One task per host forwards events to the scheduler in host order. When a
//! stream breaks the task resubscribes from the last event id it saw, and
//! after every (re)subscription it asks the scheduler to reconcile the host
//! in case events were lost in between.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use tug_events::HostEvent;
use tug_id::HostId;
use tug_reconcile::BackoffPolicy;

use crate::host::HostClient;

/// What the monitor reports to the scheduler.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A job event from a host.
    Job { host_id: HostId, event: HostEvent },
    /// The host's stream was (re)established; reconcile its jobs.
    Resync { host_id: HostId },
}

/// Per-host event followers.
pub struct HostMonitor {
    tx: mpsc::Sender<MonitorEvent>,
    backoff: BackoffPolicy,
    tasks: Mutex<HashMap<HostId, JoinHandle<()>>>,
}

impl HostMonitor {
    pub fn new(tx: mpsc::Sender<MonitorEvent>) -> Self {
        Self {
            tx,
            backoff: BackoffPolicy::default(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<HostId, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts following a host unless already doing so.
    pub fn watch(&self, client: Arc<dyn HostClient>) {
        let host_id = client.host_id().clone();
        let mut tasks = self.tasks();
        if tasks.get(&host_id).is_some_and(|t| !t.is_finished()) {
            return;
        }
        let task = tokio::spawn(follow_host(
            host_id.clone(),
            client,
            self.tx.clone(),
            self.backoff.clone(),
        ));
        tasks.insert(host_id, task);
    }

    pub fn unwatch(&self, host_id: &HostId) {
        if let Some(task) = self.tasks().remove(host_id) {
            debug!(host_id = %host_id, "No longer following host");
            task.abort();
        }
    }

    pub fn watching(&self) -> Vec<HostId> {
        let mut ids: Vec<_> = self.tasks().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stop_all(&self) {
        for (_, task) in self.tasks().drain() {
            task.abort();
        }
    }
}

impl Drop for HostMonitor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[instrument(skip(client, tx, backoff), fields(host_id = %host_id), name = "host_monitor")]
async fn follow_host(
    host_id: HostId,
    client: Arc<dyn HostClient>,
    tx: mpsc::Sender<MonitorEvent>,
    backoff: BackoffPolicy,
) {
    let mut cursor: Option<u64> = None;
    let mut attempt = 0u32;

    loop {
        match client.stream_events(cursor).await {
            Ok(mut stream) => {
                info!(since = ?cursor, "Following host events");
                attempt = 0;
                let resync = MonitorEvent::Resync {
                    host_id: host_id.clone(),
                };
                if tx.send(resync).await.is_err() {
                    return;
                }

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => {
                            cursor = Some(event.event_id);
                            let event = MonitorEvent::Job {
                                host_id: host_id.clone(),
                                event,
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Host event stream failed");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, attempt, "Failed to subscribe to host events"),
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(delay = ?delay, "Resubscribing to host events");
        tokio::time::sleep(delay).await;
    }
}
