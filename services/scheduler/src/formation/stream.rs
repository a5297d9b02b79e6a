//! Follows the controller's formation stream.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};
use tug_controller::ControllerClient;
use tug_events::FormationUpdate;
use tug_reconcile::BackoffPolicy;

/// Delivers formation updates in commit order, resubscribing from the last
/// seen `updated_at` whenever the stream breaks.
///
/// Every (re)subscription ends its replay with [`FormationUpdate::Current`].
pub struct FormationStream {
    controller: Arc<dyn ControllerClient>,
    since: Option<DateTime<Utc>>,
    backoff: BackoffPolicy,
}

impl FormationStream {
    pub fn new(controller: Arc<dyn ControllerClient>) -> Self {
        Self {
            controller,
            since: None,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// The cursor the next subscription starts from.
    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    /// Forwards updates to `tx` until shutdown or until the receiver goes
    /// away.
    #[instrument(skip_all, name = "formation_stream")]
    pub async fn run(mut self, tx: mpsc::Sender<FormationUpdate>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.controller.stream_formations(self.since).await {
                Ok(mut stream) => {
                    info!(since = ?self.since, "Subscribed to formations");
                    loop {
                        let item = tokio::select! {
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                                continue;
                            }
                            item = stream.next() => item,
                        };

                        match item {
                            Some(Ok(update)) => {
                                attempt = 0;
                                if let FormationUpdate::Formation(f) = &update {
                                    self.advance(f.updated_at);
                                    debug!(formation = %f.key(), processes = ?f.processes, deleted = f.deleted, "Formation update");
                                }
                                if tx.send(update).await.is_err() {
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Formation stream failed");
                                break;
                            }
                            None => {
                                warn!("Formation stream ended");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, attempt, "Failed to subscribe to formations"),
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn advance(&mut self, updated_at: DateTime<Utc>) {
        if self.since.is_none_or(|since| updated_at > since) {
            self.since = Some(updated_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tug_controller::MemoryController;
    use tug_events::{Formation, ProcessType, Processes, Release};
    use tug_id::ReleaseId;

    #[tokio::test]
    async fn test_replays_then_current_then_live() {
        let controller = Arc::new(MemoryController::new());
        let app = controller.create_app("web");
        let release = Release {
            id: ReleaseId::new(),
            app_id: Some(app.id),
            artifact_ids: vec![],
            env: BTreeMap::new(),
            processes: BTreeMap::from([("web".to_string(), ProcessType::default())]),
            created_at: None,
        };
        controller.put_release(release.clone());
        controller
            .put_formation(&Formation::new(
                app.id,
                release.id,
                Processes::from([("web".to_string(), 1)]),
            ))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(FormationStream::new(controller.clone()).run(tx, shutdown_rx));

        assert!(matches!(rx.recv().await, Some(FormationUpdate::Formation(_))));
        assert_eq!(rx.recv().await, Some(FormationUpdate::Current));

        controller
            .put_formation(&Formation::new(
                app.id,
                release.id,
                Processes::from([("web".to_string(), 2)]),
            ))
            .await
            .unwrap();
        let Some(FormationUpdate::Formation(f)) = rx.recv().await else {
            panic!("expected formation");
        };
        assert_eq!(f.desired("web"), 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_cursor_only_moves_forward() {
        let mut stream = FormationStream::new(Arc::new(MemoryController::new()));
        let now = Utc::now();
        stream.advance(now);
        stream.advance(now - chrono::Duration::seconds(5));
        assert_eq!(stream.cursor(), Some(now));
    }
}
