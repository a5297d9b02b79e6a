//! Waiting on job transitions reported to the controller.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use tug_controller::{ControllerClient, ControllerStream};
use tug_events::{DeploymentEvent, JobRecord, JobState};
use tug_id::{AppId, DeploymentId, JobId, ReleaseId};

use crate::{DeployError, DeployResult};

/// Which transition a wait counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Up,
    Down,
}

impl Transition {
    fn matches(self, state: JobState) -> bool {
        match self {
            Transition::Up => state == JobState::Up,
            Transition::Down => state == JobState::Down,
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::Up => f.write_str("up"),
            Transition::Down => f.write_str("down"),
        }
    }
}

/// Job events of one app, consumed in order by a single deployment.
///
/// The subscription is opened before the first scale change so that no
/// transition caused by the deployment can be missed. Every relevant
/// transition is recorded as a deployment event.
pub struct JobEvents {
    controller: Arc<dyn ControllerClient>,
    deployment_id: DeploymentId,
    stream: ControllerStream<JobRecord>,
    seen: HashMap<JobId, JobState>,
    /// Crashes of this release abort the current wait.
    abort_on_crash: Option<ReleaseId>,
}

impl JobEvents {
    pub async fn subscribe(
        controller: Arc<dyn ControllerClient>,
        deployment_id: DeploymentId,
        app_id: AppId,
        abort_on_crash: ReleaseId,
    ) -> DeployResult<Self> {
        let stream = controller.stream_job_events(app_id).await?;
        // States already recorded before the subscription are not progress.
        let seen = controller
            .list_jobs(app_id)
            .await?
            .into_iter()
            .map(|job| (job.job_id, job.state))
            .collect();
        Ok(Self {
            controller,
            deployment_id,
            stream,
            seen,
            abort_on_crash: Some(abort_on_crash),
        })
    }

    /// Stops treating crashes as fatal. Used while rolling back.
    pub fn ignore_crashes(&mut self) {
        self.abort_on_crash = None;
    }

    /// Waits until `expected[type]` distinct jobs of `release_id` made the
    /// given transition, or `timeout` elapses.
    pub async fn wait_for(
        &mut self,
        release_id: ReleaseId,
        transition: Transition,
        expected: &BTreeMap<String, u32>,
        timeout: Duration,
    ) -> DeployResult<()> {
        let mut remaining: BTreeMap<String, u32> = expected
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(t, n)| (t.clone(), *n))
            .collect();
        if remaining.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        while !remaining.is_empty() {
            let record = match timeout_at(deadline, self.stream.next()).await {
                Err(_) => {
                    return Err(DeployError::Timeout {
                        waiting_for: describe(release_id, transition, &remaining),
                        after: timeout,
                    })
                }
                Ok(None) => return Err(DeployError::StreamClosed),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(record))) => record,
            };

            if self.seen.get(&record.job_id) == Some(&record.state) {
                continue;
            }
            self.seen.insert(record.job_id, record.state);

            if record.state == JobState::Crashed && self.abort_on_crash == Some(record.release_id) {
                self.record(&record).await;
                return Err(DeployError::JobCrashed {
                    job_id: record.job_id,
                    release_id: record.release_id,
                    process_type: record.process_type,
                });
            }
            if record.release_id != release_id || !transition.matches(record.state) {
                continue;
            }

            if let Some(n) = remaining.get_mut(&record.process_type) {
                debug!(
                    job_id = %record.job_id,
                    release_id = %release_id,
                    process_type = %record.process_type,
                    transition = %transition,
                    "Observed job transition"
                );
                self.record(&record).await;
                *n -= 1;
                if *n == 0 {
                    remaining.remove(&record.process_type);
                }
            }
        }
        Ok(())
    }

    async fn record(&mut self, record: &JobRecord) {
        let event = DeploymentEvent::job(
            self.deployment_id,
            record.release_id,
            record.process_type.clone(),
            record.state,
        );
        if let Err(e) = self.controller.create_deployment_event(&event).await {
            warn!(
                deployment_id = %self.deployment_id,
                job_id = %record.job_id,
                error = %e,
                "Failed to record deployment event"
            );
        }
    }
}

fn describe(release_id: ReleaseId, transition: Transition, remaining: &BTreeMap<String, u32>) -> String {
    let types: Vec<String> = remaining.iter().map(|(t, n)| format!("{n} {t}")).collect();
    format!("{} of release {release_id} {transition}", types.join(", "))
}
