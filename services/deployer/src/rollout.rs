//! The moving parts of one deployment: both formations and their counts.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tug_controller::ControllerClient;
use tug_events::{Deployment, Formation, Processes, ScaleRequest};
use tug_id::ReleaseId;

use crate::job_events::{JobEvents, Transition};
use crate::DeployResult;

/// Counts of the old and new formations as the deployment drives them.
///
/// Strategies change counts through [`Rollout::scale_new`] and
/// [`Rollout::scale_old`], each a scale request against the controller, and
/// wait for the resulting transitions before moving on.
pub struct Rollout {
    controller: Arc<dyn ControllerClient>,
    pub deployment: Deployment,
    pub events: JobEvents,
    /// The old formation as it was before the deployment started.
    pub original: Option<Formation>,
    pub old: Processes,
    pub new: Processes,
    pub step_timeout: Duration,
}

impl Rollout {
    pub fn new(
        controller: Arc<dyn ControllerClient>,
        deployment: Deployment,
        events: JobEvents,
        original: Option<Formation>,
        new: Processes,
        step_timeout: Duration,
    ) -> Self {
        let old = original
            .as_ref()
            .map(|f| f.processes.clone())
            .unwrap_or_default();
        Self {
            controller,
            deployment,
            events,
            original,
            old,
            new,
            step_timeout,
        }
    }

    pub fn old_release(&self) -> Option<ReleaseId> {
        self.original.as_ref().map(|f| f.release_id)
    }

    pub fn new_release(&self) -> ReleaseId {
        self.deployment.new_release_id
    }

    /// Every process type either formation runs, in name order.
    pub fn process_types(&self) -> Vec<String> {
        let types: BTreeSet<&String> = self
            .deployment
            .processes
            .keys()
            .chain(self.old.keys())
            .collect();
        types.into_iter().cloned().collect()
    }

    /// Target count of `process_type` in the new release.
    pub fn target(&self, process_type: &str) -> u32 {
        self.deployment
            .processes
            .get(process_type)
            .copied()
            .unwrap_or(0)
    }

    pub fn new_count(&self, process_type: &str) -> u32 {
        self.new.get(process_type).copied().unwrap_or(0)
    }

    pub fn old_count(&self, process_type: &str) -> u32 {
        self.old.get(process_type).copied().unwrap_or(0)
    }

    /// Sets the new formation's count for `process_type`.
    pub async fn scale_new(&mut self, process_type: &str, count: u32) -> DeployResult<()> {
        self.scale_new_to(Processes::from([(process_type.to_string(), count)]))
            .await
    }

    /// Sets the old formation's count for `process_type`.
    pub async fn scale_old(&mut self, process_type: &str, count: u32) -> DeployResult<()> {
        self.scale_old_to(Processes::from([(process_type.to_string(), count)]))
            .await
    }

    /// Applies `counts` to the new formation in one scale request.
    pub async fn scale_new_to(&mut self, counts: Processes) -> DeployResult<()> {
        self.new.extend(counts);
        self.scale(self.new_release(), self.new.clone()).await
    }

    /// Applies `counts` to the old formation in one scale request. No-op
    /// without an old formation.
    pub async fn scale_old_to(&mut self, counts: Processes) -> DeployResult<()> {
        let Some(release_id) = self.old_release() else {
            return Ok(());
        };
        self.old.extend(counts);
        self.scale(release_id, self.old.clone()).await
    }

    async fn scale(&mut self, release_id: ReleaseId, processes: Processes) -> DeployResult<()> {
        info!(
            deployment_id = %self.deployment.id,
            release_id = %release_id,
            processes = ?processes,
            "Scaling formation"
        );
        let request = ScaleRequest::processes(self.deployment.app_id, release_id, processes);
        self.controller.add_scale_request(&request).await?;
        Ok(())
    }

    /// Waits for `count` new jobs of each type to come up.
    pub async fn wait_new_up(&mut self, counts: &Processes) -> DeployResult<()> {
        let release_id = self.new_release();
        self.events
            .wait_for(release_id, Transition::Up, counts, self.step_timeout)
            .await
    }

    /// Waits for `count` old jobs of each type to go down.
    pub async fn wait_old_down(&mut self, counts: &Processes) -> DeployResult<()> {
        let Some(release_id) = self.old_release() else {
            return Ok(());
        };
        self.events
            .wait_for(release_id, Transition::Down, counts, self.step_timeout)
            .await
    }
}
