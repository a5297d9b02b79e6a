//! Runs one deployment from start to a terminal event.

use std::sync::Arc;
use std::time::Duration;

use tracing::{field, info, instrument, warn, Span};
use tug_controller::{ControllerClient, ControllerError};
use tug_events::{
    Deployment, DeploymentEvent, DeploymentStatus, Formation, Processes,
    DEFAULT_DEPLOYMENT_TIMEOUT_SECS,
};
use tug_id::DeploymentId;

use crate::job_events::{JobEvents, Transition};
use crate::rollout::Rollout;
use crate::{strategy, DeployError, DeployResult};

/// How long a rollback waits for the old release to come back.
pub const DEFAULT_ROLLBACK_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DeployerConfig {
    pub rollback_wait: Duration,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            rollback_wait: DEFAULT_ROLLBACK_WAIT,
        }
    }
}

pub struct Deployer {
    controller: Arc<dyn ControllerClient>,
    config: DeployerConfig,
}

impl Deployer {
    pub fn new(controller: Arc<dyn ControllerClient>, config: DeployerConfig) -> Self {
        Self { controller, config }
    }

    /// Carries out a deployment and records its outcome.
    ///
    /// A deployment that fails is rolled back and reported with a `failed`
    /// event; that still returns `Ok(Failed)`. `Err` means the outcome could
    /// not be recorded and the deployment should be retried.
    #[instrument(skip(self), fields(app_id = field::Empty, strategy = field::Empty))]
    pub async fn deploy(&self, deployment_id: DeploymentId) -> DeployResult<DeploymentStatus> {
        let deployment = self.controller.get_deployment(deployment_id).await?;
        let span = Span::current();
        span.record("app_id", field::display(deployment.app_id));
        span.record("strategy", field::display(deployment.strategy));

        if deployment.status.is_terminal() {
            info!(status = ?deployment.status, "Deployment already finished");
            return Ok(deployment.status);
        }

        let mut rollout = match self.prepare(deployment).await {
            Ok(rollout) => rollout,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Deployment cannot start");
                self.controller
                    .create_deployment_event(&DeploymentEvent::failed(deployment_id, e.to_string()))
                    .await?;
                return Ok(DeploymentStatus::Failed);
            }
        };

        info!(
            new_release_id = %rollout.new_release(),
            old_release_id = ?rollout.old_release(),
            "Deployment started"
        );
        let strategy = rollout.deployment.strategy;
        match strategy::perform(strategy, &mut rollout).await {
            Ok(()) => {
                let app_id = rollout.deployment.app_id;
                let release_id = rollout.new_release();
                self.controller.set_app_release(app_id, release_id).await?;
                self.controller
                    .create_deployment_event(&DeploymentEvent::complete(deployment_id, release_id))
                    .await?;
                info!(release_id = %release_id, "Deployment complete");
                Ok(DeploymentStatus::Complete)
            }
            Err(e) => {
                warn!(error = %e, "Deployment failed, rolling back");
                self.rollback(&mut rollout).await?;
                self.controller
                    .create_deployment_event(&DeploymentEvent::failed(deployment_id, e.to_string()))
                    .await?;
                Ok(DeploymentStatus::Failed)
            }
        }
    }

    /// Subscribes to job events, then creates the new formation with the old
    /// formation's tags and whatever counts it already has.
    async fn prepare(&self, deployment: Deployment) -> DeployResult<Rollout> {
        if deployment.processes.values().all(|n| *n == 0) {
            return Err(DeployError::Invalid("no processes to deploy".to_string()));
        }

        let app_id = deployment.app_id;
        let new_release_id = deployment.new_release_id;
        let events = JobEvents::subscribe(
            self.controller.clone(),
            deployment.id,
            app_id,
            new_release_id,
        )
        .await?;

        let original = match deployment.old_release_id {
            Some(old) if old != new_release_id => {
                optional(self.controller.get_formation(app_id, old).await)?
            }
            _ => None,
        };

        let new = match optional(self.controller.get_formation(app_id, new_release_id).await)? {
            Some(existing) => existing,
            None => {
                let mut formation = Formation::new(app_id, new_release_id, Processes::new());
                if let Some(original) = &original {
                    formation.tags = original.tags.clone();
                }
                self.controller.put_formation(&formation).await?
            }
        };

        self.controller
            .create_deployment_event(&DeploymentEvent::running(deployment.id, new_release_id))
            .await?;

        let secs = match deployment.timeout_secs {
            0 => DEFAULT_DEPLOYMENT_TIMEOUT_SECS,
            secs => secs,
        };
        Ok(Rollout::new(
            self.controller.clone(),
            deployment,
            events,
            original,
            new.processes,
            Duration::from_secs(secs),
        ))
    }

    /// Restores the old formation, gives its jobs a bounded time to come
    /// back, then removes the new formation.
    async fn rollback(&self, rollout: &mut Rollout) -> DeployResult<()> {
        rollout.events.ignore_crashes();
        let app_id = rollout.deployment.app_id;

        if let Some(original) = rollout.original.clone() {
            let restarting: Processes = original
                .processes
                .iter()
                .map(|(t, n)| (t.clone(), n.saturating_sub(rollout.old_count(t))))
                .collect();
            self.controller.put_formation(&original).await?;
            if let Err(e) = rollout
                .events
                .wait_for(
                    original.release_id,
                    Transition::Up,
                    &restarting,
                    self.config.rollback_wait,
                )
                .await
            {
                warn!(error = %e, "Old release did not come back up in time");
            }
        }

        match self
            .controller
            .delete_formation(app_id, rollout.new_release())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        info!(release_id = %rollout.new_release(), "Rolled back");
        Ok(())
    }
}

fn optional<T>(result: Result<T, ControllerError>) -> DeployResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}
