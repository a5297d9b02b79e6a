//! The controller capability used by the scheduler and deployer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use tug_events::{
    App, Artifact, Deployment, DeploymentEvent, ExpandedFormation, Formation, FormationUpdate,
    JobRecord, Release, ScaleRequest,
};
use tug_id::{AppId, ArtifactId, DeploymentId, ReleaseId};

use crate::ControllerError;

pub type ControllerResult<T> = Result<T, ControllerError>;

/// A stream of controller records. Ends or errors when the connection
/// drops; callers resubscribe from their last cursor.
pub type ControllerStream<T> = BoxStream<'static, ControllerResult<T>>;

/// Operations the control plane needs from the controller.
#[async_trait]
pub trait ControllerClient: Send + Sync + 'static {
    /// Streams every formation changed after `since` in commit order, then
    /// [`FormationUpdate::Current`], then live changes.
    ///
    /// With `since = None` the initial batch is every live formation.
    async fn stream_formations(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ControllerResult<ControllerStream<FormationUpdate>>;

    async fn get_app(&self, app_id: AppId) -> ControllerResult<App>;

    async fn get_formation(&self, app_id: AppId, release_id: ReleaseId)
        -> ControllerResult<Formation>;

    async fn get_expanded_formation(
        &self,
        app_id: AppId,
        release_id: ReleaseId,
    ) -> ControllerResult<ExpandedFormation>;

    async fn get_release(&self, release_id: ReleaseId) -> ControllerResult<Release>;

    async fn get_artifact(&self, artifact_id: ArtifactId) -> ControllerResult<Artifact>;

    /// Creates or replaces a formation.
    async fn put_formation(&self, formation: &Formation) -> ControllerResult<Formation>;

    async fn delete_formation(&self, app_id: AppId, release_id: ReleaseId) -> ControllerResult<()>;

    async fn set_app_release(&self, app_id: AppId, release_id: ReleaseId) -> ControllerResult<()>;

    /// Applies a scale request to its formation, cancelling any pending one.
    async fn add_scale_request(&self, request: &ScaleRequest) -> ControllerResult<ScaleRequest>;

    async fn update_scale_request(&self, request: &ScaleRequest) -> ControllerResult<()>;

    async fn get_deployment(&self, deployment_id: DeploymentId) -> ControllerResult<Deployment>;

    async fn create_deployment_event(&self, event: &DeploymentEvent) -> ControllerResult<()>;

    /// Records a job's latest state.
    async fn put_job(&self, job: &JobRecord) -> ControllerResult<()>;

    async fn list_jobs(&self, app_id: AppId) -> ControllerResult<Vec<JobRecord>>;

    /// Streams job state changes for one app as they are recorded.
    async fn stream_job_events(&self, app_id: AppId) -> ControllerResult<ControllerStream<JobRecord>>;
}
