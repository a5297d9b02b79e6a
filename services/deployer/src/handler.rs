//! Queue integration: deployments arrive as `deployment` jobs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use tug_id::{DeploymentId, QueueJobId};
use tug_queue::{JobContext, JobHandler, NewJob, Queue, QueueError};

use crate::Deployer;

/// Job type the deployer registers for.
pub const DEPLOYMENT_JOB: &str = "deployment";

/// Arguments of a `deployment` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentArgs {
    pub deployment_id: DeploymentId,
}

impl DeploymentArgs {
    pub fn job(&self) -> Result<NewJob, serde_json::Error> {
        NewJob::with_args(DEPLOYMENT_JOB, self)
    }
}

/// Where the HTTP surface puts new deployment jobs.
#[async_trait]
pub trait JobSink: Send + Sync + 'static {
    async fn enqueue(&self, job: &NewJob) -> Result<QueueJobId, QueueError>;
}

#[async_trait]
impl JobSink for Queue {
    async fn enqueue(&self, job: &NewJob) -> Result<QueueJobId, QueueError> {
        Queue::enqueue(self, job).await
    }
}

pub struct DeploymentHandler {
    deployer: Arc<Deployer>,
}

impl DeploymentHandler {
    pub fn new(deployer: Arc<Deployer>) -> Self {
        Self { deployer }
    }
}

#[async_trait]
impl JobHandler for DeploymentHandler {
    /// Failed deployments still complete the job; only an unrecorded
    /// outcome leaves it in the queue for another attempt.
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()> {
        let args: DeploymentArgs = ctx.job.args()?;
        let status = self.deployer.deploy(args.deployment_id).await?;
        info!(
            deployment_id = %args.deployment_id,
            queue_job_id = %ctx.job.id,
            status = ?status,
            "Deployment job finished"
        );
        Ok(())
    }
}
