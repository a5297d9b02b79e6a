//! Deployment errors.

use std::time::Duration;

use tug_controller::ControllerError;
use tug_id::{JobId, ReleaseId};

pub type DeployResult<T> = Result<T, DeployError>;

/// Errors that end or interrupt a deployment.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeployError {
    /// The expected job events did not arrive within the step timeout.
    #[error("timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        after: Duration,
    },

    /// A job of the release being rolled out crashed.
    #[error("job {job_id} ({process_type}) of release {release_id} crashed")]
    JobCrashed {
        job_id: JobId,
        release_id: ReleaseId,
        process_type: String,
    },

    /// The job event stream ended before the step finished.
    #[error("job event stream closed")]
    StreamClosed,

    /// The deployment record cannot be carried out.
    #[error("invalid deployment: {0}")]
    Invalid(String),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

impl DeployError {
    /// Retrying the whole deployment later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StreamClosed => true,
            Self::Controller(e) => e.is_transient(),
            Self::Timeout { .. } | Self::JobCrashed { .. } | Self::Invalid(_) => false,
        }
    }
}
