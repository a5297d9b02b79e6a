//! Hosts: the job RPC surface and the pool of known hosts.
//!
//! Hosts register in discovery under [`HOST_SERVICE`] with their id in the
//! `id` attribute and placement tags as `tag:<key>` attributes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tug_events::{ActiveJob, HostEvent, JobSpec};
use tug_id::{HostId, JobId};

mod http;
mod mock;
mod pool;

pub use http::HttpHostClient;
pub use mock::{MockCluster, MockHost};
pub use pool::{host_attrs, Host, HostConnector, HostPool, HttpConnector, PoolEvent};

/// Discovery service hosts register under.
pub const HOST_SERVICE: &str = "hosts";

/// Discovery attribute carrying the host id.
pub const HOST_ID_ATTR: &str = "id";

/// Prefix of discovery attributes that are placement tags.
pub const TAG_PREFIX: &str = "tag:";

pub type HostResult<T> = Result<T, HostError>;

/// Ordered job events from one host. Ends or errors when the connection
/// drops.
pub type HostEventStream = BoxStream<'static, HostResult<HostEvent>>;

/// Errors talking to a host.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    /// The host did not answer.
    #[error("host {host_id} unreachable: {reason}")]
    Unreachable { host_id: HostId, reason: String },

    /// The host does not know the job.
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// The pool has no host with this id.
    #[error("unknown host {0}")]
    UnknownHost(HostId),

    /// The host refused the request.
    #[error("host rejected request: {0}")]
    Rejected(String),

    /// The host answered with something we could not read.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl HostError {
    /// Unreachable hosts may come back; everything else needs a different
    /// request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::UnknownHost(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound(_))
    }
}

/// Job operations a host serves.
#[async_trait]
pub trait HostClient: Send + Sync + 'static {
    fn host_id(&self) -> &HostId;

    async fn list_jobs(&self) -> HostResult<BTreeMap<JobId, ActiveJob>>;

    async fn get_job(&self, job_id: JobId) -> HostResult<ActiveJob>;

    /// Asks the host to stop a job. Completion is reported as a stop event.
    async fn stop_job(&self, job_id: JobId) -> HostResult<()>;

    /// Starts jobs on the host. Either every job is accepted or none is.
    async fn add_jobs(&self, jobs: Vec<JobSpec>) -> HostResult<()>;

    /// Streams job events with an id greater than `since`, then live events.
    async fn stream_events(&self, since: Option<u64>) -> HostResult<HostEventStream>;
}
