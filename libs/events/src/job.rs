//! Jobs as seen by hosts, the scheduler and the controller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tug_id::{AppId, HostId, JobId, ReleaseId};

use crate::{FormationKey, Mount, Port, Resources};

/// Attribute keys the scheduler sets on every job it launches.
pub mod attrs {
    pub const APP_ID: &str = "app_id";
    pub const RELEASE_ID: &str = "release_id";
    pub const PROCESS_TYPE: &str = "process_type";
}

/// A job to run on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub image_ref: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
}

/// The formation a job belongs to, parsed from its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobOwner {
    pub key: FormationKey,
    pub process_type: String,
}

impl JobSpec {
    /// Parses the owning formation out of the job's attributes.
    ///
    /// Returns `None` for jobs the scheduler did not launch.
    pub fn owner(&self) -> Option<JobOwner> {
        let app_id = self.attributes.get(attrs::APP_ID)?.parse::<AppId>().ok()?;
        let release_id = self
            .attributes
            .get(attrs::RELEASE_ID)?
            .parse::<ReleaseId>()
            .ok()?;
        let process_type = self.attributes.get(attrs::PROCESS_TYPE)?.clone();
        Some(JobOwner {
            key: FormationKey::new(app_id, release_id),
            process_type,
        })
    }
}

/// Lifecycle of a job on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Running,
    Stopping,
    /// Exited cleanly or was stopped.
    Done,
    /// Exited with a non-zero status.
    Crashed,
    /// Failed to start.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Crashed | Self::Failed)
    }
}

/// A job known to a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveJob {
    pub job: JobSpec,
    pub host_id: HostId,
    pub status: JobStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_status: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ActiveJob {
    pub fn id(&self) -> JobId {
        self.job.id
    }
}

/// Kind of a host job event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEventKind {
    Start,
    Stop,
    Error,
    Crash,
}

impl HostEventKind {
    /// Stop, error and crash end the job.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Start)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Crash)
    }
}

/// An event from a host's job event stream.
///
/// `event_id` increases per host and serves as the resume cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEvent {
    pub event_id: u64,
    pub job_id: JobId,
    pub kind: HostEventKind,
    pub job: ActiveJob,
    pub timestamp: DateTime<Utc>,
}

/// Job state as recorded by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Starting,
    Up,
    Stopping,
    Down,
    Crashed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Starting => "starting",
            JobState::Up => "up",
            JobState::Stopping => "stopping",
            JobState::Down => "down",
            JobState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// A job's latest state, persisted to the controller by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub host_id: HostId,
    pub app_id: AppId,
    pub release_id: ReleaseId,
    pub process_type: String,
    pub state: JobState,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn key(&self) -> FormationKey {
        FormationKey::new(self.app_id, self.release_id)
    }
}
