//! What the scheduler reports to observers.

use std::time::Duration;

use serde::Serialize;
use tug_events::FormationKey;
use tug_id::{HostId, JobId};

/// Why a job left the formation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// The host reported a clean stop.
    Stopped,
    /// The job exited with an error.
    Crashed,
    /// The job failed to start.
    Failed,
    /// Its host left the cluster.
    Lost,
    /// The host no longer knows the job and no event said so.
    Missing,
}

/// A scheduler decision or observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobPlaced {
        key: FormationKey,
        process_type: String,
        job_id: JobId,
        host_id: HostId,
    },
    JobStopRequested {
        key: FormationKey,
        process_type: String,
        job_id: JobId,
        host_id: HostId,
    },
    JobRemoved {
        key: FormationKey,
        process_type: String,
        job_id: JobId,
        host_id: HostId,
        reason: RemovalReason,
    },
    /// A job could not be placed. Without `retry_in` the type waits for a
    /// desired-state or host change.
    PendingPlacement {
        key: FormationKey,
        process_type: String,
        reason: String,
        retry_in: Option<Duration>,
    },
    /// Launches for the type are halted after repeated crashes.
    Degraded {
        key: FormationKey,
        process_type: String,
        crash_score: f64,
    },
    LeaderChanged {
        is_leader: bool,
    },
    /// An anti-entropy pass finished.
    Synced,
}
