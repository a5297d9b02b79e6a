//! Deployments and the events they emit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tug_id::{AppId, DeploymentId, ReleaseId};

use crate::{JobState, Processes};

/// How a deployment replaces old jobs with new ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStrategy {
    /// Start one new job, wait for it, stop one old job, wait, repeat.
    #[default]
    OneByOne,
    /// Start every new job, wait, then stop every old job.
    AllAtOnce,
}

impl std::fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentStrategy::OneByOne => f.write_str("one-by-one"),
            DeploymentStrategy::AllAtOnce => f.write_str("all-at-once"),
        }
    }
}

/// Status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// A request to move an app from one release to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub app_id: AppId,
    #[serde(default)]
    pub old_release_id: Option<ReleaseId>,
    pub new_release_id: ReleaseId,
    /// Target counts for the new release.
    #[serde(default)]
    pub processes: Processes,
    #[serde(default)]
    pub strategy: DeploymentStrategy,
    /// Per-step timeout in seconds.
    pub timeout_secs: u64,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Default per-step timeout.
pub const DEFAULT_DEPLOYMENT_TIMEOUT_SECS: u64 = 120;

/// A progress record emitted while a deployment runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub deployment_id: DeploymentId,
    #[serde(default)]
    pub release_id: Option<ReleaseId>,
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub job_state: Option<JobState>,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeploymentEvent {
    /// Marks the deployment as started.
    pub fn running(deployment_id: DeploymentId, release_id: ReleaseId) -> Self {
        Self {
            deployment_id,
            release_id: Some(release_id),
            job_type: None,
            job_state: None,
            status: DeploymentStatus::Running,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// A progress event for one job transition.
    pub fn job(
        deployment_id: DeploymentId,
        release_id: ReleaseId,
        job_type: impl Into<String>,
        job_state: JobState,
    ) -> Self {
        Self {
            deployment_id,
            release_id: Some(release_id),
            job_type: Some(job_type.into()),
            job_state: Some(job_state),
            status: DeploymentStatus::Running,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn complete(deployment_id: DeploymentId, release_id: ReleaseId) -> Self {
        Self {
            deployment_id,
            release_id: Some(release_id),
            job_type: None,
            job_state: None,
            status: DeploymentStatus::Complete,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(deployment_id: DeploymentId, error: impl Into<String>) -> Self {
        Self {
            deployment_id,
            release_id: None,
            job_type: None,
            job_state: None,
            status: DeploymentStatus::Failed,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_wire_names() {
        assert_eq!(
            serde_json::to_string(&DeploymentStrategy::OneByOne).unwrap(),
            "\"one-by-one\""
        );
        let s: DeploymentStrategy = serde_json::from_str("\"all-at-once\"").unwrap();
        assert_eq!(s, DeploymentStrategy::AllAtOnce);
    }

    #[test]
    fn test_failed_event_carries_error() {
        let event = DeploymentEvent::failed(DeploymentId::new(), "timed out");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "timed out");
    }

    #[test]
    fn test_running_event_omits_error() {
        let event = DeploymentEvent::job(DeploymentId::new(), ReleaseId::new(), "web", JobState::Up);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["job_state"], "up");
        assert!(json.get("error").is_none());
    }
}
