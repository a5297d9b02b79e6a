//! Formations: desired replica counts and placement tags per release.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tug_id::{AppId, ReleaseId, ScaleRequestId};

use crate::{App, Artifact, Release};

/// Desired replica count per process type.
pub type Processes = BTreeMap<String, u32>;

/// Placement constraints per process type. A host satisfies a type's tags
/// when every key/value pair is present in the host's attributes.
pub type Tags = BTreeMap<String, BTreeMap<String, String>>;

/// Identifies a formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FormationKey {
    pub app_id: AppId,
    pub release_id: ReleaseId,
}

impl FormationKey {
    pub fn new(app_id: AppId, release_id: ReleaseId) -> Self {
        Self { app_id, release_id }
    }
}

impl std::fmt::Display for FormationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app_id, self.release_id)
    }
}

/// Desired state for one `(app, release)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formation {
    pub app_id: AppId,
    pub release_id: ReleaseId,
    #[serde(default)]
    pub processes: Processes,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Formation {
    pub fn new(app_id: AppId, release_id: ReleaseId, processes: Processes) -> Self {
        Self {
            app_id,
            release_id,
            processes,
            tags: Tags::new(),
            updated_at: None,
        }
    }

    pub fn key(&self) -> FormationKey {
        FormationKey::new(self.app_id, self.release_id)
    }

    /// Total desired jobs across all types.
    pub fn total(&self) -> u32 {
        self.processes.values().sum()
    }
}

/// A formation joined with the records needed to launch its jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandedFormation {
    pub app: App,
    pub release: Release,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub processes: Processes,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub pending_scale_request: Option<ScaleRequest>,
    pub updated_at: DateTime<Utc>,
    /// Set when the formation was deleted; desired counts are then zero.
    #[serde(default)]
    pub deleted: bool,
}

impl ExpandedFormation {
    pub fn key(&self) -> FormationKey {
        FormationKey::new(self.app.id, self.release.id)
    }

    /// Desired count for a type. Deleted formations want nothing.
    pub fn desired(&self, process_type: &str) -> u32 {
        if self.deleted {
            return 0;
        }
        self.processes.get(process_type).copied().unwrap_or(0)
    }

    /// Desired counts with deletion applied.
    pub fn desired_processes(&self) -> Processes {
        if self.deleted {
            Processes::new()
        } else {
            self.processes.clone()
        }
    }

    pub fn tags_for(&self, process_type: &str) -> Option<&BTreeMap<String, String>> {
        self.tags.get(process_type).filter(|t| !t.is_empty())
    }
}

/// An item of the formation stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormationUpdate {
    /// A formation changed.
    Formation(Box<ExpandedFormation>),
    /// Every change up to now has been delivered.
    Current,
}

/// State of a scale request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleRequestState {
    Pending,
    Complete,
    Cancelled,
}

/// A pending change to a formation's processes or tags.
///
/// At most one request per formation is pending; adding a new one cancels
/// the previous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub id: ScaleRequestId,
    pub app_id: AppId,
    pub release_id: ReleaseId,
    pub state: ScaleRequestState,
    #[serde(default)]
    pub old_processes: Option<Processes>,
    #[serde(default)]
    pub new_processes: Option<Processes>,
    #[serde(default)]
    pub old_tags: Option<Tags>,
    #[serde(default)]
    pub new_tags: Option<Tags>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ScaleRequest {
    /// A request to set a formation's processes, keeping its tags.
    pub fn processes(app_id: AppId, release_id: ReleaseId, processes: Processes) -> Self {
        Self {
            id: ScaleRequestId::new(),
            app_id,
            release_id,
            state: ScaleRequestState::Pending,
            old_processes: None,
            new_processes: Some(processes),
            old_tags: None,
            new_tags: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn key(&self) -> FormationKey {
        FormationKey::new(self.app_id, self.release_id)
    }

    pub fn is_pending(&self) -> bool {
        self.state == ScaleRequestState::Pending
    }
}
