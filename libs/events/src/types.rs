//! Controller-owned resource records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tug_id::{AppId, ArtifactId, ReleaseId};

/// An application. `release_id` is the release currently serving traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub id: AppId,
    pub name: String,
    #[serde(default)]
    pub release_id: Option<ReleaseId>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// A container image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    /// Artifact type, e.g. `docker`.
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// An exposed port of a process type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub port: u16,
    #[serde(default = "default_proto")]
    pub proto: String,
}

fn default_proto() -> String {
    "tcp".to_string()
}

/// Resource request for a single job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_millis: Option<u64>,
}

/// A volume mount requested by a process type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub location: String,
    pub target: String,
    #[serde(default)]
    pub writeable: bool,
}

/// Definition of one process type inside a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessType {
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub resources: Resources,
}

/// An immutable release: artifacts plus process definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    #[serde(default)]
    pub app_id: Option<AppId>,
    #[serde(default)]
    pub artifact_ids: Vec<ArtifactId>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessType>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Release {
    /// Returns true if the release defines the given process type.
    pub fn has_process(&self, process_type: &str) -> bool {
        self.processes.contains_key(process_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_type_field_name() {
        let artifact = Artifact {
            id: ArtifactId::new(),
            kind: "docker".to_string(),
            uri: "registry.local/web:1".to_string(),
            created_at: None,
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["type"], "docker");
    }

    #[test]
    fn test_release_defaults() {
        let id = ReleaseId::new();
        let json = format!(r#"{{"id":"{id}","processes":{{"web":{{"ports":[{{"port":8080}}]}}}}}}"#);
        let release: Release = serde_json::from_str(&json).unwrap();
        assert!(release.has_process("web"));
        assert!(!release.has_process("worker"));
        assert_eq!(release.processes["web"].ports[0].proto, "tcp");
    }
}
