//! ID type definitions.

use crate::define_id;
use crate::IdError;

// Controller-owned resources
define_id!(AppId, "app");
define_id!(ReleaseId, "rel");
define_id!(ArtifactId, "art");
define_id!(DeploymentId, "dep");
define_id!(ScaleRequestId, "scale");

// Jobs placed on hosts
define_id!(JobId, "job");

/// Name of a host as registered with discovery.
///
/// Host ids are chosen by operators, so they are not ULIDs. They must be
/// non-empty and must not contain `/`, since they appear as a single path
/// segment in discovery keys. Ordering is lexicographic, which the scheduler
/// uses as a stable tiebreak during placement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(String);

impl HostId {
    /// Validates and wraps a host name.
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdError::Empty);
        }
        if value.contains('/') {
            return Err(IdError::InvalidHostId {
                value,
                reason: "must not contain '/'",
            });
        }
        if value.chars().any(char::is_whitespace) {
            return Err(IdError::InvalidHostId {
                value,
                reason: "must not contain whitespace",
            });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for HostId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for HostId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for HostId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for HostId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// Row id of a durable queue job (database `bigserial`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueJobId(i64);

impl QueueJobId {
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for QueueJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for QueueJobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl serde::Serialize for QueueJobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for QueueJobId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        Ok(Self(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_app_id_roundtrip() {
        let id = AppId::new();
        let s = id.to_string();
        let parsed: AppId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_prefix() {
        let id = ReleaseId::new();
        assert!(id.to_string().starts_with("rel_"));
        assert!(JobId::new().to_string().starts_with("job_"));
        assert!(DeploymentId::new().to_string().starts_with("dep_"));
    }

    #[test]
    fn test_invalid_prefix() {
        let result = AppId::parse("rel_01HV4Z2WQXKJNM8GPQY6VBKC3D");
        assert!(matches!(result, Err(IdError::InvalidPrefix { .. })));
    }

    #[test]
    fn test_missing_separator() {
        let result = JobId::parse("job01HV4Z2WQXKJNM8GPQY6VBKC3D");
        assert!(matches!(result, Err(IdError::MissingSeparator)));
    }

    #[test]
    fn test_empty() {
        assert!(AppId::parse("").unwrap_err().is_empty());
        assert!(HostId::new("").unwrap_err().is_empty());
    }

    #[test]
    fn test_invalid_ulid() {
        let result = AppId::parse("app_invalid");
        assert!(matches!(result, Err(IdError::InvalidUlid(_))));
    }

    #[test]
    fn test_job_ids_sort_by_creation() {
        let id1 = JobId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = JobId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_serde_as_string() {
        let id = DeploymentId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: DeploymentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let other = serde_json::to_string(&ReleaseId::new()).unwrap();
        let err = serde_json::from_str::<DeploymentId>(&other).unwrap_err();
        assert!(err.to_string().contains("invalid ID prefix"), "{err}");
    }

    #[test]
    fn test_host_id_rejects_slash() {
        let err = HostId::new("host/1").unwrap_err();
        assert!(matches!(err, IdError::InvalidHostId { .. }));
        assert!(serde_json::from_str::<HostId>("\"a/b\"").is_err());
    }

    #[test]
    fn test_host_id_orders_lexicographically() {
        let a = HostId::new("host-a").unwrap();
        let b = HostId::new("host-b").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_queue_job_id_serde() {
        let id = QueueJobId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        assert_eq!(serde_json::from_str::<QueueJobId>("42").unwrap(), id);
    }

    proptest! {
        #[test]
        fn prop_host_id_display_roundtrip(name in "[a-z0-9][a-z0-9.-]{0,30}") {
            let id = HostId::new(name.clone()).unwrap();
            prop_assert_eq!(id.to_string(), name.clone());
            prop_assert_eq!(id.as_str().parse::<HostId>().unwrap(), id);
        }
    }
}
