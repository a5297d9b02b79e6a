//! Scheduler errors.

use std::collections::BTreeMap;
use std::time::Duration;

use tug_controller::ControllerError;
use tug_discoverd::DiscoveryError;
use tug_id::ReleaseId;

use crate::host::HostError;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur while scheduling.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    /// The pool has no hosts at all.
    #[error("no hosts available")]
    NoHosts,

    /// Hosts exist but none carries the required tags.
    #[error("no host matches tags {tags:?} for process type {process_type}")]
    NoMatchingHosts {
        process_type: String,
        tags: BTreeMap<String, String>,
    },

    /// The release has nothing to run.
    #[error("release {0} has no artifact")]
    MissingArtifact(ReleaseId),

    /// A placement or stop did not finish in time.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl SchedulerError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NoHosts | Self::Timeout(_) => true,
            Self::Host(e) => e.is_transient(),
            Self::Controller(e) => e.is_transient(),
            Self::Discovery(e) => e.is_transient(),
            Self::NoMatchingHosts { .. } | Self::MissingArtifact(_) => false,
        }
    }

    /// Retrying cannot help until the desired state or the host set
    /// changes.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NoMatchingHosts { .. } | Self::MissingArtifact(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tug_id::HostId;

    #[rstest]
    #[case(SchedulerError::NoHosts, true)]
    #[case(SchedulerError::Timeout(Duration::from_secs(30)), true)]
    #[case(SchedulerError::Host(HostError::Unreachable {
        host_id: HostId::new("h1").unwrap(),
        reason: "connection refused".to_string(),
    }), true)]
    #[case(SchedulerError::Host(HostError::Rejected("bad spec".to_string())), false)]
    #[case(SchedulerError::MissingArtifact(ReleaseId::new()), false)]
    #[case(SchedulerError::NoMatchingHosts {
        process_type: "web".to_string(),
        tags: BTreeMap::new(),
    }, false)]
    fn test_transient_classification(#[case] err: SchedulerError, #[case] transient: bool) {
        assert_eq!(err.is_transient(), transient);
    }

    #[test]
    fn test_permanent_errors() {
        let err = SchedulerError::NoMatchingHosts {
            process_type: "web".to_string(),
            tags: BTreeMap::from([("disk".to_string(), "ssd".to_string())]),
        };
        assert!(err.is_permanent());
        assert!(err.to_string().contains("web"));
        assert!(!SchedulerError::NoHosts.is_permanent());
    }
}
