//! Discovery error types.

use thiserror::Error;

/// Errors from the backend store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The requested watch position is older than the retained history.
    #[error("index {requested} cleared, oldest retained is {oldest}")]
    IndexCleared { requested: u64, oldest: u64 },

    /// The watcher fell behind and was disconnected.
    #[error("watcher fell behind and was disconnected")]
    WatcherLagged,

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Errors after which a watcher must resync from a fresh snapshot.
    pub fn needs_resync(&self) -> bool {
        matches!(self, Self::IndexCleared { .. } | Self::WatcherLagged)
    }
}

/// Errors from discovery operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Heartbeat for an instance that is not registered (or has expired).
    #[error("instance {addr} of service {service} is not registered")]
    NotRegistered { service: String, addr: String },

    /// A service name or address cannot be used as a key segment.
    #[error("invalid {what}: {value:?}")]
    InvalidName { what: &'static str, value: String },

    /// A `:port` address was given but `EXTERNAL_IP` is not set.
    #[error("cannot expand {0:?}: EXTERNAL_IP is not set")]
    MissingExternalIp(String),

    /// The backend store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The remote agent could not be reached.
    #[error("discovery unavailable: {0}")]
    Unavailable(String),

    /// The remote agent sent something unexpected.
    #[error("unexpected response: {0}")]
    Protocol(String),

    /// A consumer was too slow and was disconnected.
    #[error("consumer fell behind and was disconnected")]
    Lagged,

    /// The upstream subscription was lost and could not be re-established.
    #[error("subscription lost: {0}")]
    Disconnected(String),

    /// A wait did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl DiscoveryError {
    pub fn is_not_registered(&self) -> bool {
        matches!(self, Self::NotRegistered { .. })
    }

    /// Transient errors are retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Disconnected(_) | Self::Timeout(_) => true,
            Self::Store(e) => matches!(e, StoreError::Unavailable(_)) || e.needs_resync(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

impl From<tug_events::EventError> for DiscoveryError {
    fn from(err: tug_events::EventError) -> Self {
        match err {
            tug_events::EventError::Stream(msg) => Self::Unavailable(msg),
            other => Self::Protocol(other.to_string()),
        }
    }
}
