//! Controller client errors.

use thiserror::Error;

/// Errors returned by a [`crate::ControllerClient`].
#[derive(Debug, Error, Clone)]
pub enum ControllerError {
    /// The requested record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The request was rejected as invalid.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The controller could not be reached or returned a server error.
    #[error("controller unavailable: {0}")]
    Unavailable(String),

    /// The controller answered with something unexpected.
    #[error("unexpected response: {0}")]
    Protocol(String),

    /// A stream fell behind and dropped records; resubscribe from the last
    /// cursor.
    #[error("stream lagged by {0} records")]
    Lagged(u64),
}

impl ControllerError {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Transient errors are retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Lagged(_))
    }
}

impl From<reqwest::Error> for ControllerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

impl From<tug_events::EventError> for ControllerError {
    fn from(err: tug_events::EventError) -> Self {
        match err {
            tug_events::EventError::Stream(msg) => Self::Unavailable(msg),
            other => Self::Protocol(other.to_string()),
        }
    }
}
