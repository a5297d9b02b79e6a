//! Error types for record handling.

use thiserror::Error;

/// Errors that can occur when decoding or validating records.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// A record failed validation.
    #[error("invalid record: {0}")]
    Invalid(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The underlying byte stream failed.
    #[error("stream error: {0}")]
    Stream(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
