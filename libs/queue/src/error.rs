//! Queue error types.

use thiserror::Error;

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Enqueue was called without a job type.
    #[error("job type must be specified")]
    MissingType,

    /// `lock_job` kept racing with concurrent deletes.
    #[error("maximum number of lock_job attempts reached")]
    Again,

    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// A statement failed.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// The job's session was already released.
    #[error("job {0} has already been released")]
    Released(i64),
}

impl QueueError {
    /// Transient errors are worth retrying after a pause.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Again | QueueError::Connect(_) => true,
            QueueError::Query(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            QueueError::MissingType | QueueError::Released(_) => false,
        }
    }
}
