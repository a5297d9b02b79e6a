//! # tug-queue
//!
//! A durable job queue on Postgres.
//!
//! Jobs live in a single `jobs` table ordered by `(queue, priority, run_at,
//! id)`. A worker locks a job by taking a session-level advisory lock on its
//! id, so at most one session in the cluster works a given job. The session
//! stays with the job until [`LockedJob::done`]; while it is held a background
//! task keeps `locked_until` ten seconds in the future.
//!
//! Failed jobs are rescheduled `error_count^4 + 3` seconds out.

mod db;
mod error;
mod job;
mod queue;
pub mod sql;
mod worker;

pub use db::DbConfig;
pub use error::QueueError;
pub use job::{retry_delay_secs, LockedJob, NewJob, QueuedJob, DEFAULT_PRIORITY};
pub use queue::{Queue, MAX_LOCK_ATTEMPTS};
pub use worker::{JobContext, JobHandler, WorkerConfig, WorkerPool};
