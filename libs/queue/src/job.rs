//! Queued jobs and the locked-job handle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tug_id::QueueJobId;

use crate::{sql, QueueError};

/// Default priority. Smaller runs first.
pub const DEFAULT_PRIORITY: i16 = 100;

/// How far each lease bump pushes `locked_until`.
const LEASE_SECS: i64 = 10;

/// How often the lease is bumped while a job is held.
const LEASE_INTERVAL: Duration = Duration::from_secs(3);

/// Seconds until a job that has failed `error_count` times runs again.
pub fn retry_delay_secs(error_count: i32) -> i64 {
    i64::from(error_count.max(0)).pow(4) + 3
}

/// A job to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub args: serde_json::Value,
    pub queue: Option<String>,
    pub priority: Option<i16>,
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            args,
            queue: None,
            priority: None,
            run_at: None,
        }
    }

    /// Builds a job whose args are `value` serialized as JSON.
    pub fn with_args<T: Serialize>(
        job_type: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(job_type, serde_json::to_value(value)?))
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// A row of the jobs table.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: QueueJobId,
    pub queue: String,
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub job_type: String,
    pub args: serde_json::Value,
    pub error_count: i32,
}

impl QueuedJob {
    /// Deserializes the job's args.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.args.clone())
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for QueuedJob {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: QueueJobId::new(row.try_get("id")?),
            queue: row.try_get("queue")?,
            priority: row.try_get("priority")?,
            run_at: row.try_get("run_at")?,
            job_type: row.try_get("type")?,
            args: row.try_get("args")?,
            error_count: row.try_get("error_count")?,
        })
    }
}

/// Background task that keeps `locked_until` in the future.
struct Lease {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A job locked by this process.
///
/// The job owns the database session that holds its advisory lock. Call
/// [`LockedJob::done`] when finished; dropping the handle without it closes
/// the session, which also releases the lock.
pub struct LockedJob {
    record: QueuedJob,
    pool: PgPool,
    conn: Option<PoolConnection<Postgres>>,
    lease: Option<Lease>,
    deleted: bool,
}

impl std::fmt::Debug for LockedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedJob")
            .field("record", &self.record)
            .field("held", &self.conn.is_some())
            .field("deleted", &self.deleted)
            .finish()
    }
}

impl LockedJob {
    pub(crate) async fn start(
        pool: PgPool,
        conn: PoolConnection<Postgres>,
        record: QueuedJob,
    ) -> Self {
        set_lock(&pool, &record, LEASE_SECS).await;

        let (stop, mut stopped) = oneshot::channel();
        let lease_pool = pool.clone();
        let lease_record = record.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LEASE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => set_lock(&lease_pool, &lease_record, LEASE_SECS).await,
                }
            }
            set_lock(&lease_pool, &lease_record, 0).await;
        });

        Self {
            record,
            pool,
            conn: Some(conn),
            lease: Some(Lease { stop, handle }),
            deleted: false,
        }
    }

    pub fn record(&self) -> &QueuedJob {
        &self.record
    }

    pub fn id(&self) -> QueueJobId {
        self.record.id
    }

    /// Removes the job from the queue.
    pub async fn delete(&mut self) -> Result<(), QueueError> {
        if self.deleted {
            return Ok(());
        }
        self.stop_lease().await;

        let r = &self.record;
        let conn = self
            .conn
            .as_mut()
            .ok_or(QueueError::Released(r.id.value()))?;
        let result = sqlx::query(sql::DESTROY_JOB)
            .bind(&r.queue)
            .bind(r.priority)
            .bind(r.run_at)
            .bind(r.id.value())
            .execute(&mut **conn)
            .await;

        match result {
            Ok(_) => {}
            // The session died; the lock went with it, so any session may delete.
            Err(sqlx::Error::Io(e)) => {
                warn!(job_id = %r.id, error = %e, "Job session lost, deleting via pool");
                sqlx::query(sql::DESTROY_JOB)
                    .bind(&r.queue)
                    .bind(r.priority)
                    .bind(r.run_at)
                    .bind(r.id.value())
                    .execute(&self.pool)
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }

        self.deleted = true;
        Ok(())
    }

    /// Records a failure and reschedules the job with backoff.
    pub async fn error(&mut self, message: &str) -> Result<(), QueueError> {
        self.stop_lease().await;

        let error_count = self.record.error_count + 1;
        let delay = retry_delay_secs(error_count);
        let r = &self.record;
        let conn = self
            .conn
            .as_mut()
            .ok_or(QueueError::Released(r.id.value()))?;

        let run_at: Option<DateTime<Utc>> = sqlx::query_scalar(sql::SET_ERROR)
            .bind(error_count)
            .bind(delay)
            .bind(message)
            .bind(&r.queue)
            .bind(r.priority)
            .bind(r.run_at)
            .bind(r.id.value())
            .fetch_optional(&mut **conn)
            .await?;

        debug!(job_id = %r.id, error_count, delay_secs = delay, "Job rescheduled after error");

        if let Some(run_at) = run_at {
            self.record.run_at = run_at;
        }
        self.record.error_count = error_count;
        Ok(())
    }

    /// Releases the advisory lock and returns the session to the pool.
    pub async fn done(mut self) {
        self.stop_lease().await;

        let id = self.record.id;
        if let Some(mut conn) = self.conn.take() {
            let unlocked: Result<bool, sqlx::Error> = sqlx::query_scalar(sql::UNLOCK_JOB)
                .bind(id.value())
                .fetch_one(&mut *conn)
                .await;
            match unlocked {
                Ok(true) => {}
                Ok(false) => {
                    warn!(job_id = %id, "Advisory lock was not held at release");
                }
                Err(e) => {
                    // Never hand a session that may still hold the lock back to the pool.
                    warn!(job_id = %id, error = %e, "Failed to release advisory lock, closing session");
                    conn.close_on_drop();
                }
            }
        }
    }

    async fn stop_lease(&mut self) {
        if let Some(lease) = self.lease.take() {
            let _ = lease.stop.send(());
            if let Err(e) = lease.handle.await {
                warn!(job_id = %self.record.id, error = %e, "Lease task failed");
            }
        }
    }
}

impl Drop for LockedJob {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.handle.abort();
        }
        if let Some(conn) = self.conn.as_mut() {
            conn.close_on_drop();
        }
    }
}

async fn set_lock(pool: &PgPool, record: &QueuedJob, secs: i64) {
    let result = sqlx::query(sql::SET_LOCK)
        .bind(secs)
        .bind(&record.queue)
        .bind(record.priority)
        .bind(record.run_at)
        .bind(record.id.value())
        .execute(pool)
        .await;
    if let Err(e) = result {
        warn!(job_id = %record.id, error = %e, "Failed to extend job lease");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 3)]
    #[case(1, 4)]
    #[case(2, 19)]
    #[case(3, 84)]
    #[case(5, 628)]
    fn test_retry_delay(#[case] error_count: i32, #[case] expected: i64) {
        assert_eq!(retry_delay_secs(error_count), expected);
    }

    #[test]
    fn test_new_job_builder() {
        let job = NewJob::new("deployment", serde_json::json!({"id": 1}))
            .queue("deploys")
            .priority(10);
        assert_eq!(job.queue.as_deref(), Some("deploys"));
        assert_eq!(job.priority, Some(10));
        assert!(job.run_at.is_none());
    }

    #[test]
    fn test_typed_args() {
        #[derive(serde::Deserialize)]
        struct Args {
            id: u32,
        }
        let job = QueuedJob {
            id: QueueJobId::new(1),
            queue: String::new(),
            priority: DEFAULT_PRIORITY,
            run_at: Utc::now(),
            job_type: "deployment".to_string(),
            args: serde_json::json!({"id": 7}),
            error_count: 0,
        };
        let args: Args = job.args().unwrap();
        assert_eq!(args.id, 7);
    }
}
