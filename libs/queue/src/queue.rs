//! Enqueue and lock operations.

use sqlx::postgres::PgPool;
use sqlx::{Executor, Postgres, Transaction};
use tracing::{debug, info, instrument, warn};
use tug_id::QueueJobId;

use crate::job::{LockedJob, NewJob, QueuedJob};
use crate::{sql, QueueError};

/// Attempts `lock_job` makes before giving up on a racing queue.
pub const MAX_LOCK_ATTEMPTS: usize = 10;

const SCHEMA: &str = include_str!("../migrations/0001_create_jobs.sql");

/// Handle to the durable job queue.
#[derive(Debug, Clone)]
pub struct Queue {
    pool: PgPool,
}

impl Queue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the jobs table if it does not exist.
    pub async fn migrate(&self) -> Result<(), QueueError> {
        info!("Ensuring queue schema");
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Adds a job to the queue.
    pub async fn enqueue(&self, job: &NewJob) -> Result<QueueJobId, QueueError> {
        exec_enqueue(job, &self.pool).await
    }

    /// Adds a job inside the caller's transaction, so it commits or rolls
    /// back together with the caller's other writes.
    pub async fn enqueue_in_tx(
        &self,
        job: &NewJob,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<QueueJobId, QueueError> {
        exec_enqueue(job, &mut **tx).await
    }

    /// Locks the next runnable job in `queue`.
    ///
    /// Returns `Ok(None)` when nothing is runnable. The returned job keeps its
    /// session for as long as it is held.
    #[instrument(skip(self), level = "debug")]
    pub async fn lock_job(&self, queue: &str) -> Result<Option<LockedJob>, QueueError> {
        let mut conn = self.pool.acquire().await?;

        for attempt in 0..MAX_LOCK_ATTEMPTS {
            let record: Option<QueuedJob> = sqlx::query_as(sql::LOCK_JOB)
                .bind(queue)
                .fetch_optional(&mut *conn)
                .await?;

            let Some(record) = record else {
                return Ok(None);
            };

            // The lock query's snapshot may predate another worker deleting
            // the row; with the lock held, make sure it is still there.
            let present: Result<Option<bool>, sqlx::Error> = sqlx::query_scalar(sql::CHECK_JOB)
                .bind(&record.queue)
                .bind(record.priority)
                .bind(record.run_at)
                .bind(record.id.value())
                .fetch_optional(&mut *conn)
                .await;

            match present {
                Ok(Some(_)) => {
                    debug!(job_id = %record.id, job_type = %record.job_type, "Locked job");
                    return Ok(Some(LockedJob::start(self.pool.clone(), conn, record).await));
                }
                Ok(None) => {
                    debug!(job_id = %record.id, attempt, "Locked job already worked, retrying");
                    let unlocked: Result<bool, sqlx::Error> = sqlx::query_scalar(sql::UNLOCK_JOB)
                        .bind(record.id.value())
                        .fetch_one(&mut *conn)
                        .await;
                    if let Err(e) = unlocked {
                        conn.close_on_drop();
                        return Err(e.into());
                    }
                }
                Err(e) => {
                    warn!(job_id = %record.id, error = %e, "Job check failed");
                    conn.close_on_drop();
                    return Err(e.into());
                }
            }
        }

        Err(QueueError::Again)
    }
}

async fn exec_enqueue<'e, E>(job: &NewJob, executor: E) -> Result<QueueJobId, QueueError>
where
    E: Executor<'e, Database = Postgres>,
{
    if job.job_type.is_empty() {
        return Err(QueueError::MissingType);
    }

    let id: i64 = sqlx::query_scalar(sql::ENQUEUE)
        .bind(job.queue.as_deref().filter(|q| !q.is_empty()))
        .bind(job.priority)
        .bind(job.run_at)
        .bind(&job.job_type)
        .bind(&job.args)
        .fetch_one(executor)
        .await?;

    debug!(job_id = id, job_type = %job.job_type, "Enqueued job");
    Ok(QueueJobId::new(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    async fn test_enqueue_requires_type() {
        // A lazy pool never connects, so validation must fail first.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let queue = Queue::new(pool);

        let err = queue
            .enqueue(&NewJob::new("", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::MissingType));
        assert!(!err.is_transient());
    }
}
