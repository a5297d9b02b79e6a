//! Worker pool that locks jobs and dispatches them to handlers by type.
//!
//! Each worker runs a loop:
//! 1. Lock the next runnable job
//! 2. Run the handler registered for its type in its own task
//! 3. Delete the job on success, record the error otherwise
//! 4. Release the lock and session
//!
//! Handlers run in spawned tasks so a panic is recorded as a job error
//! instead of taking the worker down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::job::{LockedJob, QueuedJob};
use crate::Queue;

/// What a handler receives for one job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: QueuedJob,
    /// Flips to true when the pool is shutting down. Long handlers may
    /// watch it, but the pool still waits for them to return.
    pub shutdown: watch::Receiver<bool>,
}

/// Processes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()>;
}

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue name to work.
    pub queue: String,

    /// Number of concurrent workers.
    pub workers: usize,

    /// How long to sleep when no job is runnable.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            workers: 10,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// A fixed set of workers sharing one handler table.
pub struct WorkerPool {
    queue: Queue,
    config: WorkerConfig,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl WorkerPool {
    pub fn new(queue: Queue, config: WorkerConfig) -> Self {
        Self {
            queue,
            config,
            handlers: HashMap::new(),
        }
    }

    /// Registers the handler for `job_type`, replacing any previous one.
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler) -> &mut Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    /// Run the workers until the shutdown signal is received.
    ///
    /// On shutdown no new jobs are locked; the call returns once every
    /// in-flight handler has returned.
    #[instrument(skip(self, shutdown), fields(queue = %self.config.queue), name = "queue_workers")]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            job_types = ?self.handlers.keys().collect::<Vec<_>>(),
            "Starting queue workers"
        );

        let workers = (0..self.config.workers.max(1)).map(|n| self.work_loop(n, shutdown.clone()));
        join_all(workers).await;

        info!("Queue workers stopped");
    }

    async fn work_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.queue.lock_job(&self.config.queue).await {
                Ok(Some(job)) => self.work(worker, job, shutdown.clone()).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(worker, error = %e, "Failed to lock job");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = sleep(self.config.poll_interval * 5) => {}
                    }
                }
            }
        }
    }

    async fn work(&self, worker: usize, mut job: LockedJob, shutdown: watch::Receiver<bool>) {
        let record = job.record().clone();
        let result = match self.handlers.get(&record.job_type) {
            None => Err(format!("no handler registered for job type {:?}", record.job_type)),
            Some(handler) => {
                let handler = handler.clone();
                let ctx = JobContext {
                    job: record.clone(),
                    shutdown,
                };
                match tokio::spawn(async move { handler.handle(ctx).await }).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(format!("{e:#}")),
                    Err(e) if e.is_panic() => Err(format!("handler panicked: {}", panic_message(e))),
                    Err(e) => Err(format!("handler task failed: {e}")),
                }
            }
        };

        match result {
            Ok(()) => {
                info!(worker, job_id = %record.id, job_type = %record.job_type, "Job complete");
                if let Err(e) = job.delete().await {
                    error!(worker, job_id = %record.id, error = %e, "Failed to delete job");
                }
            }
            Err(message) => {
                warn!(
                    worker,
                    job_id = %record.id,
                    job_type = %record.job_type,
                    error_count = record.error_count + 1,
                    error = %message,
                    "Job failed"
                );
                if let Err(e) = job.error(&message).await {
                    error!(worker, job_id = %record.id, error = %e, "Failed to record job error");
                }
            }
        }

        job.done().await;
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
