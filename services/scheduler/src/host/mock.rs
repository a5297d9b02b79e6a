//! In-process hosts for tests and local runs.
//!
//! A [`MockHost`] accepts jobs and reports them running at once. Tests
//! drive failures from the outside: crash a job, make a release crash on
//! start, drop a job without an event, or take the whole host down.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tug_events::{ActiveJob, HostEvent, HostEventKind, JobSpec, JobStatus};
use tug_id::{HostId, JobId, ReleaseId};

use super::{Host, HostClient, HostConnector, HostError, HostEventStream, HostResult};

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct MockState {
    jobs: BTreeMap<JobId, ActiveJob>,
    history: Vec<HostEvent>,
    next_event_id: u64,
    crash_releases: BTreeSet<ReleaseId>,
    failing_adds: u32,
    add_calls: u64,
}

/// A host that runs jobs in memory.
pub struct MockHost {
    host_id: HostId,
    state: Mutex<MockState>,
    events: broadcast::Sender<HostEvent>,
    down: watch::Sender<bool>,
}

impl MockHost {
    pub fn new(host_id: HostId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (down, _) = watch::channel(false);
        Self {
            host_id,
            state: Mutex::new(MockState::default()),
            events,
            down,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_up(&self) -> HostResult<()> {
        if *self.down.borrow() {
            return Err(HostError::Unreachable {
                host_id: self.host_id.clone(),
                reason: "host is down".to_string(),
            });
        }
        Ok(())
    }

    fn emit(&self, state: &mut MockState, kind: HostEventKind, job: ActiveJob) {
        state.next_event_id += 1;
        let event = HostEvent {
            event_id: state.next_event_id,
            job_id: job.id(),
            kind,
            job,
            timestamp: Utc::now(),
        };
        state.history.push(event.clone());
        let _ = self.events.send(event);
    }

    /// Jobs currently running, in id order.
    pub fn jobs(&self) -> Vec<ActiveJob> {
        self.lock().jobs.values().cloned().collect()
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    /// How many `add_jobs` calls the host has served, failed ones included.
    pub fn add_calls(&self) -> u64 {
        self.lock().add_calls
    }

    /// Ends a running job with a crash event.
    pub fn crash_job(&self, job_id: JobId) -> bool {
        let mut state = self.lock();
        let Some(mut job) = state.jobs.remove(&job_id) else {
            return false;
        };
        job.status = JobStatus::Crashed;
        job.exit_status = Some(1);
        job.ended_at = Some(Utc::now());
        self.emit(&mut state, HostEventKind::Crash, job);
        true
    }

    /// Makes every later job of `release_id` crash right after starting.
    pub fn crash_release(&self, release_id: ReleaseId) {
        self.lock().crash_releases.insert(release_id);
    }

    /// Drops a job without emitting an event, as if the event was missed.
    pub fn forget_job(&self, job_id: JobId) -> bool {
        self.lock().jobs.remove(&job_id).is_some()
    }

    /// Fails the next `n` calls to `add_jobs`.
    pub fn fail_adds(&self, n: u32) {
        self.lock().failing_adds = n;
    }

    /// Takes the host off the network: calls fail and event streams end
    /// with an error. Jobs keep their state.
    pub fn set_down(&self, down: bool) {
        self.down.send_replace(down);
    }
}

struct Follow {
    host_id: HostId,
    backlog: VecDeque<HostEvent>,
    rx: broadcast::Receiver<HostEvent>,
    down: watch::Receiver<bool>,
    done: bool,
}

#[async_trait]
impl HostClient for MockHost {
    fn host_id(&self) -> &HostId {
        &self.host_id
    }

    async fn list_jobs(&self) -> HostResult<BTreeMap<JobId, ActiveJob>> {
        self.check_up()?;
        Ok(self.lock().jobs.clone())
    }

    async fn get_job(&self, job_id: JobId) -> HostResult<ActiveJob> {
        self.check_up()?;
        self.lock()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(HostError::JobNotFound(job_id))
    }

    async fn stop_job(&self, job_id: JobId) -> HostResult<()> {
        self.check_up()?;
        let mut state = self.lock();
        let mut job = state
            .jobs
            .remove(&job_id)
            .ok_or(HostError::JobNotFound(job_id))?;
        job.status = JobStatus::Done;
        job.exit_status = Some(0);
        job.ended_at = Some(Utc::now());
        self.emit(&mut state, HostEventKind::Stop, job);
        Ok(())
    }

    async fn add_jobs(&self, jobs: Vec<JobSpec>) -> HostResult<()> {
        let mut state = self.lock();
        state.add_calls += 1;
        self.check_up()?;
        if state.failing_adds > 0 {
            state.failing_adds -= 1;
            return Err(HostError::Unreachable {
                host_id: self.host_id.clone(),
                reason: "injected failure".to_string(),
            });
        }
        if let Some(dup) = jobs.iter().find(|j| state.jobs.contains_key(&j.id)) {
            return Err(HostError::Rejected(format!("job {} already exists", dup.id)));
        }

        for spec in jobs {
            let crashes = spec
                .owner()
                .is_some_and(|o| state.crash_releases.contains(&o.key.release_id));
            let job = ActiveJob {
                job: spec,
                host_id: self.host_id.clone(),
                status: JobStatus::Running,
                started_at: Some(Utc::now()),
                ended_at: None,
                exit_status: None,
                error: None,
            };
            state.jobs.insert(job.id(), job.clone());
            self.emit(&mut state, HostEventKind::Start, job.clone());

            if crashes {
                let mut crashed = job;
                state.jobs.remove(&crashed.id());
                crashed.status = JobStatus::Crashed;
                crashed.exit_status = Some(1);
                crashed.ended_at = Some(Utc::now());
                self.emit(&mut state, HostEventKind::Crash, crashed);
            }
        }
        Ok(())
    }

    async fn stream_events(&self, since: Option<u64>) -> HostResult<HostEventStream> {
        self.check_up()?;
        let follow = {
            let state = self.lock();
            let backlog = match since {
                Some(since) => state
                    .history
                    .iter()
                    .filter(|e| e.event_id > since)
                    .cloned()
                    .collect(),
                None => VecDeque::new(),
            };
            Follow {
                host_id: self.host_id.clone(),
                backlog,
                rx: self.events.subscribe(),
                down: self.down.subscribe(),
                done: false,
            }
        };

        Ok(stream::unfold(follow, |mut f| async move {
            if f.done {
                return None;
            }
            if let Some(event) = f.backlog.pop_front() {
                return Some((Ok(event), f));
            }
            tokio::select! {
                biased;
                true = went_down(&mut f.down) => {
                    f.done = true;
                    let err = HostError::Unreachable {
                        host_id: f.host_id.clone(),
                        reason: "host is down".to_string(),
                    };
                    Some((Err(err), f))
                }
                received = f.rx.recv() => match received {
                    Ok(event) => Some((Ok(event), f)),
                    Err(RecvError::Lagged(n)) => {
                        f.done = true;
                        Some((Err(HostError::Protocol(format!("lagged by {n} events"))), f))
                    }
                    Err(RecvError::Closed) => None,
                },
            }
        })
        .boxed())
    }
}

async fn went_down(down: &mut watch::Receiver<bool>) -> bool {
    down.wait_for(|down| *down).await.is_ok()
}

/// A set of mock hosts that the pool can connect to by id.
#[derive(Default)]
pub struct MockCluster {
    hosts: Mutex<BTreeMap<HostId, Arc<MockHost>>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<HostId, Arc<MockHost>>> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates a host, or returns the existing one with this id.
    ///
    /// # Panics
    ///
    /// Panics if `host_id` is not a valid host id.
    pub fn add_host(&self, host_id: &str) -> Arc<MockHost> {
        let id = HostId::new(host_id).unwrap_or_else(|e| panic!("invalid host id: {e}"));
        self.lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(MockHost::new(id)))
            .clone()
    }

    pub fn host(&self, host_id: &str) -> Option<Arc<MockHost>> {
        let id = HostId::new(host_id).ok()?;
        self.lock().get(&id).cloned()
    }

    /// Every running job on every host.
    pub fn jobs(&self) -> Vec<ActiveJob> {
        self.lock().values().flat_map(|h| h.jobs()).collect()
    }
}

impl HostConnector for MockCluster {
    fn connect(&self, host: &Host) -> HostResult<Arc<dyn HostClient>> {
        let client = self
            .lock()
            .get(&host.id)
            .cloned()
            .ok_or_else(|| HostError::UnknownHost(host.id.clone()))?;
        Ok(client)
    }
}
