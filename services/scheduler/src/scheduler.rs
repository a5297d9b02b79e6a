//! The scheduler: keeps every formation's jobs running on the cluster.
//!
//! Responsibilities:
//! - Follow formations from the controller and membership from the host pool
//! - Track each host's jobs through its event stream
//! - Rectify a formation whenever its desired or observed state changes
//! - Compare tracked jobs with what hosts report (anti-entropy)
//! - Persist job state and finished scale requests, in order, while leader
//!
//! Only the leader places or stops jobs. Followers keep their table current
//! so a promotion starts from a warm state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant as StdInstant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use tug_controller::ControllerClient;
use tug_discoverd::{register_with_heartbeat, Attrs, Discovery, Heartbeater, ServiceSet};
use tug_events::{
    ActiveJob, ExpandedFormation, FormationKey, FormationUpdate, HostEvent, HostEventKind,
    JobRecord, JobState, JobStatus, ScaleRequest, ScaleRequestState,
};
use tug_id::{HostId, JobId};
use tug_reconcile::{Attempts, BackoffPolicy, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_SYNC_INTERVAL};

use crate::events::{RemovalReason, SchedulerEvent};
use crate::formation::{
    FormationEntry, FormationSnapshot, FormationState, FormationStream, FormationTable, Retry,
    TrackedJob, TrackedState,
};
use crate::host::{Host, HostClient, HostError, HostPool, PoolEvent};
use crate::monitor::{HostMonitor, MonitorEvent};
use crate::rectify;
use crate::{SchedulerError, SchedulerResult};

/// Discovery service schedulers register under for leader election.
pub const SCHEDULER_SERVICE: &str = "scheduler";

const EVENT_CAPACITY: usize = 1024;
const MONITOR_CAPACITY: usize = 1024;
const FORMATION_CAPACITY: usize = 256;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between anti-entropy passes.
    pub sync_interval: Duration,
    /// Decayed crash count at which a process type is marked degraded.
    pub crash_threshold: f64,
    /// Bound on a single host call.
    pub attempt_timeout: Duration,
    /// Delay between failed placements, and between crash restarts, of a
    /// process type.
    pub backoff: BackoffPolicy,
    /// Delay before resubscribing to a host's events.
    pub host_backoff: BackoffPolicy,
    /// Window in which rectification triggers for a formation coalesce.
    pub debounce: Duration,
    /// Retries for controller writes.
    pub persist: Attempts,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            crash_threshold: 10.0,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            backoff: BackoffPolicy::scheduling(),
            host_backoff: BackoffPolicy::default(),
            debounce: Duration::from_millis(50),
            persist: Attempts::new(5, Duration::from_secs(1)),
        }
    }
}

/// Leader election through discovery: the oldest registered scheduler
/// leads.
pub struct Election {
    pub discovery: Arc<dyn Discovery>,
    /// Address to register; `:port` is resolved by the agent.
    pub addr: String,
}

/// A controller write, applied in order by a single task.
#[derive(Debug)]
enum Write {
    Job(JobRecord),
    ScaleRequest(ScaleRequest),
}

/// Receivers and options consumed by the first call to [`Scheduler::run`].
struct Startup {
    monitor: mpsc::Receiver<MonitorEvent>,
    writes: mpsc::UnboundedReceiver<Write>,
    election: Option<Election>,
}

struct Campaign {
    heartbeater: Heartbeater,
    set: ServiceSet,
    task: JoinHandle<()>,
}

impl Campaign {
    async fn resign(self) {
        self.task.abort();
        self.set.close().await;
        if let Err(e) = self.heartbeater.stop().await {
            warn!(error = %e, "Failed to unregister from leader election");
        }
    }
}

/// Handle to a scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    controller: Arc<dyn ControllerClient>,
    pool: Arc<HostPool>,
    table: FormationTable,
    monitor: HostMonitor,
    config: SchedulerConfig,
    events: broadcast::Sender<SchedulerEvent>,
    leader: watch::Sender<bool>,
    /// The formation stream has delivered its first `Current`.
    current: AtomicBool,
    /// Formations are current and a full sync has run since, and since the
    /// latest promotion.
    ready: AtomicBool,
    stopped: AtomicBool,
    writes: mpsc::UnboundedSender<Write>,
    startup: Mutex<Option<Startup>>,
}

impl Scheduler {
    /// Creates a scheduler. Without an election it leads from the start.
    pub fn new(
        controller: Arc<dyn ControllerClient>,
        pool: Arc<HostPool>,
        config: SchedulerConfig,
        election: Option<Election>,
    ) -> Self {
        let (monitor_tx, monitor_rx) = mpsc::channel(MONITOR_CAPACITY);
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (leader, _) = watch::channel(election.is_none());
        let monitor = HostMonitor::new(monitor_tx).with_backoff(config.host_backoff.clone());

        Self {
            inner: Arc::new(Inner {
                controller,
                pool,
                table: FormationTable::new(),
                monitor,
                config,
                events,
                leader,
                current: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                writes: writes_tx,
                startup: Mutex::new(Some(Startup {
                    monitor: monitor_rx,
                    writes: writes_rx,
                    election,
                })),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    /// Formations are current and jobs have been synced at least once.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    pub fn table(&self) -> &FormationTable {
        &self.inner.table
    }

    pub fn pool(&self) -> &Arc<HostPool> {
        &self.inner.pool
    }

    /// Runs an anti-entropy pass now.
    pub async fn sync_jobs(&self) {
        self.inner.sync_jobs().await;
    }

    /// Desired and running counts for every formation.
    pub async fn formations(&self) -> Vec<FormationSnapshot> {
        self.inner.table.snapshot().await
    }

    /// Runs the scheduler until shutdown.
    #[instrument(skip_all, name = "scheduler")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<()> {
        let startup = self
            .inner
            .startup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(Startup {
            monitor: mut monitor_rx,
            writes,
            election,
        }) = startup
        else {
            warn!("Scheduler is already running");
            return Ok(());
        };
        let inner = &self.inner;

        let writer = tokio::spawn(inner.clone().write_loop(writes));
        let (formation_tx, mut formation_rx) = mpsc::channel(FORMATION_CAPACITY);
        let stream = tokio::spawn(
            FormationStream::new(inner.controller.clone()).run(formation_tx, shutdown.clone()),
        );

        let mut pool_events = inner.pool.subscribe();
        for host in inner.pool.hosts() {
            inner.watch_host(&host);
        }

        let mut leader_rx = inner.leader.subscribe();
        let campaign = match election {
            Some(election) => Some(inner.clone().campaign(election).await?),
            None => None,
        };

        let mut anti_entropy = tokio::time::interval(inner.config.sync_interval);
        anti_entropy.set_missed_tick_behavior(MissedTickBehavior::Delay);
        anti_entropy.tick().await;

        info!(leader = inner.is_leader(), "Scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Some(update) = formation_rx.recv() => inner.handle_formation_update(update).await,
                event = pool_events.recv() => match event {
                    Ok(event) => inner.handle_pool_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed host pool events, resynchronizing");
                        for host in inner.pool.hosts() {
                            inner.watch_host(&host);
                        }
                        inner.sync_jobs().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(event) = monitor_rx.recv() => inner.handle_monitor_event(event).await,
                _ = anti_entropy.tick() => {
                    if inner.current.load(Ordering::Acquire) {
                        inner.sync_jobs().await;
                    }
                }
                Ok(()) = leader_rx.changed() => {
                    let is_leader = *leader_rx.borrow_and_update();
                    inner.leader_changed(is_leader).await;
                }
            }
        }

        info!("Scheduler shutting down");
        inner.stopped.store(true, Ordering::Release);
        inner.monitor.stop_all();
        stream.abort();
        writer.abort();
        if let Some(campaign) = campaign {
            campaign.resign().await;
        }
        Ok(())
    }
}

impl Inner {
    fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }

    /// Placements and stops happen only on a ready, running leader.
    fn may_act(&self) -> bool {
        self.is_leader()
            && self.ready.load(Ordering::Acquire)
            && !self.stopped.load(Ordering::Acquire)
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    fn set_leader(&self, is_leader: bool) {
        self.leader.send_if_modified(|current| {
            if *current == is_leader {
                return false;
            }
            if is_leader {
                // A new leader syncs before it acts.
                self.ready.store(false, Ordering::Release);
            }
            *current = is_leader;
            true
        });
    }

    async fn campaign(self: Arc<Self>, election: Election) -> SchedulerResult<Campaign> {
        let heartbeater = register_with_heartbeat(
            election.discovery.clone(),
            SCHEDULER_SERVICE,
            &election.addr,
            Attrs::new(),
        )
        .await?;
        let me = heartbeater.addr().to_string();
        let set = ServiceSet::connect(election.discovery, SCHEDULER_SERVICE).await?;
        let mut leaders = set.leaders().await;
        info!(addr = %me, "Registered for leader election");

        let inner = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match leaders.recv().await {
                    Ok(Some(leader)) => {
                        inner.set_leader(leader.is_some_and(|l| l.addr == me));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Lost leader watch, stepping down");
                        inner.set_leader(false);
                        break;
                    }
                }
            }
        });

        Ok(Campaign {
            heartbeater,
            set,
            task,
        })
    }

    async fn leader_changed(self: &Arc<Self>, is_leader: bool) {
        info!(is_leader, "Leadership changed");
        self.emit(SchedulerEvent::LeaderChanged { is_leader });
        if is_leader && self.current.load(Ordering::Acquire) {
            self.sync_jobs().await;
        }
    }

    async fn write_loop(self: Arc<Self>, mut writes: mpsc::UnboundedReceiver<Write>) {
        while let Some(write) = writes.recv().await {
            let controller = &self.controller;
            let pending = &write;
            let result = self
                .config
                .persist
                .run(|_| async move {
                    match pending {
                        Write::Job(record) => controller.put_job(record).await,
                        Write::ScaleRequest(request) => controller.update_scale_request(request).await,
                    }
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, write = ?write, "Failed to write to controller");
            }
        }
    }

    fn persist_job(&self, key: FormationKey, job: &TrackedJob, state: JobState, error: Option<String>) {
        if !self.is_leader() {
            return;
        }
        let record = JobRecord {
            job_id: job.job_id,
            host_id: job.host_id.clone(),
            app_id: key.app_id,
            release_id: key.release_id,
            process_type: job.process_type.clone(),
            state,
            error,
            updated_at: Utc::now(),
        };
        let _ = self.writes.send(Write::Job(record));
    }

    // ---- triggers ----

    /// Queues a rectification of `entry` unless one is already queued.
    fn trigger(self: &Arc<Self>, entry: &Arc<FormationEntry>) {
        if !entry.mark_pending() {
            return;
        }
        let inner = self.clone();
        let entry = entry.clone();
        let debounce = self.config.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            inner.rectify(entry).await;
        });
    }

    fn trigger_after(self: &Arc<Self>, entry: &Arc<FormationEntry>, delay: Duration) {
        let inner = self.clone();
        let key = entry.key();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(entry) = inner.table.get(&key) {
                inner.trigger(&entry);
            }
        });
    }

    fn rectify_all(self: &Arc<Self>) {
        for key in self.table.keys() {
            if let Some(entry) = self.table.get(&key) {
                self.trigger(&entry);
            }
        }
    }

    // ---- inputs ----

    async fn handle_formation_update(self: &Arc<Self>, update: FormationUpdate) {
        match update {
            FormationUpdate::Formation(formation) => {
                let key = formation.key();
                if formation.deleted {
                    let Some(entry) = self.table.get(&key) else {
                        return;
                    };
                    let mut state = entry.lock().await;
                    if entry.is_removed() {
                        return;
                    }
                    state.set_formation(*formation);
                    drop(state);
                    self.trigger(&entry);
                } else {
                    let (entry, mut state) = self.table.lock_entry(key).await;
                    state.set_formation(*formation);
                    drop(state);
                    self.trigger(&entry);
                }
            }
            FormationUpdate::Current => {
                if !self.current.swap(true, Ordering::AcqRel) {
                    info!(formations = self.table.len(), "Formations caught up");
                    self.sync_jobs().await;
                }
            }
        }
    }

    async fn handle_pool_event(self: &Arc<Self>, event: PoolEvent) {
        match event {
            PoolEvent::HostUp(host) => {
                // The address may have changed; follow through the new client.
                self.monitor.unwatch(&host.id);
                self.watch_host(&host);
                for key in self.table.keys() {
                    if let Some(entry) = self.table.get(&key) {
                        entry.lock().await.blocked.clear();
                    }
                }
                self.rectify_all();
            }
            PoolEvent::HostDown(host_id) => self.host_down(&host_id).await,
        }
    }

    fn watch_host(&self, host: &Host) {
        match self.pool.client(&host.id) {
            Ok(client) => self.monitor.watch(client),
            Err(e) => warn!(host_id = %host.id, error = %e, "Cannot follow host"),
        }
    }

    async fn host_down(self: &Arc<Self>, host_id: &HostId) {
        self.monitor.unwatch(host_id);
        let jobs = self.table.jobs_on_host(host_id);
        warn!(host_id = %host_id, jobs = jobs.len(), "Host lost, rescheduling its jobs");
        for (job_id, location) in jobs {
            let Some(entry) = self.table.get(&location.key) else {
                continue;
            };
            let mut state = entry.lock().await;
            self.forget_job(
                &entry,
                &mut state,
                &job_id,
                JobState::Down,
                RemovalReason::Lost,
                Some("host lost".to_string()),
            );
        }
    }

    async fn handle_monitor_event(self: &Arc<Self>, event: MonitorEvent) {
        match event {
            MonitorEvent::Job { host_id, event } => {
                // Queued before the host left the pool.
                if !self.pool.contains(&host_id) {
                    return;
                }
                self.handle_job_event(host_id, event).await;
            }
            MonitorEvent::Resync { host_id } => self.sync_host(&host_id).await,
        }
    }

    #[instrument(skip_all, fields(host_id = %host_id, job_id = %event.job_id, kind = ?event.kind))]
    async fn handle_job_event(self: &Arc<Self>, host_id: HostId, event: HostEvent) {
        let Some(owner) = event.job.job.owner() else {
            debug!("Ignoring event for a job no formation owns");
            return;
        };
        let job_id = event.job_id;

        if event.kind.is_terminal() {
            let Some(entry) = self.table.get(&owner.key) else {
                return;
            };
            let mut state = entry.lock().await;
            let Some(tracked) = state.job(&job_id).cloned() else {
                return;
            };
            if tracked.host_id != host_id {
                return;
            }
            let (record, reason) = match event.kind {
                HostEventKind::Stop => (JobState::Down, RemovalReason::Stopped),
                HostEventKind::Error => (JobState::Crashed, RemovalReason::Failed),
                _ => (JobState::Crashed, RemovalReason::Crashed),
            };
            info!(error = ?event.job.error, "Job ended");
            self.forget_job(&entry, &mut state, &job_id, record, reason, event.job.error.clone());
            if event.kind.is_failure() && tracked.state != TrackedState::Stopping {
                self.record_crash(&entry, &mut state, &tracked.process_type);
            }
            return;
        }

        let key = owner.key;
        let (entry, mut state) = self.table.lock_entry(key).await;
        self.ensure_formation(&mut state, key).await;
        match state.job_mut(&job_id) {
            Some(job) if job.state == TrackedState::Starting => {
                job.state = TrackedState::Running;
                let job = job.clone();
                debug!("Job running");
                self.persist_job(key, &job, JobState::Up, None);
            }
            Some(_) => {}
            None => {
                info!(formation = %key, "Adopting job started elsewhere");
                let job = TrackedJob {
                    job_id,
                    host_id,
                    process_type: owner.process_type,
                    state: TrackedState::Running,
                };
                self.table.insert_job(key, &mut state, job.clone());
                self.persist_job(key, &job, JobState::Up, None);
            }
        }
        self.trigger(&entry);
    }

    /// Counts a crash. Past the threshold the type is degraded; below it
    /// the next launch waits out a backoff.
    fn record_crash(self: &Arc<Self>, entry: &Arc<FormationEntry>, state: &mut FormationState, process_type: &str) {
        let score = state.record_crash(process_type, StdInstant::now());
        if score >= self.config.crash_threshold {
            if state.degraded.insert(process_type.to_string()) {
                error!(
                    formation = %entry.key(),
                    process_type,
                    crash_score = score,
                    "Process type is crash looping, halting launches"
                );
                self.emit(SchedulerEvent::Degraded {
                    key: entry.key(),
                    process_type: process_type.to_string(),
                    crash_score: score,
                });
            }
            return;
        }

        let attempts = state.retries.get(process_type).map_or(0, |r| r.attempts);
        let delay = self.config.backoff.delay(attempts);
        state.retries.insert(
            process_type.to_string(),
            Retry {
                attempts: attempts.saturating_add(1),
                at: Instant::now() + delay,
            },
        );
        debug!(process_type, crash_score = score, restart_in = ?delay, "Delaying restart after crash");
        self.trigger_after(entry, delay);
    }

    /// Loads the desired state of a formation first seen through its jobs.
    async fn ensure_formation(&self, state: &mut FormationState, key: FormationKey) {
        if state.formation.is_some() {
            return;
        }
        match self
            .controller
            .get_expanded_formation(key.app_id, key.release_id)
            .await
        {
            Ok(formation) => state.set_formation(formation),
            Err(e) if e.is_not_found() => debug!(formation = %key, "Jobs belong to no formation"),
            Err(e) => warn!(formation = %key, error = %e, "Failed to load formation"),
        }
    }

    /// Drops a job from the table and records why.
    fn forget_job(
        self: &Arc<Self>,
        entry: &Arc<FormationEntry>,
        state: &mut FormationState,
        job_id: &JobId,
        record: JobState,
        reason: RemovalReason,
        error: Option<String>,
    ) -> Option<TrackedJob> {
        let job = self.table.remove_job(state, job_id)?;
        let key = entry.key();
        self.persist_job(key, &job, record, error);
        self.emit(SchedulerEvent::JobRemoved {
            key,
            process_type: job.process_type.clone(),
            job_id: job.job_id,
            host_id: job.host_id.clone(),
            reason,
        });
        self.trigger(entry);
        Some(job)
    }

    // ---- rectification ----

    #[instrument(skip_all, fields(formation = %entry.key()))]
    async fn rectify(self: &Arc<Self>, entry: Arc<FormationEntry>) {
        // Cleared before locking so changes during this pass queue another.
        entry.clear_pending();
        if !self.may_act() {
            return;
        }
        let mut state = entry.lock().await;
        if entry.is_removed() {
            return;
        }
        let hosts = self.pool.hosts();

        for job_id in rectify::mismatched_jobs(&state, &hosts) {
            info!(job_id = %job_id, "Host no longer matches the job's tags");
            self.stop_job(&entry, &mut state, job_id).await;
        }

        if rectify::scale_request_done(&state) {
            let request = state
                .formation
                .as_mut()
                .and_then(|f| f.pending_scale_request.take());
            if let Some(mut request) = request {
                info!(scale_request = %request.id, "Scale request complete");
                request.state = ScaleRequestState::Complete;
                let _ = self.writes.send(Write::ScaleRequest(request));
            }
        }

        let now = Instant::now();
        for (process_type, diff) in rectify::plan(&state) {
            let count = diff.unsigned_abs() as usize;
            if diff > 0 {
                self.start_jobs(&entry, &mut state, &hosts, &process_type, count, now)
                    .await;
            } else {
                let stops = {
                    let live: Vec<&TrackedJob> = state
                        .jobs_of(&process_type)
                        .filter(|j| j.state != TrackedState::Stopping)
                        .collect();
                    rectify::select_stops(&live, count)
                };
                for job_id in stops {
                    self.stop_job(&entry, &mut state, job_id).await;
                }
            }
        }

        if self.table.remove(&entry, &state) {
            debug!("Formation idle, dropped from table");
        }
    }

    async fn start_jobs(
        self: &Arc<Self>,
        entry: &Arc<FormationEntry>,
        state: &mut FormationState,
        hosts: &[Host],
        process_type: &str,
        count: usize,
        now: Instant,
    ) {
        if state.degraded.contains(process_type) {
            debug!(process_type, "Process type degraded, not starting jobs");
            return;
        }
        if let Some(reason) = state.blocked.get(process_type) {
            debug!(process_type, reason = %reason, "Process type blocked");
            return;
        }
        // A delayed trigger is already queued for the retry.
        if state.retries.get(process_type).is_some_and(|r| r.at > now) {
            return;
        }
        let Some(formation) = state.formation.clone() else {
            return;
        };
        let key = entry.key();

        for _ in 0..count {
            match self.place_job(key, state, &formation, hosts, process_type).await {
                Ok(()) => {
                    state.retries.remove(process_type);
                }
                Err(e) if e.is_permanent() => {
                    warn!(process_type, error = %e, "Cannot place job, blocking process type");
                    state.blocked.insert(process_type.to_string(), e.to_string());
                    self.emit(SchedulerEvent::PendingPlacement {
                        key,
                        process_type: process_type.to_string(),
                        reason: e.to_string(),
                        retry_in: None,
                    });
                    return;
                }
                Err(e) => {
                    let attempts = state.retries.get(process_type).map_or(0, |r| r.attempts);
                    let delay = self.config.backoff.delay(attempts);
                    state.retries.insert(
                        process_type.to_string(),
                        Retry {
                            attempts: attempts.saturating_add(1),
                            at: now + delay,
                        },
                    );
                    warn!(process_type, error = %e, retry_in = ?delay, "Failed to place job");
                    self.emit(SchedulerEvent::PendingPlacement {
                        key,
                        process_type: process_type.to_string(),
                        reason: e.to_string(),
                        retry_in: Some(delay),
                    });
                    self.trigger_after(entry, delay);
                    return;
                }
            }
        }
    }

    /// Places one job. It is tracked as starting before the host is asked,
    /// so the host's start event always finds it.
    async fn place_job(
        &self,
        key: FormationKey,
        state: &mut FormationState,
        formation: &ExpandedFormation,
        hosts: &[Host],
        process_type: &str,
    ) -> SchedulerResult<()> {
        let load = rectify::type_load(state, process_type);
        let host = rectify::select_host(hosts, process_type, formation.tags_for(process_type), &load)?;
        let spec = rectify::job_spec(formation, process_type)?;
        let client = self.pool.client(&host.id)?;

        let job = TrackedJob {
            job_id: spec.id,
            host_id: host.id.clone(),
            process_type: process_type.to_string(),
            state: TrackedState::Starting,
        };
        self.table.insert_job(key, state, job.clone());

        let timeout = self.config.attempt_timeout;
        let result = match tokio::time::timeout(timeout, client.add_jobs(vec![spec])).await {
            Ok(result) => result.map_err(SchedulerError::from),
            Err(_) => Err(SchedulerError::Timeout(timeout)),
        };
        if let Err(e) = result {
            self.table.remove_job(state, &job.job_id);
            return Err(e);
        }

        info!(job_id = %job.job_id, host_id = %job.host_id, process_type, "Placed job");
        self.persist_job(key, &job, JobState::Starting, None);
        self.emit(SchedulerEvent::JobPlaced {
            key,
            process_type: job.process_type,
            job_id: job.job_id,
            host_id: job.host_id,
        });
        Ok(())
    }

    async fn stop_job(self: &Arc<Self>, entry: &Arc<FormationEntry>, state: &mut FormationState, job_id: JobId) {
        let Some(job) = state.job_mut(&job_id) else {
            return;
        };
        job.state = TrackedState::Stopping;
        let job = job.clone();

        info!(job_id = %job_id, host_id = %job.host_id, process_type = %job.process_type, "Stopping job");
        self.persist_job(entry.key(), &job, JobState::Stopping, None);
        self.emit(SchedulerEvent::JobStopRequested {
            key: entry.key(),
            process_type: job.process_type.clone(),
            job_id,
            host_id: job.host_id.clone(),
        });
        self.request_stop(entry, state, &job).await;
    }

    /// Asks the job's host to stop it. The job stays tracked until the
    /// host reports the stop; a host that no longer knows the job has
    /// nothing left to stop.
    async fn request_stop(
        self: &Arc<Self>,
        entry: &Arc<FormationEntry>,
        state: &mut FormationState,
        job: &TrackedJob,
    ) {
        let timeout = self.config.attempt_timeout;
        let result = match self.pool.client(&job.host_id) {
            Ok(client) => match tokio::time::timeout(timeout, client.stop_job(job.job_id)).await {
                Ok(result) => result.map_err(SchedulerError::from),
                Err(_) => Err(SchedulerError::Timeout(timeout)),
            },
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => {}
            Err(SchedulerError::Host(HostError::JobNotFound(_))) => {
                self.forget_job(entry, state, &job.job_id, JobState::Down, RemovalReason::Missing, None);
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Failed to stop job, retrying on next sync");
            }
        }
    }

    // ---- anti-entropy ----

    #[instrument(skip_all, name = "sync_jobs")]
    async fn sync_jobs(self: &Arc<Self>) {
        debug!("Synchronizing jobs with hosts");
        for host in self.pool.hosts() {
            self.sync_host(&host.id).await;
        }

        for job_id in self.table.job_ids() {
            let Some(location) = self.table.locate(&job_id) else {
                continue;
            };
            if self.pool.contains(&location.host_id) {
                continue;
            }
            let Some(entry) = self.table.get(&location.key) else {
                continue;
            };
            let mut state = entry.lock().await;
            self.forget_job(
                &entry,
                &mut state,
                &job_id,
                JobState::Down,
                RemovalReason::Lost,
                Some("host lost".to_string()),
            );
        }

        for key in self.table.keys() {
            if let Some(entry) = self.table.get(&key) {
                entry.lock().await.blocked.clear();
            }
        }

        if self.current.load(Ordering::Acquire) && !self.ready.swap(true, Ordering::AcqRel) {
            info!("Scheduler ready");
        }
        self.emit(SchedulerEvent::Synced);
        self.rectify_all();
    }

    /// Reconciles the table with the jobs one host reports.
    #[instrument(skip_all, fields(host_id = %host_id))]
    async fn sync_host(self: &Arc<Self>, host_id: &HostId) {
        let client = match self.pool.client(host_id) {
            Ok(client) => client,
            Err(e) => {
                debug!(error = %e, "Skipping host sync");
                return;
            }
        };
        let jobs = match tokio::time::timeout(self.config.attempt_timeout, client.list_jobs()).await {
            Ok(Ok(jobs)) => jobs,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to list host jobs");
                return;
            }
            Err(_) => {
                warn!("Timed out listing host jobs");
                return;
            }
        };

        for active in jobs.values().filter(|j| !j.status.is_terminal()) {
            self.sync_active_job(host_id, client.as_ref(), active).await;
        }

        for (job_id, location) in self.table.jobs_on_host(host_id) {
            if jobs.get(&job_id).is_some_and(|j| !j.status.is_terminal()) {
                continue;
            }
            // The listing may predate a placement; ask about the job itself.
            let record = match client.get_job(job_id).await {
                Ok(active) if !active.status.is_terminal() => continue,
                Ok(active) if active.status == JobStatus::Done => JobState::Down,
                Ok(_) => JobState::Crashed,
                Err(HostError::JobNotFound(_)) => JobState::Down,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Failed to check job");
                    continue;
                }
            };
            let Some(entry) = self.table.get(&location.key) else {
                continue;
            };
            let mut state = entry.lock().await;
            info!(job_id = %job_id, "Job missing from host");
            self.forget_job(
                &entry,
                &mut state,
                &job_id,
                record,
                RemovalReason::Missing,
                Some("job missing from host".to_string()),
            );
        }
    }

    async fn sync_active_job(self: &Arc<Self>, host_id: &HostId, client: &dyn HostClient, active: &ActiveJob) {
        let job_id = active.id();
        let Some(owner) = active.job.owner() else {
            return;
        };

        match self.table.locate(&job_id) {
            Some(location) if &location.host_id != host_id => {
                warn!(
                    job_id = %job_id,
                    tracked_host = %location.host_id,
                    "Job running on an unexpected host, stopping it"
                );
                if let Err(e) = client.stop_job(job_id).await {
                    warn!(job_id = %job_id, error = %e, "Failed to stop stray job");
                }
            }
            Some(location) => {
                let Some(entry) = self.table.get(&location.key) else {
                    return;
                };
                let mut state = entry.lock().await;
                let Some(job) = state.job_mut(&job_id) else {
                    return;
                };
                match job.state {
                    TrackedState::Starting if active.status == JobStatus::Running => {
                        job.state = TrackedState::Running;
                        let job = job.clone();
                        self.persist_job(location.key, &job, JobState::Up, None);
                        self.trigger(&entry);
                    }
                    TrackedState::Stopping => {
                        let job = job.clone();
                        debug!(job_id = %job_id, "Re-issuing stop");
                        self.request_stop(&entry, &mut state, &job).await;
                    }
                    _ => {}
                }
            }
            None => {
                let key = owner.key;
                let (entry, mut state) = self.table.lock_entry(key).await;
                // An event may have tracked it meanwhile.
                if state.job(&job_id).is_some() {
                    return;
                }
                self.ensure_formation(&mut state, key).await;
                let (tracked, record) = if active.status == JobStatus::Running {
                    (TrackedState::Running, JobState::Up)
                } else {
                    (TrackedState::Starting, JobState::Starting)
                };
                info!(job_id = %job_id, formation = %key, "Adopting untracked job");
                let job = TrackedJob {
                    job_id,
                    host_id: host_id.clone(),
                    process_type: owner.process_type,
                    state: tracked,
                };
                self.table.insert_job(key, &mut state, job.clone());
                self.persist_job(key, &job, record, None);
                self.trigger(&entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockCluster;
    use tug_controller::MemoryController;

    fn scheduler() -> Scheduler {
        let pool = Arc::new(HostPool::new(Arc::new(MockCluster::new())));
        Scheduler::new(
            Arc::new(MemoryController::new()),
            pool,
            SchedulerConfig::default(),
            None,
        )
    }

    #[tokio::test]
    async fn test_promotion_waits_for_a_sync() {
        let scheduler = scheduler();
        let inner = &scheduler.inner;
        inner.current.store(true, Ordering::Release);
        inner.sync_jobs().await;
        assert!(inner.may_act());

        inner.set_leader(false);
        assert!(!inner.may_act());
        assert!(scheduler.is_ready());

        inner.set_leader(true);
        assert!(scheduler.is_leader());
        assert!(!scheduler.is_ready());
        assert!(!inner.may_act());

        inner.leader_changed(true).await;
        assert!(inner.may_act());
    }
}
