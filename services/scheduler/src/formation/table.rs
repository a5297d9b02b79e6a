//! The in-memory formation table.
//!
//! Maps each formation to its desired state and the jobs the scheduler
//! believes are running for it. The outer map sits behind a read-write
//! lock; each formation has its own async mutex, held for the whole of a
//! rectification. A second index maps job ids to their formation so host
//! events route in constant time.
//!
//! Lock order: a formation's mutex may be held while taking either outer
//! lock, never the other way round.
//!
//! An idle formation is dropped while its mutex is held, and its entry is
//! marked removed. A task that locks an entry it fetched earlier must check
//! [`FormationEntry::is_removed`] and refetch, or use
//! [`FormationTable::lock_entry`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant as StdInstant;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tug_events::{ExpandedFormation, FormationKey, Processes};
use tug_id::{HostId, JobId};
use tug_reconcile::{ConvergenceStatus, DecayingCounter, CRASH_HALF_LIFE};

/// Scheduler-side state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedState {
    /// Accepted by the host, no start event yet.
    Starting,
    Running,
    /// Stop requested; the job stays tracked until the host reports it.
    Stopping,
}

/// A job the scheduler tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedJob {
    pub job_id: JobId,
    pub host_id: HostId,
    pub process_type: String,
    pub state: TrackedState,
}

/// Where a job lives, from the job index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLocation {
    pub key: FormationKey,
    pub host_id: HostId,
    pub process_type: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Retry {
    pub attempts: u32,
    pub at: Instant,
}

/// Runtime state of one formation.
#[derive(Debug)]
pub struct FormationState {
    /// Last observed desired state. `None` when the formation is only
    /// known from jobs found on hosts.
    pub formation: Option<ExpandedFormation>,
    jobs: BTreeMap<String, BTreeMap<JobId, TrackedJob>>,
    /// Types no host can take, with the reason.
    pub(crate) blocked: BTreeMap<String, String>,
    /// Types whose launches are halted after a crash loop.
    pub(crate) degraded: BTreeSet<String>,
    pub(crate) crashes: BTreeMap<String, DecayingCounter>,
    pub(crate) retries: BTreeMap<String, Retry>,
}

impl FormationState {
    fn new() -> Self {
        Self {
            formation: None,
            jobs: BTreeMap::new(),
            blocked: BTreeMap::new(),
            degraded: BTreeSet::new(),
            crashes: BTreeMap::new(),
            retries: BTreeMap::new(),
        }
    }

    /// Desired counts; nothing when the formation is unknown or deleted.
    pub fn desired(&self) -> Processes {
        self.formation
            .as_ref()
            .map(ExpandedFormation::desired_processes)
            .unwrap_or_default()
    }

    /// Records a new desired state. Types whose count or tags changed get a
    /// clean slate: unblocked, not degraded, no pending retry.
    pub fn set_formation(&mut self, formation: ExpandedFormation) {
        let old_desired = self.desired();
        let old_tags = self.formation.as_ref().map(|f| f.tags.clone());
        let new_desired = formation.desired_processes();

        let mut types: BTreeSet<String> = old_desired.keys().cloned().collect();
        types.extend(new_desired.keys().cloned());
        types.extend(self.jobs.keys().cloned());
        for t in types {
            let count_changed = old_desired.get(&t) != new_desired.get(&t);
            let tags_changed = old_tags
                .as_ref()
                .is_none_or(|tags| tags.get(&t) != formation.tags.get(&t));
            if count_changed || tags_changed {
                self.blocked.remove(&t);
                self.degraded.remove(&t);
                self.retries.remove(&t);
                if let Some(counter) = self.crashes.get_mut(&t) {
                    counter.reset();
                }
            }
        }
        self.formation = Some(formation);
    }

    pub fn job(&self, job_id: &JobId) -> Option<&TrackedJob> {
        self.jobs.values().find_map(|jobs| jobs.get(job_id))
    }

    pub(crate) fn job_mut(&mut self, job_id: &JobId) -> Option<&mut TrackedJob> {
        self.jobs.values_mut().find_map(|jobs| jobs.get_mut(job_id))
    }

    /// Jobs of one type in job id order.
    pub fn jobs_of(&self, process_type: &str) -> impl Iterator<Item = &TrackedJob> {
        self.jobs.get(process_type).into_iter().flat_map(|m| m.values())
    }

    pub fn jobs(&self) -> impl Iterator<Item = &TrackedJob> {
        self.jobs.values().flat_map(|m| m.values())
    }

    /// Process types with desired counts or tracked jobs.
    pub fn process_types(&self) -> BTreeSet<String> {
        let mut types: BTreeSet<String> = self.desired().into_keys().collect();
        types.extend(
            self.jobs
                .iter()
                .filter(|(_, jobs)| !jobs.is_empty())
                .map(|(t, _)| t.clone()),
        );
        types
    }

    /// Jobs per type that are not on their way out.
    pub fn live_counts(&self) -> Processes {
        self.count_where(|j| j.state != TrackedState::Stopping)
    }

    /// Jobs per type that the host reports running.
    pub fn running_counts(&self) -> Processes {
        self.count_where(|j| j.state == TrackedState::Running)
    }

    fn count_where(&self, pred: impl Fn(&TrackedJob) -> bool) -> Processes {
        self.jobs
            .iter()
            .map(|(t, jobs)| (t.clone(), jobs.values().filter(|j| pred(j)).count() as u32))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// Every job is running and the counts match the desired state.
    pub fn is_converged(&self) -> bool {
        self.jobs().all(|j| j.state == TrackedState::Running)
            && tug_reconcile::processes_equal(&self.desired(), &self.running_counts())
    }

    /// Nothing desired and nothing running: the formation can leave the
    /// table.
    pub fn is_idle(&self) -> bool {
        self.desired().values().all(|n| *n == 0) && self.jobs().next().is_none()
    }

    pub fn status(&self, process_type: &str) -> ConvergenceStatus {
        if self.degraded.contains(process_type) {
            return ConvergenceStatus::Degraded;
        }
        if self.blocked.contains_key(process_type) {
            return ConvergenceStatus::Blocked;
        }
        let want = self.desired().get(process_type).copied().unwrap_or(0);
        let settled = self.jobs_of(process_type).all(|j| j.state == TrackedState::Running);
        let have = self.jobs_of(process_type).count() as u32;
        if settled && want == have {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }

    /// Counts a crash of `process_type` and returns the decayed total.
    pub(crate) fn record_crash(&mut self, process_type: &str, now: StdInstant) -> f64 {
        self.crashes
            .entry(process_type.to_string())
            .or_insert_with(|| DecayingCounter::new(CRASH_HALF_LIFE))
            .record(now)
    }
}

/// A formation's entry in the table.
pub struct FormationEntry {
    key: FormationKey,
    pending: AtomicBool,
    removed: AtomicBool,
    state: Arc<Mutex<FormationState>>,
}

impl FormationEntry {
    pub fn key(&self) -> FormationKey {
        self.key
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, FormationState> {
        self.state.lock().await
    }

    /// True once the table dropped this entry. Only meaningful while the
    /// mutex is held.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Marks a rectification as queued. Returns false if one already was.
    pub(crate) fn mark_pending(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_pending(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

/// Counts for one formation at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormationSnapshot {
    pub key: FormationKey,
    pub desired: Processes,
    pub running: Processes,
    pub status: BTreeMap<String, ConvergenceStatus>,
}

/// Every formation the scheduler knows about.
#[derive(Default)]
pub struct FormationTable {
    formations: RwLock<HashMap<FormationKey, Arc<FormationEntry>>>,
    index: RwLock<HashMap<JobId, JobLocation>>,
}

impl FormationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &FormationKey) -> Option<Arc<FormationEntry>> {
        self.formations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// The entry for `key`, created empty if absent.
    pub fn entry(&self, key: FormationKey) -> Arc<FormationEntry> {
        if let Some(entry) = self.get(&key) {
            return entry;
        }
        self.formations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_insert_with(|| {
                Arc::new(FormationEntry {
                    key,
                    pending: AtomicBool::new(false),
                    removed: AtomicBool::new(false),
                    state: Arc::new(Mutex::new(FormationState::new())),
                })
            })
            .clone()
    }

    /// Locks the live entry for `key`, creating it if absent.
    pub async fn lock_entry(
        &self,
        key: FormationKey,
    ) -> (Arc<FormationEntry>, OwnedMutexGuard<FormationState>) {
        loop {
            let entry = self.entry(key);
            let state = entry.state.clone().lock_owned().await;
            if !entry.is_removed() {
                return (entry, state);
            }
        }
    }

    pub fn keys(&self) -> Vec<FormationKey> {
        let mut keys: Vec<_> = self
            .formations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.formations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops `entry` if it is idle and still the table's entry for its
    /// key. The caller holds its mutex.
    pub(crate) fn remove(&self, entry: &Arc<FormationEntry>, state: &FormationState) -> bool {
        if !state.is_idle() || entry.is_removed() {
            return false;
        }
        let mut formations = self.formations.write().unwrap_or_else(|e| e.into_inner());
        match formations.get(&entry.key) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                formations.remove(&entry.key);
                entry.removed.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    pub fn locate(&self, job_id: &JobId) -> Option<JobLocation> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }

    /// Tracks a job in its formation and in the job index.
    pub fn insert_job(&self, key: FormationKey, state: &mut FormationState, job: TrackedJob) {
        self.index.write().unwrap_or_else(|e| e.into_inner()).insert(
            job.job_id,
            JobLocation {
                key,
                host_id: job.host_id.clone(),
                process_type: job.process_type.clone(),
            },
        );
        state
            .jobs
            .entry(job.process_type.clone())
            .or_default()
            .insert(job.job_id, job);
    }

    /// Forgets a job in both places.
    pub fn remove_job(&self, state: &mut FormationState, job_id: &JobId) -> Option<TrackedJob> {
        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
        let (process_type, job) = state
            .jobs
            .iter_mut()
            .find_map(|(t, jobs)| jobs.remove(job_id).map(|j| (t.clone(), j)))?;
        if state.jobs.get(&process_type).is_some_and(BTreeMap::is_empty) {
            state.jobs.remove(&process_type);
        }
        Some(job)
    }

    /// Tracked jobs on a host, with their locations.
    pub fn jobs_on_host(&self, host_id: &HostId) -> Vec<(JobId, JobLocation)> {
        let mut jobs: Vec<_> = self
            .index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, loc)| &loc.host_id == host_id)
            .map(|(id, loc)| (*id, loc.clone()))
            .collect();
        jobs.sort_by_key(|(id, _)| *id);
        jobs
    }

    /// Every tracked job id.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Read-only counts for every formation, in key order.
    pub async fn snapshot(&self) -> Vec<FormationSnapshot> {
        let mut out = Vec::new();
        for key in self.keys() {
            let Some(entry) = self.get(&key) else {
                continue;
            };
            let state = entry.lock().await;
            let status = state
                .process_types()
                .into_iter()
                .map(|t| {
                    let s = state.status(&t);
                    (t, s)
                })
                .collect();
            out.push(FormationSnapshot {
                key,
                desired: state.desired(),
                running: state.running_counts(),
                status,
            });
        }
        out
    }
}
