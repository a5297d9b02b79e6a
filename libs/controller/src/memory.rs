//! In-memory controller.
//!
//! Holds the same records the real controller persists and implements the
//! full [`ControllerClient`] surface, including the formation and job event
//! streams. Used by tests and by single-process development setups.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use tug_events::{
    App, Artifact, Deployment, DeploymentEvent, DeploymentStatus, DeploymentStrategy,
    ExpandedFormation, Formation, FormationKey, FormationUpdate, JobRecord, Processes, Release,
    ScaleRequest, ScaleRequestState,
};
use tug_id::{AppId, ArtifactId, DeploymentId, JobId, ReleaseId, ScaleRequestId};

use crate::{ControllerClient, ControllerError, ControllerResult, ControllerStream};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct FormationRow {
    formation: Formation,
    deleted: bool,
    pending: Option<ScaleRequestId>,
}

#[derive(Debug, Default)]
struct Inner {
    apps: HashMap<AppId, App>,
    releases: HashMap<ReleaseId, Release>,
    artifacts: HashMap<ArtifactId, Artifact>,
    formations: HashMap<FormationKey, FormationRow>,
    scale_requests: HashMap<ScaleRequestId, ScaleRequest>,
    deployments: HashMap<DeploymentId, Deployment>,
    deployment_events: Vec<DeploymentEvent>,
    jobs: BTreeMap<JobId, JobRecord>,
    clock: Option<DateTime<Utc>>,
}

impl Inner {
    /// Strictly increasing commit timestamps, at the microsecond precision
    /// the stream cursor carries.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let ts = match self.clock {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(ts);
        ts
    }

    fn expand(&self, row: &FormationRow) -> ControllerResult<ExpandedFormation> {
        let f = &row.formation;
        let app = self
            .apps
            .get(&f.app_id)
            .cloned()
            .ok_or_else(|| ControllerError::not_found("app", f.app_id))?;
        let release = self
            .releases
            .get(&f.release_id)
            .cloned()
            .ok_or_else(|| ControllerError::not_found("release", f.release_id))?;
        let artifacts = release
            .artifact_ids
            .iter()
            .map(|id| {
                self.artifacts
                    .get(id)
                    .cloned()
                    .ok_or_else(|| ControllerError::not_found("artifact", id))
            })
            .collect::<ControllerResult<Vec<_>>>()?;

        Ok(ExpandedFormation {
            app,
            release,
            artifacts,
            processes: if row.deleted {
                Processes::new()
            } else {
                f.processes.clone()
            },
            tags: f.tags.clone(),
            pending_scale_request: row
                .pending
                .and_then(|id| self.scale_requests.get(&id).cloned()),
            updated_at: f.updated_at.unwrap_or_else(Utc::now),
            deleted: row.deleted,
        })
    }

    fn validate(&self, formation: &Formation) -> ControllerResult<()> {
        if !self.apps.contains_key(&formation.app_id) {
            return Err(ControllerError::not_found("app", formation.app_id));
        }
        let release = self
            .releases
            .get(&formation.release_id)
            .ok_or_else(|| ControllerError::not_found("release", formation.release_id))?;
        for (process_type, count) in &formation.processes {
            if *count > 0 && !release.has_process(process_type) {
                return Err(ControllerError::Validation(format!(
                    "release {} has no process type {process_type:?}",
                    release.id
                )));
            }
        }
        Ok(())
    }
}

/// An in-memory [`ControllerClient`].
#[derive(Debug)]
pub struct MemoryController {
    inner: Mutex<Inner>,
    formations_tx: broadcast::Sender<ExpandedFormation>,
    jobs_tx: broadcast::Sender<JobRecord>,
    deployment_events_tx: broadcast::Sender<DeploymentEvent>,
}

impl Default for MemoryController {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryController {
    pub fn new() -> Self {
        let (formations_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (jobs_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (deployment_events_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            formations_tx,
            jobs_tx,
            deployment_events_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_app(&self, name: impl Into<String>) -> App {
        let app = App {
            id: AppId::new(),
            name: name.into(),
            release_id: None,
            meta: BTreeMap::new(),
        };
        self.lock().apps.insert(app.id, app.clone());
        app
    }

    pub fn create_artifact(&self, uri: impl Into<String>) -> Artifact {
        let artifact = Artifact {
            id: ArtifactId::new(),
            kind: "docker".to_string(),
            uri: uri.into(),
            created_at: Some(Utc::now()),
        };
        self.lock().artifacts.insert(artifact.id, artifact.clone());
        artifact
    }

    pub fn put_release(&self, release: Release) {
        self.lock().releases.insert(release.id, release);
    }

    /// Creates a pending deployment of `new_release_id`.
    ///
    /// The old release is the app's current release. Target counts default
    /// to the old release's formation.
    pub fn create_deployment(
        &self,
        app_id: AppId,
        new_release_id: ReleaseId,
        strategy: DeploymentStrategy,
        timeout_secs: u64,
        processes: Option<Processes>,
    ) -> ControllerResult<Deployment> {
        let mut inner = self.lock();
        let app = inner
            .apps
            .get(&app_id)
            .ok_or_else(|| ControllerError::not_found("app", app_id))?;
        let old_release_id = app.release_id;
        if !inner.releases.contains_key(&new_release_id) {
            return Err(ControllerError::not_found("release", new_release_id));
        }
        let processes = match processes {
            Some(p) => p,
            None => old_release_id
                .and_then(|old| inner.formations.get(&FormationKey::new(app_id, old)))
                .filter(|row| !row.deleted)
                .map(|row| row.formation.processes.clone())
                .unwrap_or_default(),
        };

        let deployment = Deployment {
            id: DeploymentId::new(),
            app_id,
            old_release_id,
            new_release_id,
            processes,
            strategy,
            timeout_secs,
            status: DeploymentStatus::Pending,
            created_at: Some(Utc::now()),
            finished_at: None,
        };
        inner.deployments.insert(deployment.id, deployment.clone());
        Ok(deployment)
    }

    pub fn app(&self, app_id: AppId) -> Option<App> {
        self.lock().apps.get(&app_id).cloned()
    }

    /// The live formation for `key`, if any.
    pub fn formation(&self, key: FormationKey) -> Option<Formation> {
        self.lock()
            .formations
            .get(&key)
            .filter(|row| !row.deleted)
            .map(|row| row.formation.clone())
    }

    pub fn scale_request(&self, id: ScaleRequestId) -> Option<ScaleRequest> {
        self.lock().scale_requests.get(&id).cloned()
    }

    pub fn deployment_events(&self, deployment_id: DeploymentId) -> Vec<DeploymentEvent> {
        self.lock()
            .deployment_events
            .iter()
            .filter(|e| e.deployment_id == deployment_id)
            .cloned()
            .collect()
    }

    pub fn subscribe_deployment_events(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.deployment_events_tx.subscribe()
    }

    /// Every job record, in job id order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.lock().jobs.values().cloned().collect()
    }

    fn store_formation(&self, inner: &mut Inner, mut row: FormationRow) -> FormationRow {
        row.formation.updated_at = Some(inner.tick());
        let key = row.formation.key();
        inner.formations.insert(key, row.clone());
        match inner.expand(&row) {
            Ok(expanded) => {
                debug!(formation = %key, deleted = row.deleted, "Formation changed");
                // No receivers is fine.
                let _ = self.formations_tx.send(expanded);
            }
            Err(e) => debug!(formation = %key, error = %e, "Formation not expandable"),
        }
        row
    }
}

fn lagged<T>(item: Result<T, BroadcastStreamRecvError>) -> ControllerResult<T> {
    item.map_err(|BroadcastStreamRecvError::Lagged(n)| ControllerError::Lagged(n))
}

#[async_trait]
impl ControllerClient for MemoryController {
    async fn stream_formations(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ControllerResult<ControllerStream<FormationUpdate>> {
        // Subscribe and snapshot under one lock so nothing falls between.
        let (snapshot, rx) = {
            let inner = self.lock();
            let rx = self.formations_tx.subscribe();
            let mut rows: Vec<&FormationRow> = inner
                .formations
                .values()
                .filter(|row| match since {
                    Some(since) => row.formation.updated_at.is_some_and(|t| t > since),
                    None => !row.deleted,
                })
                .collect();
            rows.sort_by_key(|row| row.formation.updated_at);
            let snapshot: Vec<ExpandedFormation> = rows
                .into_iter()
                .filter_map(|row| inner.expand(row).ok())
                .collect();
            (snapshot, rx)
        };

        let initial = stream::iter(
            snapshot
                .into_iter()
                .map(|f| Ok(FormationUpdate::Formation(Box::new(f))))
                .chain(std::iter::once(Ok(FormationUpdate::Current))),
        );
        let live = BroadcastStream::new(rx)
            .map(|item| lagged(item).map(|f| FormationUpdate::Formation(Box::new(f))));

        Ok(initial.chain(live).boxed())
    }

    async fn get_app(&self, app_id: AppId) -> ControllerResult<App> {
        self.app(app_id)
            .ok_or_else(|| ControllerError::not_found("app", app_id))
    }

    async fn get_formation(
        &self,
        app_id: AppId,
        release_id: ReleaseId,
    ) -> ControllerResult<Formation> {
        let key = FormationKey::new(app_id, release_id);
        self.formation(key)
            .ok_or_else(|| ControllerError::not_found("formation", key))
    }

    async fn get_expanded_formation(
        &self,
        app_id: AppId,
        release_id: ReleaseId,
    ) -> ControllerResult<ExpandedFormation> {
        let key = FormationKey::new(app_id, release_id);
        let inner = self.lock();
        let row = inner
            .formations
            .get(&key)
            .filter(|row| !row.deleted)
            .ok_or_else(|| ControllerError::not_found("formation", key))?;
        inner.expand(row)
    }

    async fn get_release(&self, release_id: ReleaseId) -> ControllerResult<Release> {
        self.lock()
            .releases
            .get(&release_id)
            .cloned()
            .ok_or_else(|| ControllerError::not_found("release", release_id))
    }

    async fn get_artifact(&self, artifact_id: ArtifactId) -> ControllerResult<Artifact> {
        self.lock()
            .artifacts
            .get(&artifact_id)
            .cloned()
            .ok_or_else(|| ControllerError::not_found("artifact", artifact_id))
    }

    async fn put_formation(&self, formation: &Formation) -> ControllerResult<Formation> {
        let mut inner = self.lock();
        inner.validate(formation)?;
        let pending = inner
            .formations
            .get(&formation.key())
            .filter(|row| !row.deleted)
            .and_then(|row| row.pending);
        let row = self.store_formation(
            &mut inner,
            FormationRow {
                formation: formation.clone(),
                deleted: false,
                pending,
            },
        );
        Ok(row.formation)
    }

    async fn delete_formation(&self, app_id: AppId, release_id: ReleaseId) -> ControllerResult<()> {
        let key = FormationKey::new(app_id, release_id);
        let mut inner = self.lock();
        let Some(existing) = inner.formations.get(&key).filter(|row| !row.deleted).cloned() else {
            return Err(ControllerError::not_found("formation", key));
        };
        self.store_formation(
            &mut inner,
            FormationRow {
                formation: existing.formation,
                deleted: true,
                pending: None,
            },
        );
        Ok(())
    }

    async fn set_app_release(&self, app_id: AppId, release_id: ReleaseId) -> ControllerResult<()> {
        let mut inner = self.lock();
        if !inner.releases.contains_key(&release_id) {
            return Err(ControllerError::not_found("release", release_id));
        }
        let app = inner
            .apps
            .get_mut(&app_id)
            .ok_or_else(|| ControllerError::not_found("app", app_id))?;
        app.release_id = Some(release_id);
        Ok(())
    }

    async fn add_scale_request(&self, request: &ScaleRequest) -> ControllerResult<ScaleRequest> {
        if request.new_processes.is_none() && request.new_tags.is_none() {
            return Err(ControllerError::Validation(
                "scale request must set processes or tags".to_string(),
            ));
        }

        let mut inner = self.lock();
        let key = request.key();
        let now = Utc::now();
        let current = inner
            .formations
            .get(&key)
            .filter(|row| !row.deleted)
            .map(|row| row.formation.clone())
            .unwrap_or_else(|| Formation::new(key.app_id, key.release_id, Processes::new()));

        for existing in inner.scale_requests.values_mut() {
            if existing.key() == key && existing.is_pending() {
                existing.state = ScaleRequestState::Cancelled;
                existing.updated_at = Some(now);
            }
        }

        let mut req = request.clone();
        req.state = ScaleRequestState::Pending;
        req.old_processes = Some(current.processes.clone());
        req.old_tags = Some(current.tags.clone());
        req.created_at = Some(now);
        req.updated_at = Some(now);

        let mut formation = current;
        if let Some(processes) = &req.new_processes {
            formation.processes = processes.clone();
        }
        if let Some(tags) = &req.new_tags {
            formation.tags = tags.clone();
        }
        inner.validate(&formation)?;

        inner.scale_requests.insert(req.id, req.clone());
        self.store_formation(
            &mut inner,
            FormationRow {
                formation,
                deleted: false,
                pending: Some(req.id),
            },
        );
        Ok(req)
    }

    async fn update_scale_request(&self, request: &ScaleRequest) -> ControllerResult<()> {
        let mut inner = self.lock();
        let stored = inner
            .scale_requests
            .get_mut(&request.id)
            .ok_or_else(|| ControllerError::not_found("scale request", request.id))?;
        if stored.state == ScaleRequestState::Cancelled {
            return Ok(());
        }
        stored.state = request.state;
        stored.updated_at = Some(Utc::now());

        if !stored.is_pending() {
            let key = stored.key();
            if let Some(row) = inner.formations.get_mut(&key) {
                if row.pending == Some(request.id) {
                    row.pending = None;
                }
            }
        }
        Ok(())
    }

    async fn get_deployment(&self, deployment_id: DeploymentId) -> ControllerResult<Deployment> {
        self.lock()
            .deployments
            .get(&deployment_id)
            .cloned()
            .ok_or_else(|| ControllerError::not_found("deployment", deployment_id))
    }

    async fn create_deployment_event(&self, event: &DeploymentEvent) -> ControllerResult<()> {
        let mut inner = self.lock();
        let deployment = inner
            .deployments
            .get_mut(&event.deployment_id)
            .ok_or_else(|| ControllerError::not_found("deployment", event.deployment_id))?;
        deployment.status = event.status;
        if event.status.is_terminal() {
            deployment.finished_at = Some(event.timestamp);
        }
        inner.deployment_events.push(event.clone());
        let _ = self.deployment_events_tx.send(event.clone());
        Ok(())
    }

    async fn put_job(&self, job: &JobRecord) -> ControllerResult<()> {
        let mut inner = self.lock();
        inner.jobs.insert(job.job_id, job.clone());
        let _ = self.jobs_tx.send(job.clone());
        Ok(())
    }

    async fn list_jobs(&self, app_id: AppId) -> ControllerResult<Vec<JobRecord>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn stream_job_events(
        &self,
        app_id: AppId,
    ) -> ControllerResult<ControllerStream<JobRecord>> {
        let rx = self.jobs_tx.subscribe();
        Ok(BroadcastStream::new(rx)
            .filter_map(move |item| async move {
                match lagged(item) {
                    Ok(job) if job.app_id != app_id => None,
                    other => Some(other),
                }
            })
            .boxed())
    }
}
