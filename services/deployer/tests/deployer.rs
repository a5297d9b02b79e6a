use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tug_controller::{ControllerClient, MemoryController};
use tug_deployer::{Deployer, DeployerConfig};
use tug_events::{
    DeploymentEvent, DeploymentStatus, DeploymentStrategy, Formation, FormationKey, JobState,
    ProcessType, Processes, Release,
};
use tug_id::{AppId, HostId, ReleaseId};
use tug_reconcile::BackoffPolicy;
use tug_scheduler::{Host, HostPool, MockCluster, Scheduler, SchedulerConfig};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tug_deployer=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn web(n: u32) -> Processes {
    Processes::from([("web".to_string(), n)])
}

/// A scheduler over two mock hosts, with one app running release `old`.
struct Cluster {
    controller: Arc<MemoryController>,
    mock: Arc<MockCluster>,
    app_id: AppId,
    old: ReleaseId,
    shutdown: watch::Sender<bool>,
}

impl Cluster {
    async fn start(replicas: u32) -> Self {
        init_tracing();
        let mock = Arc::new(MockCluster::new());
        let pool = Arc::new(HostPool::new(mock.clone()));
        for (n, id) in ["h1", "h2"].into_iter().enumerate() {
            mock.add_host(id);
            pool.add_host(Host {
                id: HostId::new(id).unwrap(),
                addr: format!("10.0.0.{}:1113", n + 1),
                tags: BTreeMap::new(),
            });
        }

        let quick = BackoffPolicy {
            base: Duration::from_millis(20),
            max: Duration::from_millis(20),
            jitter: 0.0,
        };
        let config = SchedulerConfig {
            sync_interval: Duration::from_secs(3600),
            backoff: quick.clone(),
            host_backoff: quick,
            debounce: Duration::from_millis(10),
            ..SchedulerConfig::default()
        };

        let controller = Arc::new(MemoryController::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler::new(controller.clone(), pool, config, None);
        tokio::spawn(async move { scheduler.run(shutdown_rx).await });

        let app = controller.create_app("web");
        let old = release(&controller, app.id, "registry.local/web:1");
        controller
            .put_formation(&Formation::new(app.id, old, web(replicas)))
            .await
            .unwrap();
        controller.set_app_release(app.id, old).await.unwrap();

        let cluster = Self {
            controller,
            mock,
            app_id: app.id,
            old,
            shutdown,
        };
        cluster.wait_for_jobs(old, replicas).await;
        cluster
    }

    fn new_release(&self) -> ReleaseId {
        release(&self.controller, self.app_id, "registry.local/web:2")
    }

    fn running(&self, release_id: ReleaseId) -> usize {
        self.mock
            .jobs()
            .iter()
            .filter(|j| j.job.owner().is_some_and(|o| o.key.release_id == release_id))
            .count()
    }

    /// Waits until exactly `n` jobs run and all of them belong to
    /// `release_id`, with every one recorded up by the controller.
    async fn wait_for_jobs(&self, release_id: ReleaseId, n: u32) {
        let n = n as usize;
        timeout(WAIT, async {
            loop {
                let up = self
                    .controller
                    .jobs()
                    .into_iter()
                    .filter(|j| j.release_id == release_id && j.state == JobState::Up)
                    .count();
                if self.mock.jobs().len() == n && self.running(release_id) == n && up >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("jobs did not converge");
    }

    fn deployer(&self) -> Deployer {
        Deployer::new(
            self.controller.clone(),
            DeployerConfig {
                rollback_wait: Duration::from_secs(2),
            },
        )
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn release(controller: &MemoryController, app_id: AppId, uri: &str) -> ReleaseId {
    let artifact = controller.create_artifact(uri);
    let release = Release {
        id: ReleaseId::new(),
        app_id: Some(app_id),
        artifact_ids: vec![artifact.id],
        env: BTreeMap::new(),
        processes: BTreeMap::from([("web".to_string(), ProcessType::default())]),
        created_at: None,
    };
    controller.put_release(release.clone());
    release.id
}

/// `(release, state)` for each job transition the deployment recorded.
fn transitions(events: &[DeploymentEvent]) -> Vec<(ReleaseId, JobState)> {
    events
        .iter()
        .filter_map(|e| Some((e.release_id?, e.job_state?)))
        .collect()
}

#[tokio::test]
async fn test_one_by_one_alternates_new_up_and_old_down() {
    let cluster = Cluster::start(3).await;
    let new = cluster.new_release();
    let deployment = cluster
        .controller
        .create_deployment(cluster.app_id, new, DeploymentStrategy::OneByOne, 10, None)
        .unwrap();
    assert_eq!(deployment.old_release_id, Some(cluster.old));
    assert_eq!(deployment.processes, web(3));

    let status = timeout(WAIT, cluster.deployer().deploy(deployment.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, DeploymentStatus::Complete);

    let events = cluster.controller.deployment_events(deployment.id);
    let step = [(new, JobState::Up), (cluster.old, JobState::Down)];
    let expected: Vec<_> = step.iter().cycle().take(6).copied().collect();
    assert_eq!(transitions(&events), expected);

    assert_eq!(events.first().map(|e| e.status), Some(DeploymentStatus::Running));
    let last = events.last().unwrap();
    assert_eq!(last.status, DeploymentStatus::Complete);
    assert_eq!(last.release_id, Some(new));

    assert_eq!(cluster.controller.app(cluster.app_id).unwrap().release_id, Some(new));
    assert_eq!(
        cluster.controller.get_deployment(deployment.id).await.unwrap().status,
        DeploymentStatus::Complete
    );
    cluster.wait_for_jobs(new, 3).await;
}

#[tokio::test]
async fn test_all_at_once_starts_everything_before_stopping() {
    let cluster = Cluster::start(2).await;
    let new = cluster.new_release();
    let deployment = cluster
        .controller
        .create_deployment(cluster.app_id, new, DeploymentStrategy::AllAtOnce, 10, Some(web(3)))
        .unwrap();

    let status = timeout(WAIT, cluster.deployer().deploy(deployment.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, DeploymentStatus::Complete);

    let seen = transitions(&cluster.controller.deployment_events(deployment.id));
    let expected: Vec<_> = [(new, JobState::Up); 3]
        .into_iter()
        .chain([(cluster.old, JobState::Down); 2])
        .collect();
    assert_eq!(seen, expected);

    let old_formation = cluster
        .controller
        .formation(FormationKey::new(cluster.app_id, cluster.old))
        .unwrap();
    assert_eq!(old_formation.processes, web(0));
    cluster.wait_for_jobs(new, 3).await;
}

#[tokio::test]
async fn test_crashing_release_rolls_back() {
    let cluster = Cluster::start(3).await;
    let new = cluster.new_release();
    for host in ["h1", "h2"] {
        cluster.mock.host(host).unwrap().crash_release(new);
    }
    let deployment = cluster
        .controller
        .create_deployment(cluster.app_id, new, DeploymentStrategy::OneByOne, 10, None)
        .unwrap();

    let status = timeout(WAIT, cluster.deployer().deploy(deployment.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, DeploymentStatus::Failed);

    let events = cluster.controller.deployment_events(deployment.id);
    assert!(transitions(&events).contains(&(new, JobState::Crashed)));
    let last = events.last().unwrap();
    assert_eq!(last.status, DeploymentStatus::Failed);
    assert!(last.error.as_deref().unwrap_or("").contains("crashed"), "{last:?}");

    assert_eq!(
        cluster.controller.app(cluster.app_id).unwrap().release_id,
        Some(cluster.old)
    );
    assert!(cluster
        .controller
        .formation(FormationKey::new(cluster.app_id, new))
        .is_none());
    assert_eq!(
        cluster
            .controller
            .formation(FormationKey::new(cluster.app_id, cluster.old))
            .unwrap()
            .processes,
        web(3)
    );
    cluster.wait_for_jobs(cluster.old, 3).await;
}

#[tokio::test]
async fn test_step_timeout_rolls_back() {
    let cluster = Cluster::start(2).await;
    let new = cluster.new_release();
    for host in ["h1", "h2"] {
        cluster.mock.host(host).unwrap().fail_adds(u32::MAX);
    }
    let deployment = cluster
        .controller
        .create_deployment(cluster.app_id, new, DeploymentStrategy::OneByOne, 1, None)
        .unwrap();

    let status = timeout(WAIT, cluster.deployer().deploy(deployment.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, DeploymentStatus::Failed);

    let last = cluster
        .controller
        .deployment_events(deployment.id)
        .pop()
        .unwrap();
    assert!(last.error.as_deref().unwrap_or("").contains("timed out"), "{last:?}");
    assert!(cluster
        .controller
        .formation(FormationKey::new(cluster.app_id, new))
        .is_none());
    // The old jobs were never touched.
    assert_eq!(cluster.running(cluster.old), 2);
}

#[tokio::test]
async fn test_finished_deployment_is_not_rerun() {
    let cluster = Cluster::start(1).await;
    let new = cluster.new_release();
    let deployment = cluster
        .controller
        .create_deployment(cluster.app_id, new, DeploymentStrategy::AllAtOnce, 10, None)
        .unwrap();
    let deployer = cluster.deployer();

    assert_eq!(
        deployer.deploy(deployment.id).await.unwrap(),
        DeploymentStatus::Complete
    );
    let recorded = cluster.controller.deployment_events(deployment.id).len();

    assert_eq!(
        deployer.deploy(deployment.id).await.unwrap(),
        DeploymentStatus::Complete
    );
    assert_eq!(cluster.controller.deployment_events(deployment.id).len(), recorded);
}

#[tokio::test]
async fn test_empty_deployment_fails_without_touching_formations() {
    let cluster = Cluster::start(1).await;
    let new = cluster.new_release();
    let deployment = cluster
        .controller
        .create_deployment(cluster.app_id, new, DeploymentStrategy::OneByOne, 10, Some(web(0)))
        .unwrap();

    let status = cluster.deployer().deploy(deployment.id).await.unwrap();
    assert_eq!(status, DeploymentStatus::Failed);
    assert!(cluster
        .controller
        .formation(FormationKey::new(cluster.app_id, new))
        .is_none());
    assert_eq!(cluster.running(cluster.old), 1);
}
