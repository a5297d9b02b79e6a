use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tug_controller::{ControllerClient, MemoryController};
use tug_deployer::http::{self, AppState, CreateDeploymentResponse};
use tug_deployer::{DeploymentArgs, JobSink, DEPLOYMENT_JOB};
use tug_events::{DeploymentEvent, DeploymentStrategy, ProcessType, Processes, Release};
use tug_id::{DeploymentId, QueueJobId, ReleaseId};
use tug_queue::{NewJob, QueueError};

/// Keeps enqueued jobs in memory.
#[derive(Default)]
struct RecordingSink {
    jobs: Mutex<Vec<NewJob>>,
}

#[async_trait]
impl JobSink for RecordingSink {
    async fn enqueue(&self, job: &NewJob) -> Result<QueueJobId, QueueError> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.push(job.clone());
        Ok(QueueJobId::new(jobs.len() as i64))
    }
}

async fn serve() -> (Arc<MemoryController>, Arc<RecordingSink>, String) {
    let controller = Arc::new(MemoryController::new());
    let sink = Arc::new(RecordingSink::default());
    let app = http::create_router(AppState {
        controller: controller.clone(),
        queue: sink.clone(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    (controller, sink, format!("http://{addr}"))
}

fn deployment(controller: &MemoryController) -> DeploymentId {
    let app = controller.create_app("web");
    let release = Release {
        id: ReleaseId::new(),
        app_id: Some(app.id),
        artifact_ids: vec![],
        env: BTreeMap::new(),
        processes: BTreeMap::from([("web".to_string(), ProcessType::default())]),
        created_at: None,
    };
    controller.put_release(release.clone());
    controller
        .create_deployment(
            app.id,
            release.id,
            DeploymentStrategy::OneByOne,
            30,
            Some(Processes::from([("web".to_string(), 1)])),
        )
        .unwrap()
        .id
}

#[tokio::test]
async fn test_post_enqueues_deployment_job() {
    let (controller, sink, base) = serve().await;
    let id = deployment(&controller);

    let response = reqwest::Client::new()
        .post(format!("{base}/deployments"))
        .json(&json!({ "deployment_id": id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: CreateDeploymentResponse = response.json().await.unwrap();
    assert_eq!(body.deployment_id, id);
    assert_eq!(body.job_id, QueueJobId::new(1));

    let jobs = sink.jobs.lock().unwrap().clone();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type, DEPLOYMENT_JOB);
    let args: DeploymentArgs = serde_json::from_value(jobs[0].args.clone()).unwrap();
    assert_eq!(args.deployment_id, id);
}

#[tokio::test]
async fn test_unknown_deployment_is_404() {
    let (_controller, sink, base) = serve().await;

    let response = reqwest::Client::new()
        .post(format!("{base}/deployments"))
        .json(&json!({ "deployment_id": DeploymentId::new() }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "not_found");
    assert!(sink.jobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_finished_deployment_is_409() {
    let (controller, sink, base) = serve().await;
    let id = deployment(&controller);
    controller
        .create_deployment_event(&DeploymentEvent::failed(id, "superseded"))
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .post(format!("{base}/deployments"))
        .json(&json!({ "deployment_id": id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(sink.jobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_healthz() {
    let (_controller, _sink, base) = serve().await;
    let response = reqwest::get(format!("{base}/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "deployer");
}
