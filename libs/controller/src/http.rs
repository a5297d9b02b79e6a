//! HTTP implementation of the controller client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};
use tug_events::{
    ndjson, App, Artifact, Deployment, DeploymentEvent, ExpandedFormation, Formation,
    FormationUpdate, JobRecord, Release, ScaleRequest,
};
use tug_id::{AppId, ArtifactId, DeploymentId, ReleaseId};

use crate::{ControllerClient, ControllerError, ControllerResult, ControllerStream};

/// Talks to the controller's JSON API.
///
/// Requests authenticate with HTTP basic auth using an empty user and the
/// controller key as the password.
#[derive(Debug, Clone)]
pub struct HttpControllerClient {
    client: reqwest::Client,
    streaming: reqwest::Client,
    base_url: String,
    key: Option<String>,
}

impl HttpControllerClient {
    pub fn new(base_url: impl Into<String>, key: Option<String>) -> ControllerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ControllerError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        // Streams stay open indefinitely, so only bound the connect.
        let streaming = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ControllerError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            streaming,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key,
        })
    }

    fn request(&self, client: &reqwest::Client, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = client.request(method, url);
        match &self.key {
            Some(key) => builder.basic_auth("", Some(key)),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        kind: &'static str,
        id: &str,
    ) -> ControllerResult<Response> {
        let response = builder.send().await?;
        check(response, kind, id).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        kind: &'static str,
        id: &str,
    ) -> ControllerResult<T> {
        debug!(path, "GET");
        let response = self
            .send(self.request(&self.client, Method::GET, path), kind, id)
            .await?;
        Ok(response.json().await?)
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        kind: &'static str,
        id: &str,
    ) -> ControllerResult<Response> {
        debug!(path, method = %method, "Sending");
        self.send(self.request(&self.client, method, path).json(body), kind, id)
            .await
    }

    async fn stream<T: DeserializeOwned + Send + 'static>(
        &self,
        path: &str,
        kind: &'static str,
        id: &str,
    ) -> ControllerResult<ControllerStream<T>> {
        let builder = self
            .request(&self.streaming, Method::GET, path)
            .header(reqwest::header::ACCEPT, ndjson::CONTENT_TYPE);
        let response = self.send(builder, kind, id).await?;
        Ok(ndjson::decode::<T, _, _>(response.bytes_stream())
            .map(|item| item.map_err(ControllerError::from))
            .boxed())
    }
}

async fn check(response: Response, kind: &'static str, id: &str) -> ControllerResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => ControllerError::not_found(kind, id),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
            ControllerError::Validation(body)
        }
        s if s.is_server_error() => {
            error!(status = %s, body = %body, kind, "Controller server error");
            ControllerError::Unavailable(format!("{s}: {body}"))
        }
        s => ControllerError::Protocol(format!("{s}: {body}")),
    })
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn stream_formations(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ControllerResult<ControllerStream<FormationUpdate>> {
        let path = match since {
            Some(since) => format!(
                "/formations?since={}",
                since.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
            ),
            None => "/formations".to_string(),
        };
        self.stream(&path, "formations", "").await
    }

    async fn get_app(&self, app_id: AppId) -> ControllerResult<App> {
        self.get_json(&format!("/apps/{app_id}"), "app", &app_id.to_string())
            .await
    }

    async fn get_formation(
        &self,
        app_id: AppId,
        release_id: ReleaseId,
    ) -> ControllerResult<Formation> {
        self.get_json(
            &format!("/apps/{app_id}/formations/{release_id}"),
            "formation",
            &format!("{app_id}/{release_id}"),
        )
        .await
    }

    async fn get_expanded_formation(
        &self,
        app_id: AppId,
        release_id: ReleaseId,
    ) -> ControllerResult<ExpandedFormation> {
        self.get_json(
            &format!("/apps/{app_id}/formations/{release_id}?expand=true"),
            "formation",
            &format!("{app_id}/{release_id}"),
        )
        .await
    }

    async fn get_release(&self, release_id: ReleaseId) -> ControllerResult<Release> {
        self.get_json(
            &format!("/releases/{release_id}"),
            "release",
            &release_id.to_string(),
        )
        .await
    }

    async fn get_artifact(&self, artifact_id: ArtifactId) -> ControllerResult<Artifact> {
        self.get_json(
            &format!("/artifacts/{artifact_id}"),
            "artifact",
            &artifact_id.to_string(),
        )
        .await
    }

    async fn put_formation(&self, formation: &Formation) -> ControllerResult<Formation> {
        let key = formation.key();
        let response = self
            .send_json(
                Method::PUT,
                &format!("/apps/{}/formations/{}", key.app_id, key.release_id),
                formation,
                "formation",
                &key.to_string(),
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn delete_formation(&self, app_id: AppId, release_id: ReleaseId) -> ControllerResult<()> {
        let path = format!("/apps/{app_id}/formations/{release_id}");
        self.send(
            self.request(&self.client, Method::DELETE, &path),
            "formation",
            &format!("{app_id}/{release_id}"),
        )
        .await?;
        Ok(())
    }

    async fn set_app_release(&self, app_id: AppId, release_id: ReleaseId) -> ControllerResult<()> {
        self.send_json(
            Method::PUT,
            &format!("/apps/{app_id}/release"),
            &serde_json::json!({ "id": release_id }),
            "app",
            &app_id.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn add_scale_request(&self, request: &ScaleRequest) -> ControllerResult<ScaleRequest> {
        let response = self
            .send_json(
                Method::POST,
                &format!("/apps/{}/scale/{}", request.app_id, request.release_id),
                request,
                "formation",
                &request.key().to_string(),
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn update_scale_request(&self, request: &ScaleRequest) -> ControllerResult<()> {
        self.send_json(
            Method::PUT,
            &format!("/scale_requests/{}", request.id),
            request,
            "scale request",
            &request.id.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn get_deployment(&self, deployment_id: DeploymentId) -> ControllerResult<Deployment> {
        self.get_json(
            &format!("/deployments/{deployment_id}"),
            "deployment",
            &deployment_id.to_string(),
        )
        .await
    }

    async fn create_deployment_event(&self, event: &DeploymentEvent) -> ControllerResult<()> {
        self.send_json(
            Method::POST,
            &format!("/deployments/{}/events", event.deployment_id),
            event,
            "deployment",
            &event.deployment_id.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn put_job(&self, job: &JobRecord) -> ControllerResult<()> {
        self.send_json(
            Method::PUT,
            &format!("/apps/{}/jobs/{}", job.app_id, job.job_id),
            job,
            "app",
            &job.app_id.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn list_jobs(&self, app_id: AppId) -> ControllerResult<Vec<JobRecord>> {
        self.get_json(&format!("/apps/{app_id}/jobs"), "app", &app_id.to_string())
            .await
    }

    async fn stream_job_events(
        &self,
        app_id: AppId,
    ) -> ControllerResult<ControllerStream<JobRecord>> {
        self.stream(
            &format!("/apps/{app_id}/jobs/events"),
            "app",
            &app_id.to_string(),
        )
        .await
    }
}
