//! HTTP implementation of the host job API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tracing::debug;
use tug_events::{ndjson, ActiveJob, EventError, HostEvent, JobSpec};
use tug_id::{HostId, JobId};

use super::{HostClient, HostError, HostEventStream, HostResult};

/// Talks to a host's job API at `http://<addr>/host`.
///
/// The client is built eagerly but connects on first request.
#[derive(Debug, Clone)]
pub struct HttpHostClient {
    host_id: HostId,
    client: reqwest::Client,
    streaming: reqwest::Client,
    base_url: String,
    auth_key: Option<String>,
}

impl HttpHostClient {
    pub fn new(host_id: HostId, addr: &str, auth_key: Option<String>) -> HostResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HostError::Protocol(format!("failed to build HTTP client: {e}")))?;
        let streaming = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| HostError::Protocol(format!("failed to build HTTP client: {e}")))?;

        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };

        Ok(Self {
            host_id,
            client,
            streaming,
            base_url,
            auth_key,
        })
    }

    fn request(&self, client: &reqwest::Client, method: Method, path: &str) -> RequestBuilder {
        let builder = client.request(method, format!("{}/host{}", self.base_url, path));
        match &self.auth_key {
            Some(key) => builder.basic_auth("", Some(key)),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, job_id: Option<JobId>) -> HostResult<Response> {
        let response = builder.send().await.map_err(|e| self.unreachable(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match (status, job_id) {
            (StatusCode::NOT_FOUND, Some(id)) => HostError::JobNotFound(id),
            (s, _) if s.is_server_error() => HostError::Unreachable {
                host_id: self.host_id.clone(),
                reason: format!("{s}: {body}"),
            },
            (s, _) if s.is_client_error() => HostError::Rejected(format!("{s}: {body}")),
            (s, _) => HostError::Protocol(format!("{s}: {body}")),
        })
    }

    fn unreachable(&self, err: reqwest::Error) -> HostError {
        if err.is_decode() {
            return HostError::Protocol(err.to_string());
        }
        HostError::Unreachable {
            host_id: self.host_id.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl HostClient for HttpHostClient {
    fn host_id(&self) -> &HostId {
        &self.host_id
    }

    async fn list_jobs(&self) -> HostResult<BTreeMap<JobId, ActiveJob>> {
        let response = self
            .send(self.request(&self.client, Method::GET, "/jobs"), None)
            .await?;
        response.json().await.map_err(|e| self.unreachable(e))
    }

    async fn get_job(&self, job_id: JobId) -> HostResult<ActiveJob> {
        let response = self
            .send(
                self.request(&self.client, Method::GET, &format!("/jobs/{job_id}")),
                Some(job_id),
            )
            .await?;
        response.json().await.map_err(|e| self.unreachable(e))
    }

    async fn stop_job(&self, job_id: JobId) -> HostResult<()> {
        debug!(host_id = %self.host_id, job_id = %job_id, "Stopping job");
        self.send(
            self.request(&self.client, Method::DELETE, &format!("/jobs/{job_id}")),
            Some(job_id),
        )
        .await?;
        Ok(())
    }

    async fn add_jobs(&self, jobs: Vec<JobSpec>) -> HostResult<()> {
        debug!(host_id = %self.host_id, count = jobs.len(), "Adding jobs");
        self.send(
            self.request(&self.client, Method::POST, "/jobs").json(&jobs),
            None,
        )
        .await?;
        Ok(())
    }

    async fn stream_events(&self, since: Option<u64>) -> HostResult<HostEventStream> {
        let path = match since {
            Some(since) => format!("/events?since={since}"),
            None => "/events".to_string(),
        };
        let builder = self
            .request(&self.streaming, Method::GET, &path)
            .header(reqwest::header::ACCEPT, ndjson::CONTENT_TYPE);
        let response = self.send(builder, None).await?;
        let host_id = self.host_id.clone();
        Ok(ndjson::decode::<HostEvent, _, _>(response.bytes_stream())
            .map(move |item| {
                item.map_err(|e| match e {
                    EventError::Stream(reason) => HostError::Unreachable {
                        host_id: host_id.clone(),
                        reason,
                    },
                    other => HostError::Protocol(other.to_string()),
                })
            })
            .boxed())
    }
}
