//! Discovery over HTTP, for processes that talk to a remote agent.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use tug_events::ndjson;

use crate::discovery::{validate_addr, validate_service};
use crate::{Attrs, Discovery, DiscoveryError, SubscribeEvent, Subscription};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RegisterRequest {
    #[serde(default)]
    pub attrs: Attrs,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RegisterResponse {
    pub addr: String,
}

/// Client for an agent's HTTP surface.
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    client: reqwest::Client,
    streaming: reqwest::Client,
    base_url: String,
    heartbeat: Duration,
}

impl HttpDiscovery {
    pub fn new(base_url: impl Into<String>) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DiscoveryError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        let streaming = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DiscoveryError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            streaming,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            heartbeat: crate::discovery::DEFAULT_HEARTBEAT,
        })
    }

    /// Sets the interval used by heartbeaters built on this client.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    fn instance_url(&self, service: &str, addr: &str) -> String {
        format!("{}/services/{service}/instances/{addr}", self.base_url)
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.client.request(method, url)
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        service: &str,
        addr: &str,
    ) -> Result<Response, DiscoveryError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => DiscoveryError::NotRegistered {
                service: service.to_string(),
                addr: addr.to_string(),
            },
            StatusCode::BAD_REQUEST => DiscoveryError::InvalidName {
                what: "request",
                value: body,
            },
            s if s.is_server_error() => DiscoveryError::Unavailable(format!("{s}: {body}")),
            s => DiscoveryError::Protocol(format!("{s}: {body}")),
        })
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn register(
        &self,
        service: &str,
        addr: &str,
        attrs: &Attrs,
    ) -> Result<String, DiscoveryError> {
        validate_service(service)?;
        validate_addr(addr)?;
        debug!(service, addr, "Registering");
        let body = RegisterRequest {
            attrs: attrs.clone(),
        };
        let response = self
            .send(
                self.request(Method::PUT, self.instance_url(service, addr)).json(&body),
                service,
                addr,
            )
            .await?;
        let registered: RegisterResponse = response.json().await?;
        Ok(registered.addr)
    }

    async fn unregister(&self, service: &str, addr: &str) -> Result<(), DiscoveryError> {
        validate_service(service)?;
        validate_addr(addr)?;
        self.send(
            self.request(Method::DELETE, self.instance_url(service, addr)),
            service,
            addr,
        )
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, service: &str, addr: &str) -> Result<(), DiscoveryError> {
        validate_service(service)?;
        validate_addr(addr)?;
        let url = format!("{}/heartbeat", self.instance_url(service, addr));
        self.send(self.request(Method::POST, url), service, addr).await?;
        Ok(())
    }

    async fn subscribe(&self, service: &str) -> Result<Subscription, DiscoveryError> {
        validate_service(service)?;
        let builder = self
            .streaming
            .get(format!("{}/services/{service}", self.base_url))
            .header(reqwest::header::ACCEPT, ndjson::CONTENT_TYPE);
        let response = self.send(builder, service, "").await?;
        Ok(ndjson::decode::<SubscribeEvent, _, _>(response.bytes_stream())
            .map(|item| item.map_err(DiscoveryError::from))
            .boxed())
    }

    fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
    }
}
