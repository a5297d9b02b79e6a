//! HTTP surface of the discovery agent.
//!
//! - `PUT    /services/{service}/instances/{addr}` registers (body `{attrs}`)
//! - `DELETE /services/{service}/instances/{addr}` unregisters
//! - `POST   /services/{service}/instances/{addr}/heartbeat`
//! - `GET    /services/{service}` streams subscription events as NDJSON
//! - `GET    /ping`

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream::unfold;
use futures_util::StreamExt;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};
use tug_events::ndjson;

use crate::client::{RegisterRequest, RegisterResponse};
use crate::{Agent, Discovery, DiscoveryError};

pub type AgentState = Arc<Agent>;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorBody {
    pub code: String,
    pub detail: String,
    pub retryable: bool,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, detail: impl Into<String>, retryable: bool) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                detail: detail.into(),
                retryable,
            },
        }
    }
}

impl From<DiscoveryError> for ApiError {
    fn from(err: DiscoveryError) -> Self {
        match &err {
            DiscoveryError::NotRegistered { .. } => {
                Self::new(StatusCode::NOT_FOUND, "not_registered", err.to_string(), false)
            }
            DiscoveryError::InvalidName { .. } | DiscoveryError::MissingExternalIp(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_request", err.to_string(), false)
            }
            _ => {
                error!(error = %err, "Discovery request failed");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store_unavailable",
                    err.to_string(),
                    true,
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn create_router(agent: AgentState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/services/{service}", get(subscribe))
        .route(
            "/services/{service}/instances/{addr}",
            put(register).delete(unregister),
        )
        .route(
            "/services/{service}/instances/{addr}/heartbeat",
            post(heartbeat),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

async fn ping() -> &'static str {
    "ok"
}

async fn register(
    State(agent): State<AgentState>,
    Path((service, addr)): Path<(String, String)>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let addr = agent.register(&service, &addr, &body.attrs).await?;
    Ok(Json(RegisterResponse { addr }))
}

async fn unregister(
    State(agent): State<AgentState>,
    Path((service, addr)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    agent.unregister(&service, &addr).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn heartbeat(
    State(agent): State<AgentState>,
    Path((service, addr)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    agent.heartbeat(&service, &addr).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn subscribe(
    State(agent): State<AgentState>,
    Path(service): Path<String>,
) -> Result<Response, ApiError> {
    let subscription = agent.subscribe(&service).await?;
    debug!(service = %service, "Subscriber connected");

    let stream = unfold(subscription, move |mut subscription| async move {
        loop {
            match subscription.next().await? {
                Ok(event) => match ndjson::encode(&event) {
                    Ok(line) => return Some((Ok::<Bytes, Infallible>(line), subscription)),
                    Err(e) => error!(error = %e, "Failed to serialize subscription event"),
                },
                Err(e) => {
                    // Ending the body makes the client resubscribe.
                    warn!(error = %e, "Subscription failed");
                    return None;
                }
            }
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(ndjson::CONTENT_TYPE));
    Ok(response)
}
