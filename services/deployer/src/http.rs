//! HTTP surface of the deployer.
//!
//! - `POST /deployments` enqueues a deployment (body `{deployment_id}`)
//! - `GET  /healthz`

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tug_controller::{ControllerClient, ControllerError};
use tug_id::{DeploymentId, QueueJobId};
use tug_queue::QueueError;

use crate::handler::{DeploymentArgs, JobSink};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<dyn ControllerClient>,
    pub queue: Arc<dyn JobSink>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
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

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        if err.is_not_found() {
            return Self::new(StatusCode::NOT_FOUND, "not_found", err.to_string(), false);
        }
        error!(error = %err, "Controller request failed");
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "controller_unavailable",
            err.to_string(),
            err.is_transient(),
        )
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        error!(error = %err, "Failed to enqueue deployment");
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "queue_unavailable",
            err.to_string(),
            err.is_transient(),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateDeploymentRequest {
    pub deployment_id: DeploymentId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateDeploymentResponse {
    pub deployment_id: DeploymentId,
    pub job_id: QueueJobId,
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    /// RFC 3339.
    pub timestamp: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/deployments", post(create_deployment))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "deployer".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Enqueues a deployment the controller already knows about.
async fn create_deployment(
    State(state): State<AppState>,
    Json(body): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<CreateDeploymentResponse>), ApiError> {
    let deployment = state.controller.get_deployment(body.deployment_id).await?;
    if deployment.status.is_terminal() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "deployment_finished",
            format!("deployment {} is already {:?}", deployment.id, deployment.status),
            false,
        ));
    }

    let job = DeploymentArgs {
        deployment_id: deployment.id,
    }
    .job()
    .map_err(|e| {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string(), false)
    })?;
    let job_id = state.queue.enqueue(&job).await?;
    info!(deployment_id = %deployment.id, job_id = %job_id, "Deployment enqueued");

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateDeploymentResponse {
            deployment_id: deployment.id,
            job_id,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let err = ApiError::from(ControllerError::not_found("deployment", "d1"));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert!(!err.body.retryable);
    }

    #[test]
    fn test_unavailable_is_retryable() {
        let err = ApiError::from(ControllerError::Unavailable("connection refused".into()));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.body.retryable);
    }
}
