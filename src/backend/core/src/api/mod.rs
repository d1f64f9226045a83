//! HTTP API for job submission, status lookup and service health.
//!
//! Unversioned endpoints:
//! - `GET /` service banner
//! - `GET /health`, `/health/live`, `/health/ready`
//! - `GET /metrics` Prometheus text exposition
//!
//! Versioned endpoints live under `/api/v1/` (see [`v1::v1_router`]).
//!
//! Every JSON body uses the `{success, data, error, error_code}` envelope.

mod handlers;
pub mod middleware;
pub mod v1;

pub use handlers::{InfoResponse, SubmitJobRequest, SubmitJobResponse, TaskInfo};

use axum::{extract::FromRef, middleware as axum_middleware, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::health::{self, SharedHealthService, WorkerHealthChecker};
use crate::jobs::JobEngine;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: JobEngine,
    pub health: SharedHealthService,
    pub workers: Arc<WorkerHealthChecker>,
    pub environment: Arc<str>,
    /// Set when the Prometheus exporter is installed
    pub metrics: Option<PrometheusHandle>,
}

impl FromRef<AppState> for SharedHealthService {
    fn from_ref(state: &AppState) -> Self {
        state.health.clone()
    }
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest(v1::V1_PREFIX, v1::v1_router())
        .layer(axum_middleware::from_fn(middleware::api_version_headers))
        .layer(axum_middleware::from_fn(middleware::content_type_validation))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_code: None,
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_code: Some(code.into()),
        }
    }

    pub fn from_error(err: &crate::error::VisionaryError) -> Self {
        Self::error_with_code(err.user_message(), err.code().to_string())
    }
}
