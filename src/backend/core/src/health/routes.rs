//! Health check HTTP handlers.

use super::{HealthService, LivenessResponse, ReadinessResponse};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

/// Shared health service state
pub type SharedHealthService = Arc<HealthService>;

/// GET /health
pub async fn health_check(State(service): State<SharedHealthService>) -> impl IntoResponse {
    let report = service.check_health().await;
    let status = StatusCode::from_u16(report.status.to_http_status()).unwrap_or(StatusCode::OK);
    (status, Json(report))
}

/// GET /health/ready
pub async fn readiness_check(State(service): State<SharedHealthService>) -> impl IntoResponse {
    let report = service.check_health().await;
    let response = ReadinessResponse::from_health_report(&report);
    let status = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// GET /health/live
pub async fn liveness_check() -> impl IntoResponse {
    (StatusCode::OK, Json(LivenessResponse::alive()))
}
