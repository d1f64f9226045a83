//! API request handlers.
//!
//! Handlers return `Result<impl IntoResponse, VisionaryError>`; errors become
//! the JSON error envelope with the status code of their [`ErrorCode`].
//!
//! [`ErrorCode`]: crate::error::ErrorCode

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::{ApiResponse, AppState};
use crate::error::{ErrorCode, VisionaryError};
use crate::health::{ComponentHealth, HealthChecker, HealthStatus};
use crate::jobs::{JobId, JobResult};

// ═══════════════════════════════════════════════════════════════════════════════
// Service Info
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Visionary Workers API",
        "status": "running",
        "environment": &*state.environment,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InfoResponse {
    pub name: String,
    pub version: String,
    pub environment: String,
    pub description: String,
}

pub async fn info(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(InfoResponse {
        name: "Visionary Workers".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.environment.to_string(),
        description: "Background job processing for speech, media and knowledge tasks".to_string(),
    }))
}

/// Connectivity of the broker and the result store.
pub async fn services(State(state): State<AppState>) -> impl IntoResponse {
    let broker = {
        let start = Instant::now();
        let result = state.engine.broker().ping().await;
        ComponentHealth::from_result("broker", result, start.elapsed())
            .with_metadata("backend", state.engine.broker().name())
    };
    let results = {
        let start = Instant::now();
        let result = state.engine.results().ping().await;
        ComponentHealth::from_result("result_store", result, start.elapsed())
            .with_metadata("backend", state.engine.results().name())
    };

    let status = broker.status.combine(results.status);
    Json(ApiResponse::success(serde_json::json!({
        "status": status,
        "services": [broker, results],
    })))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tasks
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskInfo {
    pub type_name: String,
    pub queue: String,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub soft_timeout_secs: u64,
    pub hard_timeout_secs: u64,
}

pub async fn list_tasks(State(state): State<AppState>) -> Result<impl IntoResponse, VisionaryError> {
    let registry = state.engine.registry();
    let tasks = registry
        .type_names()
        .into_iter()
        .map(|name| -> Result<TaskInfo, VisionaryError> {
            let task = registry.resolve(name)?;
            Ok(TaskInfo {
                type_name: name.to_string(),
                queue: state.engine.route(name)?.to_string(),
                max_retries: task.policy.max_retries,
                retry_delay_secs: task.policy.retry_delay.as_secs(),
                soft_timeout_secs: task.policy.soft_timeout.as_secs(),
                hard_timeout_secs: task.policy.hard_timeout.as_secs(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(ApiResponse::success(tasks)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub type_name: String,
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub queue: String,
}

pub async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, VisionaryError> {
    if req.type_name.trim().is_empty() {
        return Err(VisionaryError::validation("type_name cannot be empty"));
    }

    let job_id = state.engine.submit(&req.type_name, req.payload).await?;
    let queue = state.engine.route(&req.type_name)?.to_string();

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(SubmitJobResponse { job_id, queue })),
    ))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, VisionaryError> {
    let job_id: JobId = job_id.parse()?;
    let result: JobResult = state.engine.get_status(job_id).await?;
    Ok(Json(ApiResponse::success(result)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

/// Worker pool statistics as seen by this process.
pub async fn workers(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.workers.check().await;
    let status = if health.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(ApiResponse::success(health)))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> Result<impl IntoResponse, VisionaryError> {
    let handle = state
        .metrics
        .as_ref()
        .ok_or_else(|| VisionaryError::new(ErrorCode::ConfigurationError, "Metrics exporter is disabled"))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    ))
}
