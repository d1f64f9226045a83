//! V1 API routes.

use axum::{
    routing::{get, post},
    Router,
};

use crate::api::{handlers, AppState};

/// V1 API prefix.
pub const V1_PREFIX: &str = "/api/v1";

/// Build the V1 API router.
///
/// # Endpoints
///
/// ## Service
/// - `GET /api/v1/info` - Name, version and environment
/// - `GET /api/v1/services` - Broker and result store connectivity
/// - `GET /api/v1/workers` - Worker pool statistics
///
/// ## Tasks
/// - `GET /api/v1/tasks` - Registered task types with queue and policy
///
/// ## Jobs
/// - `POST /api/v1/jobs` - Submit a job, 202 with its id
/// - `GET /api/v1/jobs/:job_id` - Current job result
pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/info", get(handlers::info))
        .route("/services", get(handlers::services))
        .route("/workers", get(handlers::workers))
        .route("/tasks", get(handlers::list_tasks))
        .route("/jobs", post(handlers::submit_job))
        .route("/jobs/:job_id", get(handlers::get_job))
}
