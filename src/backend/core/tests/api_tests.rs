//! Tests for the HTTP API.
//!
//! Tests cover:
//! - Job submission and status lookup
//! - Error envelopes for unknown types, bad ids and missing jobs
//! - Content-type enforcement and response headers
//! - Health, readiness and liveness
//! - Task catalogue and worker statistics

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use visionary_core::api::{build_router, ApiResponse, AppState};
use visionary_core::health::{
    BrokerHealthChecker, HealthService, ResultStoreHealthChecker, WorkerHealthChecker,
};
use visionary_core::jobs::{
    register_builtin_tasks, DurableQueue, InMemoryBroker, InMemoryResultStore, JobEngine, JobStatus,
    MemoryEventSink, QueueRouter, RoutingRule, TaskPolicy, TaskRegistryBuilder, WorkerStats,
};

// ============================================================================
// Harness
// ============================================================================

fn engine() -> (JobEngine, Arc<InMemoryBroker>) {
    let mut builder = TaskRegistryBuilder::new(TaskPolicy {
        queue: None,
        max_retries: 3,
        retry_delay: Duration::from_secs(60),
        soft_timeout: Duration::from_secs(300),
        hard_timeout: Duration::from_secs(600),
    });
    register_builtin_tasks(&mut builder).unwrap();

    let rules = vec![
        RoutingRule::new("tts.*", "tts"),
        RoutingRule::new("media.*", "media"),
    ];
    let broker = Arc::new(InMemoryBroker::new());
    let engine = JobEngine::new(
        builder.build(),
        QueueRouter::new(&rules, "default").unwrap(),
        broker.clone(),
        Arc::new(InMemoryResultStore::new()),
        Arc::new(MemoryEventSink::new()),
        Duration::from_secs(3600),
    );
    (engine, broker)
}

fn app_with(engine: JobEngine, pools: Vec<(String, WorkerStats)>) -> Router {
    let workers = Arc::new(WorkerHealthChecker::new(pools));
    let mut health = HealthService::new("test");
    health.register_checker(Arc::new(BrokerHealthChecker::new(
        engine.broker().clone(),
        engine.queues(),
    )));
    health.register_checker(Arc::new(ResultStoreHealthChecker::new(engine.results().clone())));
    health.register_checker(workers.clone());

    build_router(AppState {
        engine,
        health: Arc::new(health),
        workers,
        environment: Arc::from("test"),
        metrics: None,
    })
}

fn app() -> (Router, JobEngine, Arc<InMemoryBroker>) {
    let (engine, broker) = engine();
    (app_with(engine.clone(), Vec::new()), engine, broker)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ============================================================================
// Job Endpoint Tests
// ============================================================================

#[tokio::test]
async fn test_submit_job_returns_accepted_with_queue() {
    let (app, _engine, broker) = app();

    let response = app
        .oneshot(post_json(
            "/api/v1/jobs",
            json!({"type_name": "tts.generate", "payload": {"text": "hello"}}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["queue"], "tts");
    assert!(body["data"]["job_id"].is_string());
    assert_eq!(broker.depth("tts").await.unwrap(), 1);
}

#[tokio::test]
async fn test_submitted_job_is_pending() {
    let (app, _engine, _broker) = app();

    let response = app
        .clone()
        .oneshot(post_json("/api/v1/jobs", json!({"type_name": "system.health_check"})))
        .await
        .unwrap();
    let body = body_json(response).await;
    let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(get(&format!("/api/v1/jobs/{}", job_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], json!(JobStatus::Pending));
    assert_eq!(body["data"]["type_name"], "system.health_check");
    assert_eq!(body["data"]["attempts"], 0);
}

#[tokio::test]
async fn test_submit_unknown_type_is_not_found() {
    let (app, _engine, broker) = app();

    let response = app
        .oneshot(post_json("/api/v1/jobs", json!({"type_name": "tts.nonexistent"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error_code"], "UNKNOWN_TASK_TYPE");
    assert_eq!(broker.depth("tts").await.unwrap(), 0);
}

#[tokio::test]
async fn test_submit_empty_type_name_is_rejected() {
    let (app, _engine, _broker) = app();

    let response = app
        .oneshot(post_json("/api/v1/jobs", json!({"type_name": "  "})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_get_unknown_job_is_not_found() {
    let (app, _engine, _broker) = app();

    let response = app
        .oneshot(get(&format!("/api/v1/jobs/{}", uuid::Uuid::new_v4())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "JOB_NOT_FOUND");
}

#[tokio::test]
async fn test_get_job_with_malformed_id() {
    let (app, _engine, _broker) = app();

    let response = app.oneshot(get("/api/v1/jobs/not-a-uuid")).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "INVALID_INPUT");
}

// ============================================================================
// Middleware Tests
// ============================================================================

#[tokio::test]
async fn test_post_without_content_type_is_rejected() {
    let (app, _engine, _broker) = app();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/jobs")
        .body(Body::from(r#"{"type_name":"tts.generate"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "MISSING_CONTENT_TYPE");
}

#[tokio::test]
async fn test_responses_carry_request_id() {
    let (app, _engine, _broker) = app();

    let request = Request::builder()
        .uri("/health/live")
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.headers()["x-request-id"], "req-123");
    assert_eq!(response.headers()["x-api-version"], "1.0");
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
}

// ============================================================================
// Health Tests
// ============================================================================

#[tokio::test]
async fn test_health_reports_components() {
    let (app, _engine, _broker) = app();

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    let names: Vec<&str> = body["components"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert!(names.contains(&"broker"));
    assert!(names.contains(&"result_store"));
    assert!(names.contains(&"workers"));
}

#[tokio::test]
async fn test_degraded_workers_do_not_fail_readiness() {
    let (engine, _broker) = engine();
    let stats = WorkerStats::default();
    stats.degraded.store(true, std::sync::atomic::Ordering::Relaxed);
    let app = app_with(engine, vec![("default".to_string(), stats)]);

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "degraded");

    let response = app.oneshot(get("/health/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_liveness() {
    let (app, _engine, _broker) = app();

    let response = app.oneshot(get("/health/live")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["alive"], true);
}

// ============================================================================
// Catalogue and Info Tests
// ============================================================================

#[tokio::test]
async fn test_list_tasks_includes_builtins_with_queues() {
    let (app, _engine, _broker) = app();

    let response = app.oneshot(get("/api/v1/tasks")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let tasks = body["data"].as_array().unwrap();
    let tts = tasks
        .iter()
        .find(|t| t["type_name"] == "tts.generate")
        .unwrap();
    assert_eq!(tts["queue"], "tts");
    assert_eq!(tts["max_retries"], 3);
    let health = tasks
        .iter()
        .find(|t| t["type_name"] == "system.health_check")
        .unwrap();
    assert_eq!(health["queue"], "default");
}

#[tokio::test]
async fn test_info_and_services() {
    let (app, _engine, _broker) = app();

    let response = app.clone().oneshot(get("/api/v1/info")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["environment"], "test");
    assert_eq!(body["data"]["version"], env!("CARGO_PKG_VERSION"));

    let response = app.oneshot(get("/api/v1/services")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["services"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_workers_endpoint() {
    let (engine, _broker) = engine();
    let app = app_with(engine, vec![("default".to_string(), WorkerStats::default())]);

    let response = app.oneshot(get("/api/v1/workers")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["metadata"]["default"]["processed"], 0);
}

#[tokio::test]
async fn test_metrics_disabled_returns_error() {
    let (app, _engine, _broker) = app();

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert!(!response.status().is_success());
}

// ============================================================================
// Envelope Tests
// ============================================================================

#[test]
fn test_api_response_error_serialization_omits_data() {
    let response = ApiResponse::<()>::error_with_code("nope", "JOB_NOT_FOUND");
    let value = serde_json::to_value(&response).unwrap();

    assert_eq!(value["success"], false);
    assert!(value.get("data").is_none());
    assert_eq!(value["error_code"], "JOB_NOT_FOUND");
}
