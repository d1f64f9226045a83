//! Integration tests for worker pools over the in-memory backends.
//!
//! Tests cover:
//! - Submission through execution to a completed result
//! - Fixed-delay retries up to the policy limit
//! - Terminal failure events
//! - Soft and hard time limits
//! - Unknown task types and duplicate deliveries
//! - Redelivery of jobs held by consumers that went away
//! - Result store outages
//! - Shutdown and statistics

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use visionary_core::error::{Result as VisionaryResult, VisionaryError};
use visionary_core::jobs::{
    DurableQueue, InMemoryBroker, InMemoryResultStore, Job, JobEngine, JobError, JobId, JobResult,
    JobStatus, MemoryEventSink, QueueRouter, ResultStore, Severity, TaskContext, TaskPolicy,
    TaskRegistryBuilder, WorkerConfig, WorkerHandle, WorkerPool,
};

const FLAKY: &str = "test.flaky";
const ALWAYS_FAILS: &str = "test.always_fails";
const FATAL: &str = "test.fatal";
const ECHO: &str = "test.echo";
const STUBBORN: &str = "test.stubborn";
const COOPERATIVE: &str = "test.cooperative";
const SLOW_RETRY: &str = "test.slow_retry";

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    engine: JobEngine,
    broker: Arc<InMemoryBroker>,
    results: Arc<dyn ResultStore>,
    events: Arc<MemoryEventSink>,
    flaky_calls: Arc<AtomicU32>,
    failing_calls: Arc<AtomicU32>,
    echo_calls: Arc<AtomicU32>,
}

fn policy() -> TaskPolicy {
    TaskPolicy {
        queue: None,
        max_retries: 3,
        retry_delay: Duration::from_millis(20),
        soft_timeout: Duration::from_secs(2),
        hard_timeout: Duration::from_secs(4),
    }
}

/// Result store that can be switched off.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryResultStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> VisionaryResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(VisionaryError::result_store_unavailable("store switched off"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ResultStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn put(&self, job_id: JobId, result: JobResult, ttl: Duration) -> VisionaryResult<()> {
        self.check()?;
        self.inner.put(job_id, result, ttl).await
    }

    async fn get(&self, job_id: JobId) -> VisionaryResult<Option<JobResult>> {
        self.check()?;
        self.inner.get(job_id).await
    }

    async fn delete(&self, job_id: JobId) -> VisionaryResult<()> {
        self.check()?;
        self.inner.delete(job_id).await
    }

    async fn ping(&self) -> VisionaryResult<()> {
        self.check()
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(InMemoryResultStore::new()))
}

fn harness_with(results: Arc<dyn ResultStore>) -> Harness {
    let flaky_calls = Arc::new(AtomicU32::new(0));
    let failing_calls = Arc::new(AtomicU32::new(0));
    let echo_calls = Arc::new(AtomicU32::new(0));

    let mut builder = TaskRegistryBuilder::new(policy());

    let calls = flaky_calls.clone();
    builder
        .register_default(FLAKY, move |ctx: TaskContext, _payload: Value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let result: Result<Value, JobError> = if ctx.attempt() < 3 {
                    Err(JobError::retryable("upstream unavailable"))
                } else {
                    Ok(json!({"attempt": ctx.attempt()}))
                };
                result
            }
        })
        .unwrap();

    let calls = failing_calls.clone();
    builder
        .register_default(ALWAYS_FAILS, move |_ctx: TaskContext, _payload: Value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(JobError::retryable("always broken"))
            }
        })
        .unwrap();

    builder
        .register_default(FATAL, |_ctx: TaskContext, _payload: Value| async move {
            Err::<Value, _>(JobError::fatal("bad input"))
        })
        .unwrap();

    let calls = echo_calls.clone();
    builder
        .register_default(ECHO, move |_ctx: TaskContext, payload: Value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, JobError>(payload)
            }
        })
        .unwrap();

    builder
        .register(
            STUBBORN,
            |_ctx: TaskContext, _payload: Value| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, JobError>(json!("never"))
            },
            policy()
                .with_max_retries(0)
                .with_timeouts(Duration::from_millis(50), Duration::from_millis(100)),
        )
        .unwrap();

    builder
        .register(
            COOPERATIVE,
            |ctx: TaskContext, _payload: Value| async move {
                ctx.cancelled().await;
                Err::<Value, _>(JobError::retryable("stopped early"))
            },
            policy()
                .with_max_retries(0)
                .with_timeouts(Duration::from_millis(50), Duration::from_secs(5)),
        )
        .unwrap();

    builder
        .register(
            SLOW_RETRY,
            |_ctx: TaskContext, _payload: Value| async move {
                Err::<Value, _>(JobError::retryable("rate limited"))
            },
            policy().with_retry_delay(Duration::from_secs(30)),
        )
        .unwrap();

    let broker = Arc::new(InMemoryBroker::new());
    let events = Arc::new(MemoryEventSink::new());
    let router = QueueRouter::new(&[], "default").unwrap();

    let engine = JobEngine::new(
        builder.build(),
        router,
        broker.clone(),
        results.clone(),
        events.clone(),
        Duration::from_secs(60),
    );

    Harness {
        engine,
        broker,
        results,
        events,
        flaky_calls,
        failing_calls,
        echo_calls,
    }
}

fn worker_config(concurrency: usize) -> WorkerConfig {
    WorkerConfig {
        name: "test".to_string(),
        concurrency,
        node_name: "test-node".to_string(),
        consume_timeout: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(5),
        max_backoff: Duration::from_millis(200),
        ..WorkerConfig::default()
    }
}

fn start(h: &Harness, concurrency: usize) -> WorkerHandle {
    WorkerPool::new(h.engine.clone(), worker_config(concurrency))
        .start()
        .unwrap()
}

async fn wait_for_terminal(h: &Harness, job_id: JobId) -> JobResult {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let result = h.engine.get_status(job_id).await.unwrap();
        if result.status.is_terminal() {
            return result;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {}",
            job_id,
            result.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_status(h: &Harness, job_id: JobId, status: JobStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while h.engine.get_status(job_id).await.unwrap().status != status {
        assert!(tokio::time::Instant::now() < deadline, "job {} never reached {}", job_id, status);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until_drained(h: &Harness) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while h.broker.depth("default").await.unwrap() > 0 || h.broker.in_flight() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "broker never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Success and Retry Tests
// ============================================================================

#[tokio::test]
async fn test_submitted_job_completes() {
    let h = harness();
    let handle = start(&h, 2);

    let job_id = h.engine.submit(ECHO, json!({"text": "hello"})).await.unwrap();
    let result = wait_for_terminal(&h, job_id).await;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.return_value, Some(json!({"text": "hello"})));
    assert!(result.error_detail.is_none());
    assert!(h.events.events().is_empty());

    handle.stop().await;
}

#[tokio::test]
async fn test_completed_result_kept_for_result_ttl() {
    let h = harness();
    let handle = start(&h, 1);

    let job_id = h.engine.submit(ECHO, json!({"text": "hello"})).await.unwrap();
    let result = wait_for_terminal(&h, job_id).await;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.expires_at - result.updated_at, chrono::Duration::seconds(60));

    handle.stop().await;
}

#[tokio::test]
async fn test_success_on_third_attempt() {
    let h = harness();
    let handle = start(&h, 1);

    let job_id = h.engine.submit(FLAKY, json!({})).await.unwrap();
    let result = wait_for_terminal(&h, job_id).await;

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.return_value, Some(json!({"attempt": 3})));
    assert_eq!(h.flaky_calls.load(Ordering::SeqCst), 3);
    assert_eq!(handle.stats().retried(), 2);
    assert_eq!(handle.stats().succeeded(), 1);
    assert!(h.events.events().is_empty());

    handle.stop().await;
}

#[tokio::test]
async fn test_retries_exhausted_after_max_retries() {
    let h = harness();
    let handle = start(&h, 1);

    let job_id = h.engine.submit(ALWAYS_FAILS, json!({})).await.unwrap();
    let result = wait_for_terminal(&h, job_id).await;

    // One original execution plus three retries
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.attempts, 4);
    assert_eq!(h.failing_calls.load(Ordering::SeqCst), 4);
    assert_eq!(result.error_detail.as_deref(), Some("always broken"));

    wait_until_drained(&h).await;
    assert_eq!(h.failing_calls.load(Ordering::SeqCst), 4);
    assert_eq!(handle.stats().failed(), 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_terminal_failure_emits_one_event() {
    let h = harness();
    let handle = start(&h, 1);

    let job_id = h.engine.submit(ALWAYS_FAILS, json!({})).await.unwrap();
    wait_for_terminal(&h, job_id).await;

    let events = h.events.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.severity, Severity::Error);
    assert_eq!(event.message, format!("Task {} failed after all retries", job_id));
    assert_eq!(event.context["task_id"], json!(job_id.to_string()));
    assert_eq!(event.context["type_name"], json!(ALWAYS_FAILS));
    assert_eq!(event.context["retries"], json!(3));
    assert_eq!(event.context["error"], json!("always broken"));
    assert_eq!(event.context["error_code"], json!("TERMINAL_FAILURE"));
    assert_eq!(event.context["outcome"], json!("recoverable_failure"));

    handle.stop().await;
}

#[tokio::test]
async fn test_fatal_error_is_not_retried() {
    let h = harness();
    let handle = start(&h, 1);

    let job_id = h.engine.submit(FATAL, json!({})).await.unwrap();
    let result = wait_for_terminal(&h, job_id).await;

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.attempts, 1);
    assert_eq!(handle.stats().retried(), 0);

    let events = h.events.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].context["retries"], json!(0));
    assert_eq!(events[0].context["outcome"], json!("terminal_failure"));

    handle.stop().await;
}

// ============================================================================
// Time Limit Tests
// ============================================================================

#[tokio::test]
async fn test_hard_timeout_stops_handler() {
    let h = harness();
    let handle = start(&h, 1);

    let job_id = h.engine.submit(STUBBORN, json!({})).await.unwrap();
    let result = wait_for_terminal(&h, job_id).await;

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error_detail.as_deref(), Some("hard time limit exceeded"));
    assert_eq!(handle.stats().timed_out(), 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_soft_timeout_after_cooperative_stop() {
    let h = harness();
    let handle = start(&h, 1);

    let job_id = h.engine.submit(COOPERATIVE, json!({})).await.unwrap();
    let result = wait_for_terminal(&h, job_id).await;

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error_detail.as_deref(), Some("soft time limit exceeded"));
    assert_eq!(handle.stats().timed_out(), 1);

    handle.stop().await;
}

// ============================================================================
// Delivery Edge Cases
// ============================================================================

#[tokio::test]
async fn test_unknown_type_at_worker_fails_terminally() {
    let h = harness();
    let handle = start(&h, 1);

    // Bypasses submission, as a job from an older deployment would
    let job = Job::new("test.removed", json!({}), "default", &policy());
    h.broker.publish("default", &job).await.unwrap();

    let result = wait_for_terminal(&h, job.job_id).await;
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.attempts, 1);
    assert_eq!(h.events.events().len(), 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_duplicate_delivery_of_finished_job_is_skipped() {
    let h = harness();

    let job = Job::new(ECHO, json!({"n": 1}), "default", &policy());
    h.results
        .put(job.job_id, JobResult::completed(&job, json!("done")), Duration::from_secs(60))
        .await
        .unwrap();
    h.broker.publish("default", &job).await.unwrap();

    let handle = start(&h, 1);
    wait_until_drained(&h).await;

    assert_eq!(h.echo_calls.load(Ordering::SeqCst), 0);
    let result = h.engine.get_status(job.job_id).await.unwrap();
    assert_eq!(result.return_value, Some(json!("done")));
    assert_eq!(handle.stats().processed(), 0);

    handle.stop().await;
}

#[tokio::test]
async fn test_stale_attempt_is_skipped() {
    let h = harness();

    let job = Job::new(ECHO, json!({}), "default", &policy());
    let newer = job.next_attempt().next_attempt();
    h.results
        .put(job.job_id, JobResult::retrying(&newer, "later failure"), Duration::from_secs(60))
        .await
        .unwrap();
    h.broker.publish("default", &job).await.unwrap();

    let handle = start(&h, 1);
    wait_until_drained(&h).await;

    assert_eq!(h.echo_calls.load(Ordering::SeqCst), 0);
    handle.stop().await;
}

#[tokio::test]
async fn test_retry_delay_does_not_hold_a_context() {
    let h = harness();
    let handle = start(&h, 1);

    let waiting = h.engine.submit(SLOW_RETRY, json!({})).await.unwrap();
    wait_for_status(&h, waiting, JobStatus::Retrying).await;

    // The only context is free while the retry sits in the broker
    let quick = h.engine.submit(ECHO, json!({"quick": true})).await.unwrap();
    let result = wait_for_terminal(&h, quick).await;
    assert_eq!(result.status, JobStatus::Completed);

    assert_eq!(h.engine.get_status(waiting).await.unwrap().status, JobStatus::Retrying);
    assert_eq!(h.broker.depth("default").await.unwrap(), 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_jobs_of_a_vanished_consumer_are_redelivered() {
    let h = harness();
    let job_id = h.engine.submit(ECHO, json!({"n": 1})).await.unwrap();

    // Taken by a consumer tag that no running pool will ever use again
    h.broker
        .heartbeat("gone-host:test:7", Duration::from_millis(50))
        .await
        .unwrap();
    let lost = h
        .broker
        .consume("gone-host:test:7", &["default".to_string()], Duration::from_millis(50))
        .await
        .unwrap();
    assert!(lost.is_some());

    let config = WorkerConfig {
        consumer_ttl: Duration::from_millis(150),
        ..worker_config(1)
    };
    let handle = WorkerPool::new(h.engine.clone(), config).start().unwrap();

    let result = wait_for_terminal(&h, job_id).await;
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.return_value, Some(json!({"n": 1})));
    wait_until_drained(&h).await;
    assert_eq!(h.echo_calls.load(Ordering::SeqCst), 1);

    handle.stop().await;
}

// ============================================================================
// Infrastructure Outage Tests
// ============================================================================

#[tokio::test]
async fn test_result_store_outage_degrades_then_recovers() {
    let store = Arc::new(FlakyStore::default());
    let h = harness_with(store.clone());
    store.down.store(true, Ordering::SeqCst);

    let job = Job::new(ECHO, json!({"n": 7}), "default", &policy());
    h.broker.publish("default", &job).await.unwrap();
    let handle = start(&h, 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !handle.stats().is_degraded() {
        assert!(tokio::time::Instant::now() < deadline, "pool never reported degraded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Handed back to the queue while the context backs off
    while h.broker.in_flight() != 0 || h.broker.depth("default").await.unwrap() != 1 {
        assert!(tokio::time::Instant::now() < deadline, "job was not returned to its queue");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.echo_calls.load(Ordering::SeqCst), 0);
    assert_eq!(handle.stats().processed(), 0);

    store.down.store(false, Ordering::SeqCst);
    let result = wait_for_terminal(&h, job.job_id).await;
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.return_value, Some(json!({"n": 7})));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while handle.stats().is_degraded() {
        assert!(tokio::time::Instant::now() < deadline, "pool stayed degraded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.echo_calls.load(Ordering::SeqCst), 1);

    handle.stop().await;
}

// ============================================================================
// Pool Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_many_jobs_across_contexts() {
    let h = harness();
    let handle = start(&h, 4);

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(h.engine.submit(ECHO, json!({"i": i})).await.unwrap());
    }
    for (i, id) in ids.into_iter().enumerate() {
        let result = wait_for_terminal(&h, id).await;
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.return_value, Some(json!({"i": i})));
    }

    assert_eq!(h.echo_calls.load(Ordering::SeqCst), 20);
    assert_eq!(handle.stats().succeeded(), 20);
    assert_eq!(handle.stats().busy(), 0);

    handle.stop().await;
}

#[tokio::test]
async fn test_zero_concurrency_is_rejected() {
    let h = harness();
    let result = WorkerPool::new(h.engine.clone(), worker_config(0)).start();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_stop_returns_promptly_when_idle() {
    let h = harness();
    let handle = start(&h, 3);
    assert_eq!(handle.name(), "test");

    let stopped = tokio::time::timeout(Duration::from_secs(2), handle.stop()).await;
    assert!(stopped.is_ok());
}

#[tokio::test]
async fn test_stats_snapshot_serializes() {
    let h = harness();
    let handle = start(&h, 1);

    let job_id = h.engine.submit(ECHO, json!({})).await.unwrap();
    wait_for_terminal(&h, job_id).await;

    let snapshot = serde_json::to_value(handle.stats().snapshot()).unwrap();
    assert_eq!(snapshot["succeeded"], json!(1));
    assert_eq!(snapshot["degraded"], json!(false));

    handle.stop().await;
}
