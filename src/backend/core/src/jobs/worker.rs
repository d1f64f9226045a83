//! Worker pool for concurrent job execution.
//!
//! A pool runs `concurrency` execution contexts. Each context takes one job at
//! a time from the broker, runs its handler under the soft and hard time
//! limits, records the outcome and only then acknowledges the delivery.
//!
//! Alongside the contexts a keeper task renews each consumer's heartbeat and
//! requeues jobs held by consumers that stopped renewing theirs, such as those
//! of a node that restarted under a different name.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::broker::Delivery;
use super::engine::JobEngine;
use super::events::{EventContext, Severity};
use super::job::{HandlerOutcome, Job, JobError, JobResult, TimeoutKind, TaskContext};
use super::registry::TaskHandler;
use crate::config::WorkerPoolConfig;
use crate::error::{ErrorCode, Result, VisionaryError};
use crate::observability::{metrics, TaskEvent};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MIN_KEEPER_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pool name
    pub name: String,
    /// Queues consumed; empty means every queue the engine can route to
    pub queues: Vec<String>,
    /// Number of execution contexts
    pub concurrency: usize,
    /// Node identifier used in consumer tags
    pub node_name: String,
    /// How long one broker wait lasts before the shutdown flag is rechecked
    pub consume_timeout: Duration,
    /// How long `stop` waits for in-flight jobs
    pub shutdown_timeout: Duration,
    /// Ceiling of the backoff after infrastructure errors
    pub max_backoff: Duration,
    /// Heartbeat lifetime; a consumer silent this long loses its deliveries
    pub consumer_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            queues: Vec::new(),
            concurrency: 4,
            node_name: "visionary".to_string(),
            consume_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            consumer_ttl: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn from_pool(pool: &WorkerPoolConfig, node_name: impl Into<String>, shutdown_timeout: Duration) -> Self {
        Self {
            name: pool.name.clone(),
            queues: pool.queues.clone(),
            concurrency: pool.concurrency,
            node_name: node_name.into(),
            shutdown_timeout,
            ..Self::default()
        }
    }

    pub fn with_consumer_ttl(mut self, ttl: Duration) -> Self {
        self.consumer_ttl = ttl;
        self
    }

    /// Heartbeats are renewed three times per TTL.
    fn keeper_interval(&self) -> Duration {
        (self.consumer_ttl / 3).max(MIN_KEEPER_INTERVAL)
    }

    fn consumer_tag(&self, index: usize) -> String {
        format!("{}:{}:{}", self.node_name, self.name, index)
    }
}

/// Statistics for a worker pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Deliveries that reached a handler
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    /// Attempts rescheduled after a failure
    pub retried: Arc<AtomicU64>,
    /// Jobs that reached terminal failure
    pub failed: Arc<AtomicU64>,
    /// Attempts stopped by a time limit
    pub timed_out: Arc<AtomicU64>,
    /// Contexts currently running a job
    pub busy: Arc<AtomicU64>,
    /// Set while the broker or result store is failing
    pub degraded: Arc<AtomicBool>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    pub fn busy(&self) -> u64 {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed(),
            succeeded: self.succeeded(),
            retried: self.retried(),
            failed: self.failed(),
            timed_out: self.timed_out(),
            busy: self.busy(),
            degraded: self.is_degraded(),
        }
    }
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub busy: u64,
    pub degraded: bool,
}

/// Handle for controlling a running pool.
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    contexts: Vec<JoinHandle<()>>,
    keeper: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal every context to stop fetching.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Get pool statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Stop fetching and wait up to the shutdown timeout for in-flight jobs.
    ///
    /// Contexts still running after the timeout are aborted; their deliveries
    /// stay unacked and are recovered on the next start.
    pub async fn stop(mut self) {
        self.shutdown();
        let waited = tokio::time::timeout(
            self.shutdown_timeout,
            futures::future::join_all(self.contexts.iter_mut()),
        )
        .await;

        if waited.is_err() {
            tracing::warn!(
                pool = %self.name,
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Shutdown timeout reached, aborting in-flight jobs"
            );
            for context in &self.contexts {
                context.abort();
            }
        }
        self.keeper.abort();
        tracing::info!(pool = %self.name, "Worker pool stopped");
    }
}

/// Worker pool that executes jobs from its bound queues.
pub struct WorkerPool {
    engine: JobEngine,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl WorkerPool {
    pub fn new(engine: JobEngine, config: WorkerConfig) -> Self {
        Self {
            engine,
            config,
            stats: WorkerStats::new(),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Start the execution contexts, returning a handle for control.
    pub fn start(self) -> Result<WorkerHandle> {
        if self.config.concurrency == 0 {
            return Err(VisionaryError::configuration(format!(
                "worker pool {} has zero concurrency",
                self.config.name
            )));
        }
        if self.config.consumer_ttl.is_zero() {
            return Err(VisionaryError::configuration(format!(
                "worker pool {} has a zero consumer TTL",
                self.config.name
            )));
        }
        let queues = if self.config.queues.is_empty() {
            self.engine.queues()
        } else {
            self.config.queues.clone()
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = Arc::new(self.config);
        let queues: Arc<[String]> = queues.into();

        tracing::info!(
            pool = %config.name,
            concurrency = config.concurrency,
            queues = ?queues,
            "Worker pool started"
        );

        let contexts = (0..config.concurrency)
            .map(|index| {
                let context = ExecutionContext {
                    consumer: config.consumer_tag(index),
                    engine: self.engine.clone(),
                    queues: queues.clone(),
                    config: config.clone(),
                    stats: self.stats.clone(),
                };
                tokio::spawn(context.run(shutdown_rx.clone()))
            })
            .collect();

        let consumers = (0..config.concurrency).map(|i| config.consumer_tag(i)).collect();
        let keeper = tokio::spawn(keep_alive(self.engine.clone(), consumers, config.clone()));

        Ok(WorkerHandle {
            name: config.name.clone(),
            shutdown: shutdown_tx,
            stats: self.stats,
            contexts,
            keeper,
            shutdown_timeout: config.shutdown_timeout,
        })
    }
}

/// Renew the pool's heartbeats and sweep up deliveries of silent consumers.
///
/// Runs until the pool handle aborts it, after the contexts have finished, so
/// jobs still running during shutdown stay owned.
async fn keep_alive(engine: JobEngine, consumers: Vec<String>, config: Arc<WorkerConfig>) {
    let mut interval = tokio::time::interval(config.keeper_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        for consumer in &consumers {
            if let Err(e) = engine.broker().heartbeat(consumer, config.consumer_ttl).await {
                tracing::warn!(consumer = %consumer, error = %e, "Failed to renew consumer heartbeat");
            }
        }
        match engine.broker().recover_orphaned().await {
            Ok(0) => {}
            Ok(count) => tracing::info!(pool = %config.name, count, "Recovered jobs of silent consumers"),
            Err(e) => tracing::warn!(pool = %config.name, error = %e, "Orphan sweep failed"),
        }
    }
}

/// One job at a time, prefetch 1.
struct ExecutionContext {
    consumer: String,
    engine: JobEngine,
    queues: Arc<[String]>,
    config: Arc<WorkerConfig>,
    stats: WorkerStats,
}

impl ExecutionContext {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self
            .engine
            .broker()
            .heartbeat(&self.consumer, self.config.consumer_ttl)
            .await
        {
            self.stats.degraded.store(true, Ordering::Relaxed);
            tracing::warn!(consumer = %self.consumer, error = %e, "Failed to register consumer heartbeat");
        }
        match self.engine.broker().recover(&self.consumer).await {
            Ok(0) => {}
            Ok(count) => tracing::info!(consumer = %self.consumer, count, "Recovered unacknowledged jobs"),
            Err(e) => {
                self.stats.degraded.store(true, Ordering::Relaxed);
                tracing::warn!(consumer = %self.consumer, error = %e, "Failed to recover unacknowledged jobs");
            }
        }

        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let consumed = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                consumed = self.engine.broker().consume(&self.consumer, &self.queues, self.config.consume_timeout) => consumed,
            };

            let outcome = match consumed {
                Ok(None) => Ok(()),
                Ok(Some(delivery)) => self.handle(delivery).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    backoff = INITIAL_BACKOFF;
                    self.stats.degraded.store(false, Ordering::Relaxed);
                }
                Err(e) => {
                    if e.is_infrastructure() {
                        self.stats.degraded.store(true, Ordering::Relaxed);
                    }
                    tracing::warn!(
                        consumer = %self.consumer,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Worker backing off"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }

        tracing::info!(consumer = %self.consumer, "Execution context stopped");
    }

    /// Process one delivery; on error the delivery is handed back to the broker.
    async fn handle(&self, delivery: Delivery) -> Result<()> {
        match self.process(&delivery).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(nack_err) = self.engine.broker().nack(&delivery).await {
                    tracing::warn!(
                        job_id = %delivery.job.job_id,
                        error = %nack_err,
                        "Failed to return job to its queue"
                    );
                }
                Err(e)
            }
        }
    }

    async fn process(&self, delivery: &Delivery) -> Result<()> {
        let job = &delivery.job;
        let results = self.engine.results();
        let ttl = self.engine.result_ttl();

        if let Some(existing) = results.get(job.job_id).await? {
            if existing.status.is_terminal() || existing.attempts > job.execution_number() {
                tracing::debug!(
                    job_id = %job.job_id,
                    status = %existing.status,
                    attempt = job.execution_number(),
                    "Skipping duplicate delivery"
                );
                return self.engine.broker().ack(delivery).await;
            }
        }

        let handler = match self.engine.registry().resolve(&job.type_name) {
            Ok(task) => task.handler.clone(),
            Err(e) => {
                let error = JobError::from(e);
                return self.fail(delivery, &HandlerOutcome::TerminalFailure(error)).await;
            }
        };

        results.put(job.job_id, JobResult::running(job), ttl).await?;
        TaskEvent::Started {
            job_id: job.job_id.to_string(),
            task: job.type_name.clone(),
            attempt: job.execution_number(),
            consumer: self.consumer.clone(),
        }
        .log();

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        let busy = self.stats.busy.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_workers_busy(&self.config.name, busy);

        let started = Instant::now();
        let outcome = execute(handler, job).await;
        let elapsed = started.elapsed();

        let busy = self.stats.busy.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::set_workers_busy(&self.config.name, busy);

        if let HandlerOutcome::Timeout(kind) = &outcome {
            self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
            metrics::record_timed_out(&job.type_name, &kind.to_string());
        }

        match outcome {
            HandlerOutcome::Success(value) => self.complete(delivery, value, elapsed).await,
            HandlerOutcome::RecoverableFailure(_) | HandlerOutcome::Timeout(_) if !job.retries_exhausted() => {
                self.retry(delivery, &outcome).await
            }
            other => self.fail(delivery, &other).await,
        }
    }

    async fn complete(&self, delivery: &Delivery, value: serde_json::Value, elapsed: Duration) -> Result<()> {
        let job = &delivery.job;
        self.engine
            .results()
            .put(job.job_id, JobResult::completed(job, value), self.engine.result_ttl())
            .await?;
        self.engine.broker().ack(delivery).await?;

        self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        metrics::record_completed(&job.type_name, elapsed.as_secs_f64());
        TaskEvent::Succeeded {
            job_id: job.job_id.to_string(),
            task: job.type_name.clone(),
            attempt: job.execution_number(),
            duration_ms: elapsed.as_millis() as u64,
        }
        .log();
        Ok(())
    }

    /// The next attempt waits in the broker; the original delivery is acked
    /// only once that publish has succeeded.
    async fn retry(&self, delivery: &Delivery, outcome: &HandlerOutcome) -> Result<()> {
        let job = &delivery.job;
        let error = outcome.error_detail().unwrap_or_default();

        self.engine
            .results()
            .put(job.job_id, JobResult::retrying(job, error.clone()), self.engine.result_ttl())
            .await?;
        self.engine
            .broker()
            .publish_delayed(&job.queue_name, &job.next_attempt(), job.retry_delay)
            .await?;
        self.engine.broker().ack(delivery).await?;

        self.stats.retried.fetch_add(1, Ordering::Relaxed);
        metrics::record_retried(&job.type_name);
        TaskEvent::Retried {
            job_id: job.job_id.to_string(),
            task: job.type_name.clone(),
            attempt: job.execution_number(),
            delay_ms: job.retry_delay.as_millis() as u64,
            error,
        }
        .log();
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, outcome: &HandlerOutcome) -> Result<()> {
        let job = &delivery.job;
        let error = outcome.error_detail().unwrap_or_default();

        self.engine
            .results()
            .put(job.job_id, JobResult::failed(job, error.clone()), self.engine.result_ttl())
            .await?;

        let mut context = EventContext::new();
        context.insert("task_id".into(), serde_json::json!(job.job_id.to_string()));
        context.insert("type_name".into(), serde_json::json!(job.type_name));
        context.insert("retries".into(), serde_json::json!(job.attempt_count));
        context.insert("error".into(), serde_json::json!(error));
        context.insert("error_code".into(), serde_json::json!(ErrorCode::TerminalFailure.to_string()));
        context.insert("outcome".into(), serde_json::json!(outcome.label()));
        self.engine.events().emit(
            Severity::Error,
            format!("Task {} failed after all retries", job.job_id),
            context,
        );

        self.engine.broker().ack(delivery).await?;

        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        metrics::record_failed(&job.type_name);
        TaskEvent::Failed {
            job_id: job.job_id.to_string(),
            task: job.type_name.clone(),
            attempts: job.execution_number(),
            error,
        }
        .log();
        Ok(())
    }
}

/// Run the handler on its own task under the job's time limits.
///
/// The soft limit cancels the context's token. The hard limit aborts the task.
/// A success that arrives after the soft signal is kept; a failure becomes a
/// soft timeout.
async fn execute(handler: Arc<dyn TaskHandler>, job: &Job) -> HandlerOutcome {
    let token = CancellationToken::new();
    let ctx = TaskContext::new(job, token.clone());
    let payload = job.payload.clone();
    let mut task = tokio::spawn(async move { handler.run(ctx, payload).await });

    let soft = tokio::time::sleep(job.soft_timeout);
    let hard = tokio::time::sleep(job.hard_timeout);
    tokio::pin!(soft);
    tokio::pin!(hard);
    let mut soft_fired = false;

    loop {
        tokio::select! {
            joined = &mut task => {
                return match joined {
                    Ok(Ok(value)) => HandlerOutcome::Success(value),
                    Ok(Err(_)) if soft_fired => HandlerOutcome::Timeout(TimeoutKind::Soft),
                    Ok(Err(error)) => HandlerOutcome::from_result(Err(error)),
                    Err(join_error) => HandlerOutcome::RecoverableFailure(join_failure(join_error)),
                };
            }
            _ = &mut soft, if !soft_fired => {
                soft_fired = true;
                token.cancel();
                tracing::warn!(job_id = %job.job_id, task = %job.type_name, "Soft time limit exceeded");
            }
            _ = &mut hard => {
                task.abort();
                tracing::warn!(job_id = %job.job_id, task = %job.type_name, "Hard time limit exceeded, handler aborted");
                return HandlerOutcome::Timeout(TimeoutKind::Hard);
            }
        }
    }
}

fn join_failure(error: tokio::task::JoinError) -> JobError {
    if !error.is_panic() {
        return JobError::retryable(format!("handler task ended unexpectedly: {}", error))
            .with_code(ErrorCode::HandlerError.to_string());
    }
    let panic = error.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    JobError::retryable(format!("handler panicked: {}", message)).with_code("PANIC")
}
