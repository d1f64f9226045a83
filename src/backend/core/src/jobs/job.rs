//! Job definitions.
//!
//! This module provides the data model shared by the dispatcher, the broker,
//! the workers and the result store:
//!
//! - **Job**: the message that travels through the broker
//! - **JobStatus** / **JobResult**: the observable state kept in the result store
//! - **JobError** / **HandlerOutcome**: how a handler invocation ended
//! - **TaskContext**: what a handler sees while it runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::registry::TaskPolicy;
use crate::error::{ErrorCode, VisionaryError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = VisionaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| VisionaryError::new(ErrorCode::InvalidInput, format!("Invalid job id: {}", e)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Message
// ═══════════════════════════════════════════════════════════════════════════════

/// A unit of work as carried by the broker.
///
/// Everything except `attempt_count` is fixed at submission. Each retry
/// publishes a copy with `attempt_count + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub type_name: String,
    pub payload: serde_json::Value,
    pub queue_name: String,
    /// Number of retries already scheduled; 0 on the first execution
    pub attempt_count: u32,
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    #[serde(with = "duration_ms")]
    pub soft_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub hard_timeout: Duration,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh job from a task's execution policy.
    pub fn new(
        type_name: impl Into<String>,
        payload: serde_json::Value,
        queue_name: impl Into<String>,
        policy: &TaskPolicy,
    ) -> Self {
        Self {
            job_id: JobId::new(),
            type_name: type_name.into(),
            payload,
            queue_name: queue_name.into(),
            attempt_count: 0,
            max_retries: policy.max_retries,
            retry_delay: policy.retry_delay,
            soft_timeout: policy.soft_timeout,
            hard_timeout: policy.hard_timeout,
            created_at: Utc::now(),
        }
    }

    /// The copy to publish for the next retry.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_count: self.attempt_count + 1,
            ..self.clone()
        }
    }

    /// 1-indexed number of the execution this copy represents.
    pub fn execution_number(&self) -> u32 {
        self.attempt_count + 1
    }

    /// True when a failure of this copy must not be retried.
    pub fn retries_exhausted(&self) -> bool {
        self.attempt_count >= self.max_retries
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Observable status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue
    Pending,
    /// Being executed
    Running,
    /// Handler returned a value
    Completed,
    /// Terminal failure, never retried again
    Failed,
    /// Failed, next attempt is scheduled
    Retrying,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Result
// ═══════════════════════════════════════════════════════════════════════════════

/// The record kept in the result store, overwritten on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub type_name: String,
    pub status: JobStatus,
    /// Executions started so far
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl JobResult {
    fn base(job: &Job, status: JobStatus, attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            job_id: job.job_id,
            type_name: job.type_name.clone(),
            status,
            attempts,
            return_value: None,
            error_detail: None,
            updated_at: now,
            expires_at: now,
        }
    }

    pub fn pending(job: &Job) -> Self {
        Self::base(job, JobStatus::Pending, job.attempt_count)
    }

    pub fn running(job: &Job) -> Self {
        Self::base(job, JobStatus::Running, job.execution_number())
    }

    pub fn completed(job: &Job, value: serde_json::Value) -> Self {
        Self {
            return_value: Some(value),
            ..Self::base(job, JobStatus::Completed, job.execution_number())
        }
    }

    pub fn retrying(job: &Job, error: impl Into<String>) -> Self {
        Self {
            error_detail: Some(error.into()),
            ..Self::base(job, JobStatus::Retrying, job.execution_number())
        }
    }

    pub fn failed(job: &Job, error: impl Into<String>) -> Self {
        Self {
            error_detail: Some(error.into()),
            ..Self::base(job, JobStatus::Failed, job.execution_number())
        }
    }

    /// Stamp the expiry relative to the last update.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        let millis = ttl.as_millis().min(i64::MAX as u128 / 1_000) as i64;
        self.expires_at = self.updated_at + chrono::Duration::milliseconds(millis);
        self
    }

    /// Entries stay readable up to and including `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned by a task handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    /// Whether another attempt could succeed
    pub retryable: bool,
    pub code: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<VisionaryError> for JobError {
    fn from(error: VisionaryError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(error: serde_json::Error) -> Self {
        Self::fatal(format!("invalid payload: {}", error)).with_code("INVALID_PAYLOAD")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Which timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// The handler was asked to stop and ended with a failure
    Soft,
    /// The handler task was aborted
    Hard,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Soft => write!(f, "soft"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

/// How one handler invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Success(serde_json::Value),
    RecoverableFailure(JobError),
    TerminalFailure(JobError),
    Timeout(TimeoutKind),
}

impl HandlerOutcome {
    /// Classify a handler's return value.
    pub fn from_result(result: Result<serde_json::Value, JobError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) if error.retryable => Self::RecoverableFailure(error),
            Err(error) => Self::TerminalFailure(error),
        }
    }

    /// Error text recorded in the result store for non-success outcomes.
    pub fn error_detail(&self) -> Option<String> {
        match self {
            Self::Success(_) => None,
            Self::RecoverableFailure(e) | Self::TerminalFailure(e) => Some(e.to_string()),
            Self::Timeout(kind) => Some(format!("{} time limit exceeded", kind)),
        }
    }

    /// Label recorded on failure events.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::RecoverableFailure(_) => "recoverable_failure",
            Self::TerminalFailure(_) => "terminal_failure",
            Self::Timeout(_) => "timeout",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a handler for one execution.
#[derive(Debug, Clone)]
pub struct TaskContext {
    job_id: JobId,
    type_name: String,
    queue_name: String,
    attempt: u32,
    cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(job: &Job, cancellation: CancellationToken) -> Self {
        Self {
            job_id: job.job_id,
            type_name: job.type_name.clone(),
            queue_name: job.queue_name.clone(),
            attempt: job.execution_number(),
            cancellation,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True once the soft time limit has passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the soft time limit passes.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Run a future unless the soft time limit passes first.
    pub async fn cancellable<F, T>(&self, future: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            result = future => Some(result),
            _ = self.cancellation.cancelled() => None,
        }
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job_id,
            task = %self.type_name,
            attempt = self.attempt,
            message
        );
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job_id,
            task = %self.type_name,
            attempt = self.attempt,
            message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> TaskPolicy {
        TaskPolicy {
            queue: None,
            max_retries,
            retry_delay: Duration::from_secs(60),
            soft_timeout: Duration::from_secs(300),
            hard_timeout: Duration::from_secs(600),
        }
    }

    #[test]
    fn test_job_serializes_durations_as_millis() {
        let job = Job::new("tts.generate", serde_json::json!({"text": "hi"}), "tts", &policy(3));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["retry_delay"], 60_000);
        assert_eq!(value["hard_timeout"], 600_000);
        assert_eq!(value["attempt_count"], 0);

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_next_attempt_only_bumps_attempt_count() {
        let job = Job::new("media.process_upload", serde_json::json!({}), "media", &policy(3));
        let next = job.next_attempt();
        assert_eq!(next.attempt_count, 1);
        assert_eq!(next.job_id, job.job_id);
        assert_eq!(next.created_at, job.created_at);
        assert_eq!(next.execution_number(), 2);
    }

    #[test]
    fn test_retries_exhausted_after_max_retries() {
        let mut job = Job::new("x", serde_json::Value::Null, "default", &policy(3));
        for _ in 0..3 {
            assert!(!job.retries_exhausted());
            job = job.next_attempt();
        }
        assert!(job.retries_exhausted());
        assert_eq!(job.execution_number(), 4);
    }

    #[test]
    fn test_zero_retries_exhausted_immediately() {
        let job = Job::new("x", serde_json::Value::Null, "default", &policy(0));
        assert!(job.retries_exhausted());
    }

    #[test]
    fn test_result_ttl_boundary() {
        let job = Job::new("x", serde_json::Value::Null, "default", &policy(3));
        let result = JobResult::completed(&job, serde_json::json!(1)).with_ttl(Duration::from_secs(3600));
        assert_eq!(result.expires_at - result.updated_at, chrono::Duration::seconds(3600));
        assert!(!result.is_expired_at(result.expires_at));
        assert!(result.is_expired_at(result.expires_at + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn test_result_attempts_track_executions() {
        let job = Job::new("x", serde_json::Value::Null, "default", &policy(3));
        assert_eq!(JobResult::pending(&job).attempts, 0);
        assert_eq!(JobResult::running(&job).attempts, 1);
        let third = job.next_attempt().next_attempt();
        assert_eq!(JobResult::completed(&third, serde_json::json!(null)).attempts, 3);
    }

    #[test]
    fn test_outcome_classification() {
        assert!(matches!(
            HandlerOutcome::from_result(Ok(serde_json::json!(1))),
            HandlerOutcome::Success(_)
        ));
        assert!(matches!(
            HandlerOutcome::from_result(Err(JobError::retryable("flaky"))),
            HandlerOutcome::RecoverableFailure(_)
        ));
        assert!(matches!(
            HandlerOutcome::from_result(Err(JobError::fatal("bad input"))),
            HandlerOutcome::TerminalFailure(_)
        ));
        assert_eq!(
            HandlerOutcome::Timeout(TimeoutKind::Hard).error_detail().unwrap(),
            "hard time limit exceeded"
        );
    }

    #[test]
    fn test_job_id_parse() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[tokio::test]
    async fn test_context_cancellable() {
        let job = Job::new("x", serde_json::Value::Null, "default", &policy(3));
        let token = CancellationToken::new();
        let ctx = TaskContext::new(&job, token.clone());
        assert_eq!(ctx.cancellable(async { 7 }).await, Some(7));

        token.cancel();
        assert!(ctx.is_cancelled());
        let pending = ctx.cancellable(std::future::pending::<()>()).await;
        assert!(pending.is_none());
    }
}
