//! Task registry: the closed mapping from task type names to handlers.
//!
//! Registration happens on a [`TaskRegistryBuilder`] during startup. Building
//! consumes the builder, so the resulting [`TaskRegistry`] cannot change and can
//! be shared between the API, the workers and the beat without locking.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::job::{JobError, TaskContext};
use crate::error::{Result, VisionaryError};

/// Executable body of a task type.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Run one attempt. Return `JobError::retryable` for transient failures and
    /// `JobError::fatal` for failures no retry can fix.
    async fn run(&self, ctx: TaskContext, payload: serde_json::Value) -> std::result::Result<serde_json::Value, JobError>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<serde_json::Value, JobError>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext, payload: serde_json::Value) -> std::result::Result<serde_json::Value, JobError> {
        (self)(ctx, payload).await
    }
}

/// Execution policy of a task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPolicy {
    /// Explicit queue; routing rules decide when unset
    pub queue: Option<String>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub soft_timeout: Duration,
    pub hard_timeout: Duration,
}

impl TaskPolicy {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_timeouts(mut self, soft: Duration, hard: Duration) -> Self {
        self.soft_timeout = soft;
        self.hard_timeout = hard;
        self
    }

    fn validate(&self, type_name: &str) -> Result<()> {
        if self.hard_timeout < self.soft_timeout {
            return Err(VisionaryError::validation(format!(
                "task {} has a hard timeout shorter than its soft timeout",
                type_name
            )));
        }
        if matches!(&self.queue, Some(q) if q.trim().is_empty()) {
            return Err(VisionaryError::validation(format!(
                "task {} names an empty queue",
                type_name
            )));
        }
        Ok(())
    }
}

/// A handler bound to its policy.
#[derive(Clone)]
pub struct RegisteredTask {
    pub handler: Arc<dyn TaskHandler>,
    pub policy: TaskPolicy,
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Collects registrations during startup.
pub struct TaskRegistryBuilder {
    defaults: TaskPolicy,
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistryBuilder {
    /// Start a registry whose `register_default` uses `defaults`.
    pub fn new(defaults: TaskPolicy) -> Self {
        Self {
            defaults,
            tasks: HashMap::new(),
        }
    }

    /// The policy applied by `register_default`.
    pub fn defaults(&self) -> &TaskPolicy {
        &self.defaults
    }

    /// Bind `type_name` to a handler and policy.
    pub fn register<H>(&mut self, type_name: impl Into<String>, handler: H, policy: TaskPolicy) -> Result<&mut Self>
    where
        H: TaskHandler,
    {
        let type_name = type_name.into();
        if type_name.trim().is_empty() {
            return Err(VisionaryError::validation("task type name must not be empty"));
        }
        if self.tasks.contains_key(&type_name) {
            return Err(VisionaryError::duplicate_registration(type_name));
        }
        policy.validate(&type_name)?;

        tracing::debug!(task = %type_name, queue = ?policy.queue, "Registered task");
        self.tasks.insert(
            type_name,
            RegisteredTask {
                handler: Arc::new(handler),
                policy,
            },
        );
        Ok(self)
    }

    /// Bind `type_name` with the default policy.
    pub fn register_default<H>(&mut self, type_name: impl Into<String>, handler: H) -> Result<&mut Self>
    where
        H: TaskHandler,
    {
        let policy = self.defaults.clone();
        self.register(type_name, handler, policy)
    }

    /// Close the registry.
    pub fn build(self) -> TaskRegistry {
        TaskRegistry { tasks: self.tasks }
    }
}

/// Read-only mapping from type names to registered tasks.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    /// Look up a task type.
    pub fn resolve(&self, type_name: &str) -> Result<&RegisteredTask> {
        self.tasks
            .get(type_name)
            .ok_or_else(|| VisionaryError::unknown_task_type(type_name))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.tasks.contains_key(type_name)
    }

    /// Registered names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
