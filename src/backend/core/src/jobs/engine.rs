//! The job engine: the explicit context shared by the API, workers and beat.
//!
//! A [`JobEngine`] owns nothing global. Tests build as many isolated engines
//! as they like, each over its own broker and result store.

use std::sync::Arc;
use std::time::Duration;

use super::broker::DurableQueue;
use super::events::EventSink;
use super::job::{Job, JobId, JobResult};
use super::registry::{RegisteredTask, TaskRegistry};
use super::result_store::ResultStore;
use super::router::QueueRouter;
use crate::error::{Result, VisionaryError};
use crate::observability::{metrics, TaskEvent};

/// Registry, routing and backends bound together.
#[derive(Clone)]
pub struct JobEngine {
    registry: Arc<TaskRegistry>,
    router: Arc<QueueRouter>,
    broker: Arc<dyn DurableQueue>,
    results: Arc<dyn ResultStore>,
    events: Arc<dyn EventSink>,
    result_ttl: Duration,
}

impl JobEngine {
    pub fn new(
        registry: TaskRegistry,
        router: QueueRouter,
        broker: Arc<dyn DurableQueue>,
        results: Arc<dyn ResultStore>,
        events: Arc<dyn EventSink>,
        result_ttl: Duration,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            router: Arc::new(router),
            broker,
            results,
            events,
            result_ttl,
        }
    }

    /// Queue a job of `type_name`.
    ///
    /// Unknown types are rejected before anything is written. The pending
    /// record is stored before the job is published so a status lookup right
    /// after submission never misses; it is removed again if publishing fails.
    pub async fn submit(&self, type_name: &str, payload: serde_json::Value) -> Result<JobId> {
        let task = self.registry.resolve(type_name)?;
        let queue = self.queue_for(type_name, task).to_string();
        let job = Job::new(type_name, payload, queue.as_str(), &task.policy);
        let job_id = job.job_id;

        self.results
            .put(job_id, JobResult::pending(&job), self.result_ttl)
            .await?;

        if let Err(e) = self.broker.publish(&queue, &job).await {
            if let Err(cleanup) = self.results.delete(job_id).await {
                tracing::warn!(job_id = %job_id, error = %cleanup, "Failed to remove pending record");
            }
            e.log();
            return Err(e);
        }

        metrics::record_submitted(type_name, &queue);
        TaskEvent::Submitted {
            job_id: job_id.to_string(),
            task: type_name.to_string(),
            queue,
        }
        .log();

        Ok(job_id)
    }

    /// Current record for `job_id`; `JobNotFound` when absent or expired.
    pub async fn get_status(&self, job_id: JobId) -> Result<JobResult> {
        self.results
            .get(job_id)
            .await?
            .ok_or_else(|| VisionaryError::job_not_found(job_id))
    }

    /// Queue a registered type is sent to.
    pub fn route(&self, type_name: &str) -> Result<&str> {
        let task = self.registry.resolve(type_name)?;
        Ok(self.queue_for(type_name, task))
    }

    fn queue_for<'a>(&'a self, type_name: &str, task: &'a RegisteredTask) -> &'a str {
        match task.policy.queue.as_deref() {
            Some(queue) => queue,
            None => self.router.route(type_name),
        }
    }

    /// Every queue a registered task can land on, sorted and deduplicated.
    pub fn queues(&self) -> Vec<String> {
        let mut queues = self.router.queues();
        for name in self.registry.type_names() {
            if let Ok(queue) = self.route(name) {
                queues.push(queue.to_string());
            }
        }
        queues.sort();
        queues.dedup();
        queues
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn router(&self) -> &QueueRouter {
        &self.router
    }

    pub fn broker(&self) -> &Arc<dyn DurableQueue> {
        &self.broker
    }

    pub fn results(&self) -> &Arc<dyn ResultStore> {
        &self.results
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn result_ttl(&self) -> Duration {
        self.result_ttl
    }
}

impl std::fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEngine")
            .field("tasks", &self.registry.len())
            .field("broker", &self.broker.name())
            .field("results", &self.results.name())
            .field("result_ttl", &self.result_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::broker::InMemoryBroker;
    use crate::jobs::events::MemoryEventSink;
    use crate::jobs::job::{JobError, JobStatus, TaskContext};
    use crate::jobs::registry::{TaskPolicy, TaskRegistryBuilder};
    use crate::jobs::result_store::InMemoryResultStore;
    use crate::jobs::router::RoutingRule;
    use async_trait::async_trait;

    fn policy() -> TaskPolicy {
        TaskPolicy {
            queue: None,
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            soft_timeout: Duration::from_secs(1),
            hard_timeout: Duration::from_secs(2),
        }
    }

    async fn noop(_ctx: TaskContext, payload: serde_json::Value) -> std::result::Result<serde_json::Value, JobError> {
        Ok(payload)
    }

    fn engine_with(broker: Arc<dyn DurableQueue>) -> (JobEngine, Arc<InMemoryResultStore>) {
        let mut builder = TaskRegistryBuilder::new(policy());
        builder.register_default("tts.generate", noop).unwrap();
        builder
            .register("study.pinned", noop, policy().with_queue("priority"))
            .unwrap();
        let router = QueueRouter::new(&[RoutingRule::new("tts.*", "tts")], "default").unwrap();
        let results = Arc::new(InMemoryResultStore::new());
        let engine = JobEngine::new(
            builder.build(),
            router,
            broker,
            results.clone(),
            Arc::new(MemoryEventSink::new()),
            Duration::from_secs(60),
        );
        (engine, results)
    }

    #[tokio::test]
    async fn test_submit_writes_pending_and_publishes() {
        let broker = Arc::new(InMemoryBroker::new());
        let (engine, _) = engine_with(broker.clone());

        let job_id = engine
            .submit("tts.generate", serde_json::json!({"text": "hello"}))
            .await
            .unwrap();

        let status = engine.get_status(job_id).await.unwrap();
        assert_eq!(status.status, JobStatus::Pending);
        assert_eq!(status.attempts, 0);
        assert_eq!(broker.depth("tts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_type_never_reaches_queue() {
        let broker = Arc::new(InMemoryBroker::new());
        let (engine, results) = engine_with(broker.clone());

        let err = engine.submit("nope.task", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownTaskType);
        assert_eq!(broker.depth("default").await.unwrap(), 0);
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_policy_queue_overrides_routing() {
        let (engine, _) = engine_with(Arc::new(InMemoryBroker::new()));
        assert_eq!(engine.route("study.pinned").unwrap(), "priority");
        assert_eq!(engine.route("tts.generate").unwrap(), "tts");
        assert_eq!(engine.queues(), vec!["default", "priority", "tts"]);
    }

    #[tokio::test]
    async fn test_get_status_not_found() {
        let (engine, _) = engine_with(Arc::new(InMemoryBroker::new()));
        let err = engine.get_status(JobId::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }

    struct DownBroker;

    #[async_trait]
    impl DurableQueue for DownBroker {
        fn name(&self) -> &'static str {
            "down"
        }
        async fn publish(&self, _queue: &str, _job: &Job) -> Result<()> {
            Err(VisionaryError::queue_unavailable("connection refused"))
        }
        async fn publish_delayed(&self, _queue: &str, _job: &Job, _delay: Duration) -> Result<()> {
            Err(VisionaryError::queue_unavailable("connection refused"))
        }
        async fn consume(
            &self,
            _consumer: &str,
            _queues: &[String],
            _timeout: Duration,
        ) -> Result<Option<crate::jobs::broker::Delivery>> {
            Err(VisionaryError::queue_unavailable("connection refused"))
        }
        async fn ack(&self, _delivery: &crate::jobs::broker::Delivery) -> Result<()> {
            Ok(())
        }
        async fn nack(&self, _delivery: &crate::jobs::broker::Delivery) -> Result<()> {
            Ok(())
        }
        async fn recover(&self, _consumer: &str) -> Result<usize> {
            Ok(0)
        }
        async fn heartbeat(&self, _consumer: &str, _ttl: Duration) -> Result<()> {
            Err(VisionaryError::queue_unavailable("connection refused"))
        }
        async fn recover_orphaned(&self) -> Result<usize> {
            Ok(0)
        }
        async fn depth(&self, _queue: &str) -> Result<usize> {
            Ok(0)
        }
        async fn acquire_lease(&self, _name: &str, _holder: &str, _ttl: Duration) -> Result<bool> {
            Ok(false)
        }
        async fn last_fired(&self, _entry: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
            Ok(None)
        }
        async fn record_fired(&self, _entry: &str, _at: chrono::DateTime<chrono::Utc>) -> Result<()> {
            Ok(())
        }
        async fn ping(&self) -> Result<()> {
            Err(VisionaryError::queue_unavailable("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_failed_publish_rolls_back_pending_record() {
        let (engine, results) = engine_with(Arc::new(DownBroker));
        let err = engine
            .submit("tts.generate", serde_json::json!({"text": "hi"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueueUnavailable);
        assert!(results.is_empty());
    }
}
