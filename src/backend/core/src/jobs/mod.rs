//! Background job system.
//!
//! - **Registry**: closed mapping from task type names to handlers and policies
//! - **Router**: glob rules choosing a queue per task type
//! - **Engine**: submission and status lookup over the broker and result store
//! - **Worker**: execution contexts with the retry state machine and time limits
//! - **Beat**: periodic submissions under a broker lease
//! - **Events**: fire-and-forget failure reporting
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            Background Job System                          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   submit   ┌────────────┐  publish   ┌────────────────┐  │
//! │  │ HTTP API / │──────────▶│ JobEngine  │──────────▶│ DurableQueue   │  │
//! │  │    Beat    │           │ (registry, │           │ (Redis/memory) │  │
//! │  └────────────┘           │  router)   │           └───────┬────────┘  │
//! │                           └─────┬──────┘                   │ consume   │
//! │                      pending    │                          ▼           │
//! │                                 ▼                  ┌────────────────┐  │
//! │                          ┌────────────┐  outcome   │  WorkerPool    │  │
//! │                          │ResultStore │◀──────────│ (late ack,     │  │
//! │                          │   (TTL)    │           │  retry, limits)│  │
//! │                          └────────────┘           └───────┬────────┘  │
//! │                                                           │ terminal  │
//! │                                                           ▼           │
//! │                                                   ┌────────────────┐  │
//! │                                                   │   EventSink    │  │
//! │                                                   └────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut builder = TaskRegistryBuilder::new(config.tasks.policy());
//! register_builtin_tasks(&mut builder)?;
//!
//! let engine = JobEngine::new(
//!     builder.build(),
//!     QueueRouter::new(&config.routing.rules, &config.routing.default_queue)?,
//!     Arc::new(InMemoryBroker::new()),
//!     Arc::new(InMemoryResultStore::new()),
//!     Arc::new(TracingEventSink::default()),
//!     config.tasks.result_ttl(),
//! );
//!
//! let pool = WorkerPool::new(engine.clone(), WorkerConfig::default()).start()?;
//! let job_id = engine.submit("tts.generate", json!({"text": "hello"})).await?;
//! let status = engine.get_status(job_id).await?;
//! ```

pub mod beat;
pub mod broker;
pub mod builtin;
pub mod engine;
pub mod events;
pub mod job;
pub mod registry;
pub mod result_store;
pub mod router;
pub mod worker;

pub use beat::{Beat, BeatHandle, BeatSettings, ScheduleEntry, ScheduleSpec, BEAT_LEASE};
pub use broker::{Delivery, DurableQueue, InMemoryBroker, RedisBroker};
pub use builtin::register_builtin_tasks;
pub use engine::JobEngine;
pub use events::{
    EventContext, EventSink, EventTags, MemoryEventSink, Severity, SinkEvent, TracingEventSink,
    WebhookEventSink,
};
pub use job::{
    HandlerOutcome, Job, JobError, JobId, JobResult, JobStatus, TaskContext, TimeoutKind,
};
pub use registry::{RegisteredTask, TaskHandler, TaskPolicy, TaskRegistry, TaskRegistryBuilder};
pub use result_store::{InMemoryResultStore, RedisResultStore, ResultStore};
pub use router::{QueueRouter, RoutingRule};
pub use worker::{WorkerConfig, WorkerHandle, WorkerPool, WorkerStats, WorkerStatsSnapshot};
