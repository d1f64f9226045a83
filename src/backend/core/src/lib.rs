#![allow(clippy::result_large_err)]
//! # Visionary Core
//!
//! Background job processing for the Visionary learning platform.
//!
//! ## Architecture
//!
//! - **Jobs**: task registry, queue routing, durable broker, worker pools with
//!   late acknowledgment, fixed-delay retries and soft/hard time limits
//! - **Beat**: single-instance periodic submissions guarded by a broker lease
//! - **Result Store**: job outcomes with a bounded lifetime
//! - **Events**: terminal failures reported to a webhook or the log
//! - **API**: Axum HTTP surface for submission, status and health
//! - **Observability**: structured logging, optional OTLP export, Prometheus metrics

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod jobs;
pub mod observability;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, VisionaryError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, VisionaryError};
    pub use crate::jobs::{
        register_builtin_tasks, Beat, BeatSettings, DurableQueue, EventSink, InMemoryBroker,
        InMemoryResultStore, Job, JobEngine, JobError, JobId, JobResult, JobStatus, QueueRouter,
        ResultStore, RoutingRule, ScheduleSpec, TaskContext, TaskHandler, TaskPolicy,
        TaskRegistry, TaskRegistryBuilder, WorkerConfig, WorkerPool,
    };
}
