//! Observability: structured logging, optional OTLP span export, and metrics.

use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, ObservabilityConfig};
use crate::error::{Result, VisionaryError};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over `config.log_level`. Spans are exported over OTLP when
/// `config.otlp_endpoint` is set.
pub fn init(service_name: &str, config: &ObservabilityConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer().json().boxed(),
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    let otel_layer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::config().with_resource(opentelemetry_sdk::Resource::new(vec![
                        opentelemetry::KeyValue::new("service.name", service_name.to_string()),
                    ])),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(filter)
        .try_init()?;

    Ok(())
}

/// Flush and stop span export.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Metric names, descriptions, and record helpers.
pub mod metrics {
    use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

    use super::{Result, VisionaryError};

    /// Install the Prometheus recorder and describe every metric.
    pub fn install() -> Result<PrometheusHandle> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| VisionaryError::internal(format!("failed to install metrics recorder: {}", e)))?;
        register_metrics();
        Ok(handle)
    }

    /// Register all metric descriptions.
    pub fn register_metrics() {
        describe_counter!("visionary_jobs_submitted_total", "Jobs accepted by the dispatcher");
        describe_counter!("visionary_jobs_completed_total", "Jobs whose handler succeeded");
        describe_counter!("visionary_jobs_retried_total", "Failed attempts that were rescheduled");
        describe_counter!("visionary_jobs_failed_total", "Jobs that reached terminal failure");
        describe_counter!("visionary_jobs_timed_out_total", "Attempts stopped by a time limit");
        describe_counter!("visionary_errors_total", "Errors raised inside the engine");
        describe_counter!("visionary_beat_fired_total", "Jobs submitted by the beat");
        describe_gauge!("visionary_workers_busy", "Execution contexts currently running a job");
        describe_histogram!("visionary_job_duration_seconds", "Handler execution time in seconds");
    }

    pub fn record_submitted(task: &str, queue: &str) {
        counter!(
            "visionary_jobs_submitted_total",
            "task" => task.to_string(),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    pub fn record_completed(task: &str, duration_secs: f64) {
        counter!("visionary_jobs_completed_total", "task" => task.to_string()).increment(1);
        histogram!("visionary_job_duration_seconds", "task" => task.to_string()).record(duration_secs);
    }

    pub fn record_retried(task: &str) {
        counter!("visionary_jobs_retried_total", "task" => task.to_string()).increment(1);
    }

    pub fn record_failed(task: &str) {
        counter!("visionary_jobs_failed_total", "task" => task.to_string()).increment(1);
    }

    pub fn record_timed_out(task: &str, kind: &str) {
        counter!(
            "visionary_jobs_timed_out_total",
            "task" => task.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn record_beat_fired(entry: &str) {
        counter!("visionary_beat_fired_total", "entry" => entry.to_string()).increment(1);
    }

    pub fn set_workers_busy(pool: &str, busy: u64) {
        gauge!("visionary_workers_busy", "pool" => pool.to_string()).set(busy as f64);
    }
}

/// Job lifecycle events, logged as one structured line each.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event_type")]
pub enum TaskEvent {
    Submitted {
        job_id: String,
        task: String,
        queue: String,
    },
    Started {
        job_id: String,
        task: String,
        attempt: u32,
        consumer: String,
    },
    Succeeded {
        job_id: String,
        task: String,
        attempt: u32,
        duration_ms: u64,
    },
    Retried {
        job_id: String,
        task: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Failed {
        job_id: String,
        task: String,
        attempts: u32,
        error: String,
    },
    Scheduled {
        entry: String,
        task: String,
        job_id: String,
    },
}

impl TaskEvent {
    /// Log this event.
    pub fn log(&self) {
        match self {
            TaskEvent::Submitted { job_id, task, queue } => {
                tracing::info!(job_id = %job_id, task = %task, queue = %queue, "Task submitted");
            }
            TaskEvent::Started { job_id, task, attempt, consumer } => {
                tracing::info!(
                    job_id = %job_id,
                    task = %task,
                    attempt = %attempt,
                    consumer = %consumer,
                    "Task started"
                );
            }
            TaskEvent::Succeeded { job_id, task, attempt, duration_ms } => {
                tracing::info!(
                    job_id = %job_id,
                    task = %task,
                    attempt = %attempt,
                    duration_ms = %duration_ms,
                    "Task succeeded"
                );
            }
            TaskEvent::Retried { job_id, task, attempt, delay_ms, error } => {
                tracing::warn!(
                    job_id = %job_id,
                    task = %task,
                    attempt = %attempt,
                    delay_ms = %delay_ms,
                    error = %error,
                    "Task retry scheduled"
                );
            }
            TaskEvent::Failed { job_id, task, attempts, error } => {
                tracing::error!(
                    job_id = %job_id,
                    task = %task,
                    attempts = %attempts,
                    error = %error,
                    "Task failed"
                );
            }
            TaskEvent::Scheduled { entry, task, job_id } => {
                tracing::info!(entry = %entry, task = %task, job_id = %job_id, "Periodic task sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_event_serializes_with_tag() {
        let event = TaskEvent::Failed {
            job_id: "j1".into(),
            task: "tts.generate".into(),
            attempts: 4,
            error: "boom".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "Failed");
        assert_eq!(value["attempts"], 4);
        event.log();
    }

    #[test]
    fn test_metric_helpers_without_recorder() {
        super::metrics::register_metrics();
        super::metrics::record_submitted("tts.generate", "tts");
        super::metrics::record_completed("tts.generate", 0.25);
        super::metrics::set_workers_busy("default", 2);
    }
}
