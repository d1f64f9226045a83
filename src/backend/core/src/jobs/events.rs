//! Event sink for operational failure reporting.
//!
//! `emit` never blocks and never fails from the caller's point of view. Sinks
//! that talk to the network do so on a spawned task and only log locally when
//! delivery fails.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorCode, VisionaryError};

/// Structured context attached to an event.
pub type EventContext = serde_json::Map<String, serde_json::Value>;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Tags attached to every event a sink emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTags {
    pub environment: String,
    pub service: String,
}

impl Default for EventTags {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            service: "visionary-workers".to_string(),
        }
    }
}

/// One reported event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkEvent {
    pub severity: Severity,
    pub message: String,
    pub context: EventContext,
    pub environment: String,
    pub service: String,
    pub timestamp: DateTime<Utc>,
}

impl SinkEvent {
    pub fn new(tags: &EventTags, severity: Severity, message: String, context: EventContext) -> Self {
        Self {
            severity,
            message,
            context,
            environment: tags.environment.clone(),
            service: tags.service.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Receiver of failure and error events.
pub trait EventSink: Send + Sync {
    /// Fire-and-forget.
    fn emit(&self, severity: Severity, message: String, context: EventContext);
}

fn log_locally(event: &SinkEvent) {
    let context = serde_json::Value::Object(event.context.clone());
    match event.severity {
        Severity::Error | Severity::Fatal => tracing::error!(
            severity = %event.severity,
            environment = %event.environment,
            service = %event.service,
            context = %context,
            "{}",
            event.message
        ),
        Severity::Warning => tracing::warn!(
            severity = %event.severity,
            environment = %event.environment,
            context = %context,
            "{}",
            event.message
        ),
        Severity::Info | Severity::Debug => tracing::info!(
            severity = %event.severity,
            environment = %event.environment,
            context = %context,
            "{}",
            event.message
        ),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tracing sink
// ═══════════════════════════════════════════════════════════════════════════════

/// Writes events to the process log only.
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink {
    tags: EventTags,
}

impl TracingEventSink {
    pub fn new(tags: EventTags) -> Self {
        Self { tags }
    }
}

impl EventSink for TracingEventSink {
    fn emit(&self, severity: Severity, message: String, context: EventContext) {
        log_locally(&SinkEvent::new(&self.tags, severity, message, context));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Webhook sink
// ═══════════════════════════════════════════════════════════════════════════════

/// POSTs each event as JSON to a webhook, and logs it locally too.
#[derive(Debug, Clone)]
pub struct WebhookEventSink {
    client: reqwest::Client,
    url: String,
    tags: EventTags,
}

impl WebhookEventSink {
    pub fn new(url: impl Into<String>, timeout: Duration, tags: EventTags) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            tags,
        })
    }
}

impl EventSink for WebhookEventSink {
    fn emit(&self, severity: Severity, message: String, context: EventContext) {
        let event = SinkEvent::new(&self.tags, severity, message, context);
        log_locally(&event);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime available, event not delivered to webhook");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        runtime.spawn(async move {
            let outcome = client
                .post(&url)
                .json(&event)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            if let Err(e) = outcome {
                VisionaryError::with_internal(ErrorCode::EventSinkError, "Failed to deliver event to webhook", e.to_string())
                    .with_context("url", &url)
                    .log();
            }
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Memory sink
// ═══════════════════════════════════════════════════════════════════════════════

/// Keeps events in memory; used by tests and by embedders that poll.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    tags: EventTags,
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, severity: Severity, message: String, context: EventContext) {
        self.events
            .lock()
            .push(SinkEvent::new(&self.tags, severity, message, context));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context() -> EventContext {
        let mut ctx = EventContext::new();
        ctx.insert("task_id".into(), serde_json::json!("abc"));
        ctx.insert("retries".into(), serde_json::json!(3));
        ctx
    }

    #[test]
    fn test_memory_sink_records_tags() {
        let sink = MemoryEventSink::new();
        sink.emit(Severity::Error, "Task abc failed after all retries".into(), context());

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].service, "visionary-workers");
        assert_eq!(events[0].severity, Severity::Error);
        assert_eq!(events[0].context["retries"], 3);
    }

    #[test]
    fn test_webhook_sink_without_runtime_does_not_panic() {
        let sink = WebhookEventSink::new("http://127.0.0.1:9", Duration::from_millis(50), EventTags::default()).unwrap();
        sink.emit(Severity::Error, "dropped".into(), EventContext::new());
    }

    #[tokio::test]
    async fn test_webhook_sink_posts_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(body_partial_json(serde_json::json!({
                "severity": "error",
                "environment": "production",
                "service": "visionary-workers",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let tags = EventTags {
            environment: "production".into(),
            service: "visionary-workers".into(),
        };
        let sink = WebhookEventSink::new(format!("{}/events", server.uri()), Duration::from_secs(2), tags).unwrap();
        sink.emit(Severity::Error, "Task abc failed after all retries".into(), context());

        for _ in 0..50 {
            if !server.received_requests().await.unwrap_or_default().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        server.verify().await;
    }

    #[tokio::test]
    async fn test_webhook_sink_swallows_delivery_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = WebhookEventSink::new(server.uri(), Duration::from_secs(1), EventTags::default()).unwrap();
        sink.emit(Severity::Fatal, "boom".into(), EventContext::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
