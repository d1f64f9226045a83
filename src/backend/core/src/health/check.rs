//! Health status types.
//!
//! - **Healthy**: component fully operational
//! - **Degraded**: operational but failing intermittently (e.g. workers backing off)
//! - **Unhealthy**: not operational

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Service name reported by health endpoints.
pub const SERVICE_NAME: &str = "visionary-workers";

// ═══════════════════════════════════════════════════════════════════════════════
// Health Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Health status of a component or of the whole service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// The worse of the two.
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }

    pub fn to_http_status(&self) -> u16 {
        match self {
            Self::Healthy | Self::Degraded => 200,
            Self::Unhealthy => 503,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Component Health
// ═══════════════════════════════════════════════════════════════════════════════

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn with_initial_status(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            message: None,
            latency_ms: None,
            checked_at: Utc::now(),
            metadata: HashMap::new(),
            error: None,
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_initial_status(name, HealthStatus::Healthy)
    }

    pub fn degraded(name: impl Into<String>) -> Self {
        Self::with_initial_status(name, HealthStatus::Degraded)
    }

    pub fn unhealthy(name: impl Into<String>) -> Self {
        Self::with_initial_status(name, HealthStatus::Unhealthy)
    }

    /// Healthy on `Ok`, unhealthy with the error text on `Err`.
    pub fn from_result<E: std::fmt::Display>(
        name: impl Into<String>,
        result: Result<(), E>,
        latency: Duration,
    ) -> Self {
        match result {
            Ok(()) => Self::healthy(name).with_latency(latency),
            Err(e) => Self::unhealthy(name)
                .with_error(e.to_string())
                .with_latency(latency),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }

    /// Sets the status to unhealthy.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.status = HealthStatus::Unhealthy;
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    pub fn with_status(mut self, status: HealthStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health Report
// ═══════════════════════════════════════════════════════════════════════════════

/// Aggregated health of the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub environment: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentHealth>,
    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: environment.into(),
            timestamp: Utc::now(),
            uptime_secs: None,
            components: Vec::new(),
            summary: HealthSummary::default(),
        }
    }

    pub fn with_components(mut self, components: Vec<ComponentHealth>) -> Self {
        for component in components {
            self.status = self.status.combine(component.status);
            self.components.push(component);
        }
        self.update_summary();
        self
    }

    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime_secs = Some(uptime.as_secs());
        self
    }

    pub fn is_operational(&self) -> bool {
        self.status.is_operational()
    }

    pub fn get_component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }

    fn update_summary(&mut self) {
        let mut summary = HealthSummary {
            total: self.components.len(),
            ..HealthSummary::default()
        };
        for component in &self.components {
            match component.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
            }
        }
        self.summary = summary;
    }
}

/// Summary counts for a health report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Readiness and Liveness
// ═══════════════════════════════════════════════════════════════════════════════

/// Liveness probe response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub service: String,
    pub timestamp: DateTime<Utc>,
}

impl LivenessResponse {
    pub fn alive() -> Self {
        Self {
            alive: true,
            service: SERVICE_NAME.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Readiness probe response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unready_components: Vec<String>,
}

impl ReadinessResponse {
    /// Ready while every component is at least degraded.
    pub fn from_health_report(report: &HealthReport) -> Self {
        let unready: Vec<String> = report
            .components
            .iter()
            .filter(|c| !c.status.is_operational())
            .map(|c| c.name.clone())
            .collect();

        Self {
            ready: unready.is_empty(),
            service: report.service.clone(),
            timestamp: Utc::now(),
            reason: (!unready.is_empty()).then(|| "One or more components are unhealthy".to_string()),
            unready_components: unready,
        }
    }
}
