//! Health checkers for the broker, the result store and the worker pools.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::check::{ComponentHealth, HealthStatus};
use crate::jobs::{DurableQueue, ResultStore, WorkerStats};

/// Trait for health checkers.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// The component name.
    fn name(&self) -> &str;

    async fn check(&self) -> ComponentHealth;

    /// Check with a deadline; a check that overruns is unhealthy.
    async fn check_with_timeout(&self, timeout: Duration) -> ComponentHealth {
        let start = Instant::now();
        match tokio::time::timeout(timeout, self.check()).await {
            Ok(health) => health,
            Err(_) => ComponentHealth::unhealthy(self.name())
                .with_error(format!("Health check timed out after {:?}", timeout))
                .with_latency(start.elapsed()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Broker
// ═══════════════════════════════════════════════════════════════════════════════

/// Pings the broker and reports queue depths.
pub struct BrokerHealthChecker {
    broker: Arc<dyn DurableQueue>,
    queues: Vec<String>,
}

impl BrokerHealthChecker {
    pub fn new(broker: Arc<dyn DurableQueue>, queues: Vec<String>) -> Self {
        Self { broker, queues }
    }
}

#[async_trait]
impl HealthChecker for BrokerHealthChecker {
    fn name(&self) -> &str {
        "broker"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        if let Err(e) = self.broker.ping().await {
            tracing::warn!(error = %e, "Broker health check failed");
            return ComponentHealth::unhealthy(self.name())
                .with_error(e.to_string())
                .with_latency(start.elapsed());
        }

        let mut depths = serde_json::Map::new();
        for queue in &self.queues {
            if let Ok(depth) = self.broker.depth(queue).await {
                depths.insert(queue.clone(), serde_json::json!(depth));
            }
        }

        ComponentHealth::healthy(self.name())
            .with_latency(start.elapsed())
            .with_metadata("backend", self.broker.name())
            .with_metadata("queue_depths", depths)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Result Store
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ResultStoreHealthChecker {
    store: Arc<dyn ResultStore>,
}

impl ResultStoreHealthChecker {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthChecker for ResultStoreHealthChecker {
    fn name(&self) -> &str {
        "result_store"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        let result = self.store.ping().await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Result store health check failed");
        }
        ComponentHealth::from_result(self.name(), result, start.elapsed())
            .with_metadata("backend", self.store.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pools
// ═══════════════════════════════════════════════════════════════════════════════

/// Degraded while any pool is backing off from infrastructure errors.
pub struct WorkerHealthChecker {
    pools: Vec<(String, WorkerStats)>,
}

impl WorkerHealthChecker {
    pub fn new(pools: Vec<(String, WorkerStats)>) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl HealthChecker for WorkerHealthChecker {
    fn name(&self) -> &str {
        "workers"
    }

    async fn check(&self) -> ComponentHealth {
        if self.pools.is_empty() {
            return ComponentHealth::healthy(self.name()).with_message("No worker pools in this process");
        }

        let mut health = ComponentHealth::healthy(self.name());
        let mut degraded = Vec::new();
        for (name, stats) in &self.pools {
            let snapshot = stats.snapshot();
            if snapshot.degraded {
                degraded.push(name.clone());
            }
            health = health.with_metadata(name.clone(), snapshot);
        }

        if degraded.is_empty() {
            health
        } else {
            health
                .with_status(HealthStatus::Degraded)
                .with_message(format!("Backing off after infrastructure errors: {}", degraded.join(", ")))
        }
    }
}
