//! Health checks for the job service.
//!
//! `/health` reports every component, `/health/ready` fails only when the
//! broker or result store is down, `/health/live` answers while the process
//! runs.

mod check;
mod checker;
mod routes;

pub use check::*;
pub use checker::*;
pub use routes::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs the registered checkers.
pub struct HealthService {
    environment: String,
    check_timeout: Duration,
    checkers: Vec<Arc<dyn HealthChecker>>,
    started_at: Instant,
}

impl HealthService {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            check_timeout: Duration::from_secs(5),
            checkers: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn register_checker(&mut self, checker: Arc<dyn HealthChecker>) {
        self.checkers.push(checker);
    }

    /// Run all checks concurrently.
    pub async fn check_health(&self) -> HealthReport {
        let timeout = self.check_timeout;
        let checks = self
            .checkers
            .iter()
            .map(|checker| async move { checker.check_with_timeout(timeout).await });
        let components = futures::future::join_all(checks).await;

        HealthReport::new(self.environment.clone())
            .with_uptime(self.started_at.elapsed())
            .with_components(components)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
