//! Periodic job scheduling (the beat).
//!
//! Every tick the beat submits one job for each entry whose period has
//! elapsed since it last fired. Ticks that were missed while the process was
//! busy or suspended are not backfilled; the next tick fires once.
//!
//! Only one beat may be active against a broker. Each tick first takes or
//! renews a broker lease and does nothing when another holder owns it. Firing
//! times are recorded in the broker, so a beat taking over the lease carries
//! on from where the previous holder stopped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::engine::JobEngine;
use super::job::JobId;
use crate::error::{Result, VisionaryError};
use crate::observability::{metrics, TaskEvent};

/// Name of the broker lease guarding the beat.
pub const BEAT_LEASE: &str = "beat";

/// A configured periodic entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Unique entry name
    pub name: String,
    /// Task type submitted on each firing
    pub task: String,
    /// Seconds between firings
    pub period_secs: u64,
    /// Payload of every submitted job
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
}

fn empty_payload() -> serde_json::Value {
    serde_json::json!({})
}

impl ScheduleSpec {
    pub fn new(name: impl Into<String>, task: impl Into<String>, period_secs: u64) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            period_secs,
            payload: empty_payload(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// The period as a calendar duration, `None` when it is out of range.
    pub fn interval(&self) -> Option<chrono::Duration> {
        i64::try_from(self.period_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }
}

/// An entry with its firing state.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub spec: ScheduleSpec,
    pub last_fired_at: DateTime<Utc>,
}

impl ScheduleEntry {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.spec
            .interval()
            .is_some_and(|period| now.signed_duration_since(self.last_fired_at) >= period)
    }
}

/// Runtime settings of a started beat.
#[derive(Debug, Clone)]
pub struct BeatSettings {
    pub tick: Duration,
    /// Lease holder identity, unique per process
    pub holder: String,
}

impl BeatSettings {
    pub fn new(tick: Duration, node_name: &str) -> Self {
        Self {
            tick,
            holder: format!("{}:{}", node_name, uuid::Uuid::new_v4()),
        }
    }

    /// Leases outlive a few missed ticks before another beat may take over.
    fn lease_ttl(&self) -> Duration {
        (self.tick * 3).max(Duration::from_secs(5))
    }
}

/// The periodic trigger.
pub struct Beat {
    engine: JobEngine,
    entries: Vec<ScheduleEntry>,
}

impl Beat {
    /// Validate `specs` against the engine's registry.
    ///
    /// Every entry starts its first period at `now`.
    pub fn new(engine: JobEngine, specs: Vec<ScheduleSpec>, now: DateTime<Utc>) -> Result<Self> {
        let mut names = HashSet::new();
        for spec in &specs {
            if spec.period_secs == 0 {
                return Err(VisionaryError::invalid_schedule(&spec.name, "period must be positive"));
            }
            if spec.interval().is_none() {
                return Err(VisionaryError::invalid_schedule(&spec.name, "period is out of range"));
            }
            if !engine.registry().contains(&spec.task) {
                return Err(VisionaryError::invalid_schedule(
                    &spec.name,
                    format!("task type {} is not registered", spec.task),
                ));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(VisionaryError::invalid_schedule(&spec.name, "entry name is used twice"));
            }
        }

        let entries = specs
            .into_iter()
            .map(|spec| ScheduleEntry {
                spec,
                last_fired_at: now,
            })
            .collect();
        Ok(Self { engine, entries })
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Take over the firing times recorded by earlier lease holders.
    ///
    /// Entries with no recorded firing keep their current start.
    pub async fn restore(&mut self) {
        for entry in &mut self.entries {
            match self.engine.broker().last_fired(&entry.spec.name).await {
                Ok(Some(at)) => entry.last_fired_at = at,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(entry = %entry.spec.name, error = %e, "Could not read last firing time");
                }
            }
        }
    }

    /// Submit every due entry. Returns the ids of the submitted jobs.
    ///
    /// An entry whose submission fails keeps its `last_fired_at` and is
    /// attempted again on the next tick.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut submitted = Vec::new();
        for entry in self.entries.iter_mut().filter(|e| e.is_due(now)) {
            match self
                .engine
                .submit(&entry.spec.task, entry.spec.payload.clone())
                .await
            {
                Ok(job_id) => {
                    entry.last_fired_at = now;
                    if let Err(e) = self.engine.broker().record_fired(&entry.spec.name, now).await {
                        tracing::warn!(entry = %entry.spec.name, error = %e, "Could not record firing time");
                    }
                    metrics::record_beat_fired(&entry.spec.name);
                    TaskEvent::Scheduled {
                        entry: entry.spec.name.clone(),
                        task: entry.spec.task.clone(),
                        job_id: job_id.to_string(),
                    }
                    .log();
                    submitted.push(job_id);
                }
                Err(e) => {
                    tracing::warn!(
                        entry = %entry.spec.name,
                        task = %entry.spec.task,
                        error = %e,
                        "Periodic submission failed, will retry next tick"
                    );
                }
            }
        }
        submitted
    }

    /// Run the beat on its own task.
    pub fn start(mut self, settings: BeatSettings) -> BeatHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(settings.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut leader = false;

            tracing::info!(
                holder = %settings.holder,
                entries = self.entries.len(),
                tick_ms = settings.tick.as_millis() as u64,
                "Beat started"
            );

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let granted = self
                            .engine
                            .broker()
                            .acquire_lease(BEAT_LEASE, &settings.holder, settings.lease_ttl())
                            .await;
                        match granted {
                            Ok(true) => {
                                if !leader {
                                    tracing::info!(holder = %settings.holder, "Beat lease acquired");
                                    leader = true;
                                    self.restore().await;
                                }
                                self.tick(Utc::now()).await;
                            }
                            Ok(false) => {
                                if leader {
                                    tracing::warn!(holder = %settings.holder, "Beat lease lost");
                                    leader = false;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Beat lease check failed, skipping tick");
                            }
                        }
                    }
                }
            }

            tracing::info!(holder = %settings.holder, "Beat stopped");
        });

        BeatHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle for a started beat.
pub struct BeatHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BeatHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Beat task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_deserializes_without_payload() {
        let spec: ScheduleSpec = serde_json::from_value(serde_json::json!({
            "name": "health-check",
            "task": "system.health_check",
            "period_secs": 300
        }))
        .unwrap();
        assert_eq!(spec, ScheduleSpec::new("health-check", "system.health_check", 300));
        assert_eq!(spec.period(), Duration::from_secs(300));
    }

    #[test]
    fn test_entry_due_at_period_boundary() {
        let start = Utc::now();
        let entry = ScheduleEntry {
            spec: ScheduleSpec::new("health-check", "system.health_check", 300),
            last_fired_at: start,
        };
        assert!(!entry.is_due(start + chrono::Duration::seconds(299)));
        assert!(entry.is_due(start + chrono::Duration::seconds(300)));
    }

    #[test]
    fn test_out_of_range_period_is_never_due() {
        let start = Utc::now();
        for period in [u64::MAX, 1 << 60] {
            let entry = ScheduleEntry {
                spec: ScheduleSpec::new("huge", "system.health_check", period),
                last_fired_at: start,
            };
            assert!(entry.spec.interval().is_none());
            assert!(!entry.is_due(start + chrono::Duration::days(365)));
        }
    }

    #[test]
    fn test_lease_ttl_floor() {
        let settings = BeatSettings::new(Duration::from_millis(100), "node");
        assert_eq!(settings.lease_ttl(), Duration::from_secs(5));
        assert!(settings.holder.starts_with("node:"));
    }
}
