//! Configuration management.
//!
//! Configuration is read once at startup from an optional TOML file and from
//! `VISIONARY__`-prefixed environment variables (`__` separates nested keys,
//! e.g. `VISIONARY__TASKS__MAX_RETRIES=5`). Every field has a default so an
//! empty environment yields a runnable development setup.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{Result, VisionaryError};
use crate::jobs::beat::ScheduleSpec;
use crate::jobs::registry::TaskPolicy;
use crate::jobs::router::RoutingRule;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "VISIONARY_CONFIG";

const ENV_PREFIX: &str = "VISIONARY";
const DEFAULT_CONFIG_FILE: &str = "config/visionary";

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Deployment environment tag (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Job broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Result backend configuration
    #[serde(default)]
    pub result_backend: ResultBackendConfig,

    /// Default task execution policy
    #[serde(default)]
    pub tasks: TaskDefaults,

    /// Queue routing rules
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Worker pools
    #[serde(default = "default_worker_pools")]
    pub workers: Vec<WorkerPoolConfig>,

    /// Seconds a pool waits for in-flight jobs on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Periodic scheduler
    #[serde(default)]
    pub beat: BeatConfig,

    /// Failure event reporting
    #[serde(default)]
    pub events: EventSinkConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Which storage engine backs the broker or the result store.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Broker connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for every broker key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Sleep between sweeps when several queues are consumed at once
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Identifies this process in consumer tags and the beat lease
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Consumers silent for this long have their unacked jobs requeued
    #[serde(default = "default_consumer_ttl")]
    pub consumer_ttl_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            poll_interval_ms: default_poll_interval(),
            node_name: default_node_name(),
            consumer_ttl_secs: default_consumer_ttl(),
        }
    }
}

impl BrokerConfig {
    pub fn consumer_ttl(&self) -> Duration {
        Duration::from_secs(self.consumer_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultBackendConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Result backend connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for ResultBackendConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Process-wide defaults applied to every task that does not override them.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDefaults {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_soft_timeout")]
    pub soft_timeout_secs: u64,

    #[serde(default = "default_hard_timeout")]
    pub hard_timeout_secs: u64,

    /// Lifetime of job results in the result store
    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: u64,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            soft_timeout_secs: default_soft_timeout(),
            hard_timeout_secs: default_hard_timeout(),
            result_ttl_secs: default_result_ttl(),
        }
    }
}

impl TaskDefaults {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    /// The policy a task gets when registered without its own.
    pub fn policy(&self) -> TaskPolicy {
        TaskPolicy {
            queue: None,
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            soft_timeout: Duration::from_secs(self.soft_timeout_secs),
            hard_timeout: Duration::from_secs(self.hard_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Queue used when no rule matches
    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// Ordered rules, first match wins
    #[serde(default = "default_routing_rules")]
    pub rules: Vec<RoutingRule>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_queue: default_queue(),
            rules: default_routing_rules(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerPoolConfig {
    pub name: String,

    /// Queues this pool consumes; empty means every routed queue
    #[serde(default)]
    pub queues: Vec<String>,

    /// Number of execution contexts
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tick cadence
    #[serde(default = "default_beat_tick")]
    pub tick_ms: u64,

    #[serde(default = "default_beat_entries")]
    pub entries: Vec<ScheduleSpec>,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_ms: default_beat_tick(),
            entries: default_beat_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventSinkConfig {
    /// Webhook receiving failure events; events are only logged when unset
    pub webhook_url: Option<String>,

    #[serde(default = "default_event_timeout")]
    pub timeout_ms: u64,

    /// Service tag attached to every event
    #[serde(default = "default_service_name")]
    pub service: String,
}

impl Default for EventSinkConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: default_event_timeout(),
            service: default_service_name(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    /// Filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Install the Prometheus recorder and serve /metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_enabled: true,
        }
    }
}

// Default value functions
fn default_environment() -> String { "development".to_string() }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_redis_url() -> String { "redis://redis:6379/0".to_string() }
fn default_key_prefix() -> String { "visionary".to_string() }
fn default_poll_interval() -> u64 { 500 }
fn default_consumer_ttl() -> u64 { 30 }
fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "visionary".to_string())
}
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay() -> u64 { 60 }
fn default_soft_timeout() -> u64 { 300 }
fn default_hard_timeout() -> u64 { 600 }
fn default_result_ttl() -> u64 { 3600 }
fn default_queue() -> String { "default".to_string() }
fn default_concurrency() -> usize { 4 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_beat_tick() -> u64 { 1000 }
fn default_event_timeout() -> u64 { 5000 }
fn default_service_name() -> String { "visionary-workers".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

fn default_routing_rules() -> Vec<RoutingRule> {
    ["tts", "knowledge", "media", "study"]
        .into_iter()
        .map(|queue| RoutingRule::new(format!("{}.*", queue), queue))
        .collect()
}

fn default_worker_pools() -> Vec<WorkerPoolConfig> {
    vec![WorkerPoolConfig {
        name: "default".to_string(),
        queues: Vec::new(),
        concurrency: default_concurrency(),
    }]
}

fn default_beat_entries() -> Vec<ScheduleSpec> {
    vec![
        ScheduleSpec::new("cleanup-expired-cache", "tts.cleanup_expired_cache", 3600),
        ScheduleSpec::new("health-check", "system.health_check", 300),
        ScheduleSpec::new("update-statistics", "knowledge.update_statistics", 86400),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            server: ServerConfig::default(),
            broker: BrokerConfig::default(),
            result_backend: ResultBackendConfig::default(),
            tasks: TaskDefaults::default(),
            routing: RoutingConfig::default(),
            workers: default_worker_pools(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            beat: BeatConfig::default(),
            events: EventSinkConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the environment and the optional config file.
    ///
    /// The file named by `VISIONARY_CONFIG` is required when the variable is set;
    /// otherwise `config/visionary.toml` is read if present.
    pub fn load() -> Result<Self> {
        let file = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => config::File::with_name(&path).required(true),
            Err(_) => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.soft_timeout_secs > self.tasks.hard_timeout_secs {
            return Err(VisionaryError::configuration(format!(
                "tasks.soft_timeout_secs ({}) exceeds tasks.hard_timeout_secs ({})",
                self.tasks.soft_timeout_secs, self.tasks.hard_timeout_secs
            )));
        }
        if self.routing.default_queue.trim().is_empty() {
            return Err(VisionaryError::configuration("routing.default_queue is empty"));
        }
        if self.workers.is_empty() {
            return Err(VisionaryError::configuration("at least one worker pool is required"));
        }
        for pool in &self.workers {
            if pool.concurrency == 0 {
                return Err(VisionaryError::configuration(format!(
                    "worker pool {} has zero concurrency",
                    pool.name
                )));
            }
            if pool.queues.iter().any(|q| q.trim().is_empty()) {
                return Err(VisionaryError::configuration(format!(
                    "worker pool {} names an empty queue",
                    pool.name
                )));
            }
        }
        if self.broker.consumer_ttl_secs == 0 {
            return Err(VisionaryError::configuration("broker.consumer_ttl_secs must be positive"));
        }
        if self.beat.tick_ms == 0 {
            return Err(VisionaryError::configuration("beat.tick_ms must be positive"));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
