//! Visionary Server - Main entry point
//!
//! Runs the HTTP API, the configured worker pools and the beat in one process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use visionary_core::{
    api::{self, AppState},
    config::{BackendKind, Config},
    health::{BrokerHealthChecker, HealthService, ResultStoreHealthChecker, WorkerHealthChecker},
    jobs::{
        register_builtin_tasks, Beat, BeatSettings, DurableQueue, EventSink, EventTags, InMemoryBroker,
        InMemoryResultStore, JobEngine, QueueRouter, RedisBroker, RedisResultStore, ResultStore,
        TaskRegistryBuilder, TracingEventSink, WebhookEventSink, WorkerConfig, WorkerPool,
    },
    observability::{self, metrics},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::load()?;

    observability::init("visionary-server", &config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        "Starting Visionary Server"
    );

    let metrics_handle = if config.observability.metrics_enabled {
        Some(metrics::install()?)
    } else {
        None
    };

    let engine = build_engine(&config)?;
    tracing::info!(
        tasks = engine.registry().len(),
        queues = ?engine.queues(),
        "Job engine initialized"
    );

    // Worker pools
    let node_name = config.broker.node_name.clone();
    let mut workers = Vec::with_capacity(config.workers.len());
    for pool in &config.workers {
        let worker_config = WorkerConfig::from_pool(pool, node_name.clone(), config.shutdown_timeout())
            .with_consumer_ttl(config.broker.consumer_ttl());
        let handle = WorkerPool::new(engine.clone(), worker_config).start()?;
        workers.push(handle);
    }
    let worker_checker = Arc::new(WorkerHealthChecker::new(
        workers
            .iter()
            .map(|h| (h.name().to_string(), h.stats().clone()))
            .collect(),
    ));

    // Beat
    let beat = if config.beat.enabled {
        let beat = Beat::new(engine.clone(), config.beat.entries.clone(), Utc::now())?;
        let settings = BeatSettings::new(Duration::from_millis(config.beat.tick_ms), &node_name);
        Some(beat.start(settings))
    } else {
        tracing::info!("Beat disabled");
        None
    };

    // Health
    let mut health = HealthService::new(config.environment.clone());
    health.register_checker(Arc::new(BrokerHealthChecker::new(
        engine.broker().clone(),
        engine.queues(),
    )));
    health.register_checker(Arc::new(ResultStoreHealthChecker::new(engine.results().clone())));
    health.register_checker(worker_checker.clone());

    let app_state = AppState {
        engine,
        health: Arc::new(health),
        workers: worker_checker,
        environment: Arc::from(config.environment.as_str()),
        metrics: metrics_handle,
    };

    let app = api::build_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    if let Some(beat) = beat {
        beat.stop().await;
    }
    for handle in workers {
        handle.stop().await;
    }

    tracing::info!("Server shutdown complete");
    observability::shutdown();

    Ok(())
}

/// Wire registry, router and backends from configuration.
fn build_engine(config: &Config) -> anyhow::Result<JobEngine> {
    let broker: Arc<dyn DurableQueue> = match config.broker.backend {
        BackendKind::Redis => Arc::new(RedisBroker::new(
            &config.broker.url,
            config.broker.key_prefix.clone(),
            Duration::from_millis(config.broker.poll_interval_ms),
        )?),
        BackendKind::Memory => Arc::new(InMemoryBroker::new()),
    };

    let results: Arc<dyn ResultStore> = match config.result_backend.backend {
        BackendKind::Redis => Arc::new(RedisResultStore::new(
            &config.result_backend.url,
            config.result_backend.key_prefix.clone(),
        )?),
        BackendKind::Memory => Arc::new(InMemoryResultStore::new()),
    };

    let tags = EventTags {
        environment: config.environment.clone(),
        service: config.events.service.clone(),
    };
    let events: Arc<dyn EventSink> = match &config.events.webhook_url {
        Some(url) => Arc::new(WebhookEventSink::new(
            url.clone(),
            Duration::from_millis(config.events.timeout_ms),
            tags,
        )?),
        None => Arc::new(TracingEventSink::new(tags)),
    };

    let mut builder = TaskRegistryBuilder::new(config.tasks.policy());
    register_builtin_tasks(&mut builder)?;

    let router = QueueRouter::new(&config.routing.rules, config.routing.default_queue.clone())?;

    Ok(JobEngine::new(
        builder.build(),
        router,
        broker,
        results,
        events,
        config.tasks.result_ttl(),
    ))
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
