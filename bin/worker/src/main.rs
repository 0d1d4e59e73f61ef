//! Camshaft worker daemon.
//!
//! Connects the Redis-backed store, builds an engine and a worker, and
//! drains cleanly on SIGINT/SIGTERM. Step executors (shell, approval,
//! plugin) and the artifact filesystem driver are provided by the
//! deployment; a daemon started without them can still coordinate runs and
//! execute sub-workflows.

mod config;

use camshaft_engine::artifacts::MemoryArtifactStore;
use camshaft_engine::executor::{ExecutorRegistry, NoSecrets};
use camshaft_engine::registry::StaticRegistry;
use camshaft_engine::{Engine, create_workflow_worker};
use camshaft_store::RedisStore;
use config::DaemonConfig;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DaemonConfig::from_env().expect("failed to load configuration");
    tracing::info!(redis_url = %config.redis_url, "loaded configuration");

    let backend = RedisStore::connect(&config.redis_url)
        .await
        .expect("failed to connect to redis");
    let engine = Engine::new(Arc::new(backend), config.engine_config());

    // Executors are deployment-provided; without them every builtin/plugin
    // step fails with UNSUPPORTED_STEP, which is the honest answer for a
    // coordination-only node.
    let executors = ExecutorRegistry::new();
    tracing::warn!("no step executors registered; this worker only coordinates and runs sub-workflows");

    let runner = engine.runner(
        executors,
        Arc::new(MemoryArtifactStore::new()),
        Some(Arc::new(StaticRegistry::new())),
        Arc::new(NoSecrets),
        config.runner_config(),
    );
    let worker = create_workflow_worker(config.worker_options(), runner);
    worker.start();
    tracing::info!(worker_id = %worker.id(), "worker started");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");

    worker.dispose().await;
    engine.shutdown().await;

    let metrics = worker.metrics();
    tracing::info!(
        dispatched = metrics.dispatched,
        completed = metrics.completed,
        retried = metrics.retried,
        aborted = metrics.aborted,
        lease_conflicts = metrics.lease_conflicts,
        "worker drained"
    );
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.expect("failed to listen for ctrl-c");
        }
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl-c");
}
