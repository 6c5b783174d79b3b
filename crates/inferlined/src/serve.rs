//! Serve mode: wires every subsystem together and runs until signalled.
//!
//! Shutdown order: stop accepting HTTP connections, drain the batching queue,
//! then stop the background loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use inferline_alerts::AlertEvaluator;
use inferline_api::ApiState;
use inferline_autoscale::{Autoscaler, ScalingPolicy};
use inferline_batch::{BatchSettings, BatchingQueue};
use inferline_cache::ResultCache;
use inferline_core::{ModelIdentity, ServeConfig, SnapshotSource};
use inferline_executor::{EchoModel, ModelBinding, SlotPool};
use inferline_metrics::MetricsAggregator;

use crate::sampler::ResourceSampler;

pub async fn run(config: ServeConfig) -> anyhow::Result<()> {
    let identity = ModelIdentity::new(&config.model.name, &config.model.version);
    info!(model = %identity.name, version = %identity.version, "inferline daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let pool = Arc::new(SlotPool::from_config(&config.executor).context("executor slot pool")?);

    let metrics = Arc::new(
        MetricsAggregator::new(config.metrics.window())
            .with_memory_budget(config.executor.memory_budget_bytes)
            .with_slots(pool.size()),
    );
    metrics.set_restart_count(u64::from(config.metrics.restart_count));

    let cache = Arc::new(ResultCache::new(config.cache.capacity, config.cache.ttl()));
    info!(
        capacity = config.cache.capacity,
        weigh_by = ?config.cache.weigh_by,
        "result cache initialized"
    );

    let model: Arc<dyn ModelBinding> = Arc::new(EchoModel::new(identity.clone()));

    let queue = BatchingQueue::start(
        BatchSettings::from_config(&config.batching, &config.cache),
        Arc::clone(&model),
        Arc::clone(&cache),
        Arc::clone(&pool),
        Arc::clone(&metrics),
    );
    info!(
        max_batch_size = config.batching.max_batch_size,
        max_queue_depth = config.batching.max_queue_depth,
        "batching queue started"
    );

    let mut autoscaler = Autoscaler::new(
        ScalingPolicy::from_config(&config.autoscaling),
        config.autoscaling.initial_replicas(),
    );
    let capacity = autoscaler.subscribe();

    let mut evaluator = AlertEvaluator::from_config(&config.alerts);
    let alerts = evaluator.subscribe();

    let sampler = ResourceSampler::new(
        Arc::clone(&metrics),
        Arc::clone(&model),
        Arc::clone(&cache),
        Arc::clone(&pool),
    );

    // ── Background loops ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let source: Arc<dyn SnapshotSource> = metrics.clone();

    let sample_interval = config.metrics.sample_interval();
    let sampler_shutdown = shutdown_rx.clone();
    let sampler_handle = tokio::spawn(async move {
        sampler.run(sample_interval, sampler_shutdown).await;
    });

    let autoscale_interval = config.autoscaling.interval();
    let autoscale_source = Arc::clone(&source);
    let autoscale_shutdown = shutdown_rx.clone();
    let autoscale_handle = tokio::spawn(async move {
        autoscaler
            .run(autoscale_source, autoscale_interval, autoscale_shutdown)
            .await;
    });

    let alerts_interval = config.alerts.interval();
    let alerts_shutdown = shutdown_rx;
    let alerts_handle = tokio::spawn(async move {
        evaluator
            .run(source, alerts_interval, alerts_shutdown)
            .await;
    });

    // ── API server ─────────────────────────────────────────────

    let router = inferline_api::build_router(ApiState {
        queue: Arc::clone(&queue),
        metrics,
        model: identity,
        capacity,
        alerts,
        started: Instant::now(),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.host))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── Drain and stop ─────────────────────────────────────────

    info!("draining batching queue");
    queue.shutdown().await;
    pool.close();

    let _ = shutdown_tx.send(true);
    for (name, handle) in [
        ("sampler", sampler_handle),
        ("autoscaler", autoscale_handle),
        ("alerts", alerts_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "background task failed");
        }
    }

    info!("inferline daemon stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
