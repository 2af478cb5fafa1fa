// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cloudlb::cloud::{CloudBackend, MemoryCloud, RateLimiter, ThrottledBackend};
use cloudlb::config::Config;
use cloudlb::instances::InstanceCache;
use cloudlb::controllers::{Backoff, Context, ServiceController};
use cloudlb::kubernetes::{ExposureStore, KubeExposureStore, NodeWatch, TrackedServices};
use cloudlb::reconcilers::ServiceReconciler;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting cloudlb controller");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Configuration loaded: cluster={}, region={}, backend={}, workers={}",
        config.cluster_name, config.region, config.cloud_backend, config.workers
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();

    // Every cloud call goes through the shared limiter and per-call timeout
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_qps,
        config.rate_limit_burst,
        config.rate_limit_max_wait,
    ));
    let backend: Arc<dyn CloudBackend> = Arc::new(ThrottledBackend::new(
        Arc::new(MemoryCloud::new(config.region.clone())),
        limiter,
        config.call_timeout,
        abort.clone(),
    ));

    let instances = InstanceCache::new(backend.clone(), config.instance_cache_ttl);
    let store: Arc<dyn ExposureStore> = Arc::new(KubeExposureStore::new(client.clone()));

    let reconciler = Arc::new(ServiceReconciler::new(
        backend,
        store,
        instances.clone(),
        config.clone(),
    ));
    let context = Arc::new(Context::new(
        reconciler,
        TrackedServices::default(),
        Backoff::new(config.backoff_base, config.backoff_max),
    ));
    let (node_watch, node_changes) = NodeWatch::new(instances);
    let controller = ServiceController::new(client.clone(), context, &config, abort);

    tokio::spawn(wait_for_signal(shutdown.clone()));

    info!("Starting controller and node watch...");
    tokio::try_join!(
        controller.run(node_changes, shutdown.clone()),
        node_watch.run(client, shutdown.clone()),
    )?;

    info!("Controller stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}
