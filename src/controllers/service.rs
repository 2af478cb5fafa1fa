// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Service controller: runs a [`ServiceReconciler`] pass for every LoadBalancer Service.
//!
//! kube-runtime's `Controller` provides deduplication and per-Service exclusivity. The
//! requeue delays come from our own [`Backoff`], tracked per Service.

use crate::config::Config;
use crate::controllers::backoff::Backoff;
use crate::error::{ControllerError, Result};
use crate::kubernetes::store::is_managed;
use crate::kubernetes::watch::{resync_ticks, NodeChanges, TrackedServices};
use crate::reconcilers::{PassOutcome, ServiceReconciler};
use crate::types::ReconciliationKey;
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::{
    runtime::{controller, controller::Action, Controller},
    Api, Client,
};
use kube_runtime::watcher::Config as WatcherConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Shared state handed to every reconcile call
pub struct Context {
    reconciler: Arc<ServiceReconciler>,
    tracked: TrackedServices,
    backoff: Backoff,
    /// Consecutive retryable failures per Service
    failures: Mutex<HashMap<ReconciliationKey, u32>>,
}

impl Context {
    pub fn new(reconciler: Arc<ServiceReconciler>, tracked: TrackedServices, backoff: Backoff) -> Self {
        Self {
            reconciler,
            tracked,
            backoff,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn failure_counts(&self) -> MutexGuard<'_, HashMap<ReconciliationKey, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one more failure and return the new count
    fn record_failure(&self, key: &ReconciliationKey) -> u32 {
        let mut failures = self.failure_counts();
        let count = failures.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn forget(&self, key: &ReconciliationKey) {
        self.failure_counts().remove(key);
    }

    pub fn failures(&self, key: &ReconciliationKey) -> u32 {
        self.failure_counts().get(key).copied().unwrap_or(0)
    }
}

pub struct ServiceController {
    client: Client,
    context: Arc<Context>,
    workers: u16,
    resync_interval: Duration,
    shutdown_grace: Duration,
    /// Cancels in-flight cloud calls once the grace period is over
    abort: CancellationToken,
}

impl ServiceController {
    pub fn new(client: Client, context: Arc<Context>, config: &Config, abort: CancellationToken) -> Self {
        Self {
            client,
            context,
            workers: u16::try_from(config.workers).unwrap_or(u16::MAX).max(1),
            resync_interval: config.resync_interval,
            shutdown_grace: config.shutdown_grace,
            abort,
        }
    }

    /// Run until `shutdown` fires and in-flight passes have drained
    pub async fn run(self, node_changes: NodeChanges, shutdown: CancellationToken) -> Result<()> {
        let services: Api<Service> = Api::all(self.client.clone());
        let slices: Api<EndpointSlice> = Api::all(self.client.clone());
        let tracked = self.context.tracked.clone();

        let grace = tokio::spawn(abort_after_grace(
            shutdown.clone(),
            self.shutdown_grace,
            self.abort.clone(),
        ));
        let stop = shutdown.clone();

        info!("Starting service controller with {} workers", self.workers);
        Controller::new(services, WatcherConfig::default())
            .with_config(controller::Config::default().concurrency(self.workers))
            .watches(slices, WatcherConfig::default(), move |slice| {
                tracked.service_for_slice(&slice)
            })
            .reconcile_all_on(stream::select(node_changes, resync_ticks(self.resync_interval)))
            .graceful_shutdown_on(async move { stop.cancelled().await })
            .run(reconcile, error_policy, self.context)
            .for_each(|res| async move {
                match res {
                    Ok((service, _)) => debug!("Reconciled service: {}", service),
                    Err(e) => warn!("Reconciliation error: {}", e),
                }
            })
            .await;

        grace.abort();
        info!("Service controller stopped");
        Ok(())
    }
}

/// Cancel outstanding cloud calls if draining outlasts the grace period
async fn abort_after_grace(shutdown: CancellationToken, grace: Duration, abort: CancellationToken) {
    shutdown.cancelled().await;
    info!("Shutdown requested, waiting up to {:?} for in-flight passes", grace);
    tokio::time::sleep(grace).await;
    warn!("Grace period expired, cancelling outstanding cloud calls");
    abort.cancel();
}

#[instrument(skip_all, fields(service = %ReconciliationKey::from_service(&service)))]
pub async fn reconcile(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action> {
    let key = ReconciliationKey::from_service(&service);

    // Neither a load balancer nor carrying our guard: nothing to read or clean up
    if !is_managed(&service) {
        if ctx.tracked.remove(&key) {
            debug!("No longer tracking {}", key);
        }
        ctx.forget(&key);
        return Ok(Action::await_change());
    }

    ctx.tracked.insert(key.clone());
    let outcome = ctx.reconciler.reconcile_service(&key).await?;
    ctx.forget(&key);

    match outcome {
        PassOutcome::Absent | PassOutcome::Ignored | PassOutcome::Released => {
            ctx.tracked.remove(&key);
        }
        PassOutcome::Parked | PassOutcome::Converged { .. } => {}
    }
    Ok(Action::await_change())
}

pub fn error_policy(service: Arc<Service>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let key = ReconciliationKey::from_service(&service);

    if error.is_terminal() {
        // Parked until the Service changes; its next event or the resync brings it back
        ctx.forget(&key);
        warn!("Reconciliation of {} failed permanently: {}", key, error);
        return Action::await_change();
    }

    let failures = ctx.record_failure(&key);
    let delay = ctx.backoff.delay(failures);
    warn!(
        "Reconciliation of {} failed ({} in a row), retrying in {:?}: {}",
        key, failures, delay, error
    );
    Action::requeue(delay)
}
