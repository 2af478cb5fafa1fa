// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! One reconciliation pass for one Service.
//!
//! A pass reads a fresh snapshot, then either tears everything down or converges it:
//! guard, translate, load balancer, targets, security rules, status. Every stage reads
//! the backend again instead of trusting anything from a previous pass.

use crate::cloud::CloudBackend;
use crate::config::Config;
use crate::error::{ControllerError, Result};
use crate::instances::InstanceCache;
use crate::kubernetes::store::{EventSeverity, ExposureStore};
use crate::reconcilers::finalizer::Teardown;
use crate::reconcilers::{loadbalancer, security, targets};
use crate::translate::translate;
use crate::types::{ReconciliationKey, ServiceExposure};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

/// How a pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The Service no longer exists
    Absent,
    /// Not a load balancer Service and nothing of ours to clean up
    Ignored,
    /// The last validation failure still applies to this exact spec
    Parked,
    /// Cloud state matches the Service
    Converged { changes: usize },
    /// Everything was torn down and the guard released
    Released,
}

pub struct ServiceReconciler {
    backend: Arc<dyn CloudBackend>,
    store: Arc<dyn ExposureStore>,
    instances: InstanceCache,
    config: Config,
    /// Fingerprint of the Service inputs that last failed terminally
    parked: Mutex<HashMap<ReconciliationKey, u64>>,
}

impl ServiceReconciler {
    pub fn new(
        backend: Arc<dyn CloudBackend>,
        store: Arc<dyn ExposureStore>,
        instances: InstanceCache,
        config: Config,
    ) -> Self {
        Self {
            backend,
            store,
            instances,
            config,
            parked: Mutex::new(HashMap::new()),
        }
    }

    fn parked(&self) -> std::sync::MutexGuard<'_, HashMap<ReconciliationKey, u64>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn park(&self, exposure: &ServiceExposure, reason: &str, error: &ControllerError) {
        self.parked().insert(exposure.key.clone(), exposure.fingerprint());
        self.store
            .record_event(exposure, EventSeverity::Warning, reason, error.to_string())
            .await;
    }

    #[instrument(skip(self), fields(service = %key))]
    pub async fn reconcile_service(&self, key: &ReconciliationKey) -> Result<PassOutcome> {
        let Some(exposure) = self.store.get(key).await? else {
            debug!("Service {} is gone", key);
            self.parked().remove(key);
            return Ok(PassOutcome::Absent);
        };

        if exposure.needs_teardown() {
            self.parked().remove(key);
            if !exposure.guarded {
                return Ok(PassOutcome::Ignored);
            }
            return self.tear_down(&exposure).await;
        }

        if self.parked().get(key) == Some(&exposure.fingerprint()) {
            debug!("Service {} is parked until its spec changes", key);
            return Ok(PassOutcome::Parked);
        }

        let desired = match translate(&exposure, &self.config) {
            Ok(desired) => desired,
            Err(e) => {
                warn!("Invalid load balancer configuration for {}: {}", key, e);
                self.park(&exposure, "InvalidConfiguration", &e).await;
                return Err(e);
            }
        };
        self.parked().remove(key);

        // The guard must be in place before the first cloud resource exists
        if !exposure.guarded {
            self.store.add_guard(key).await?;
        }

        let backend = self.backend.as_ref();
        let lb = match loadbalancer::ensure_load_balancer(backend, &desired, &self.config.cluster_name).await {
            Ok(lb) => lb,
            Err(e) if e.is_terminal() => {
                warn!("Refusing to manage load balancer for {}: {}", key, e);
                self.park(&exposure, "LoadBalancerConflict", &e).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        // Publish the address before anything else can fail
        let hostnames = vec![lb.observed.dns_name.clone()];
        if exposure.ingress != hostnames {
            self.store.update_ingress(key, &hostnames).await?;
        }
        if lb.created {
            self.store
                .record_event(
                    &exposure,
                    EventSeverity::Normal,
                    "EnsuredLoadBalancer",
                    format!("Load balancer {} provisioned", lb.observed.dns_name),
                )
                .await;
        }

        let members = targets::desired_members(&exposure, &desired, &self.instances).await?;
        let target_outcome = targets::reconcile_targets(backend, &members, self.config.target_batch_size).await?;
        let rule_outcome = security::reconcile_rules(
            backend,
            &desired,
            &members,
            &self.config.health_check_source_ranges,
        )
        .await?;

        if target_outcome.failed_deregistrations > 0 {
            return Err(ControllerError::PartialFailure(format!(
                "{} targets could not be deregistered",
                target_outcome.failed_deregistrations
            )));
        }

        let changes = lb.changes + target_outcome.changes() + rule_outcome.authorized + rule_outcome.revoked;
        if changes > 0 {
            info!("Converged {} with {} changes", key, changes);
        } else {
            debug!("{} already converged", key);
        }
        Ok(PassOutcome::Converged { changes })
    }

    async fn tear_down(&self, exposure: &ServiceExposure) -> Result<PassOutcome> {
        let teardown = Teardown::new(
            self.backend.as_ref(),
            self.store.as_ref(),
            exposure,
            &self.config.cluster_name,
            self.config.target_batch_size,
        );

        match teardown.run().await {
            Ok(_) => {
                self.store
                    .record_event(
                        exposure,
                        EventSeverity::Normal,
                        "DeletedLoadBalancer",
                        "Load balancer and its cloud resources were removed".to_string(),
                    )
                    .await;
                Ok(PassOutcome::Released)
            }
            Err(e) => {
                self.store
                    .record_event(exposure, EventSeverity::Warning, "DeletionPending", e.to_string())
                    .await;
                Err(e)
            }
        }
    }
}
