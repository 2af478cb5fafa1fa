// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Ordered teardown of a Service's cloud resources.
//!
//! Deletion walks `Guarded → Detaching → DeletingLoadBalancer → RevokingRules → Released`.
//! Every step is idempotent and treats "already gone" as done, so a pass interrupted at
//! any point simply restarts from the top. The guard is released only after a final
//! check finds nothing tagged for the Service.
//!
//! Teardown works from the Service UID alone; it never needs the options to translate.

use crate::cloud::{ignore_not_found, CloudBackend};
use crate::error::{ControllerError, Result};
use crate::kubernetes::store::ExposureStore;
use crate::reconcilers::loadbalancer::{delete_load_balancer_and_groups, owned_target_groups};
use crate::reconcilers::{security, targets};
use crate::translate::naming;
use crate::types::{LoadBalancerKind, ObservedLoadBalancer, ServiceExposure, Tags, TargetSetId};
use std::fmt;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPhase {
    Guarded,
    Detaching,
    DeletingLoadBalancer,
    RevokingRules,
    Released,
}

impl fmt::Display for DeletionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeletionPhase::Guarded => "guarded",
            DeletionPhase::Detaching => "detaching",
            DeletionPhase::DeletingLoadBalancer => "deleting-load-balancer",
            DeletionPhase::RevokingRules => "revoking-rules",
            DeletionPhase::Released => "released",
        };
        f.write_str(name)
    }
}

pub struct Teardown<'a> {
    backend: &'a dyn CloudBackend,
    store: &'a dyn ExposureStore,
    exposure: &'a ServiceExposure,
    cluster_name: &'a str,
    batch_size: usize,
    load_balancer: String,
    lookup_tags: Tags,
    rule_owner: String,
}

impl<'a> Teardown<'a> {
    pub fn new(
        backend: &'a dyn CloudBackend,
        store: &'a dyn ExposureStore,
        exposure: &'a ServiceExposure,
        cluster_name: &'a str,
        batch_size: usize,
    ) -> Self {
        Self {
            backend,
            store,
            exposure,
            cluster_name,
            batch_size,
            load_balancer: naming::load_balancer_name(&exposure.uid),
            lookup_tags: naming::lookup_tags(cluster_name, &exposure.uid),
            rule_owner: naming::rule_owner(cluster_name, &exposure.uid),
        }
    }

    /// Drive the state machine to `Released`, or stop at the first step that cannot complete
    #[instrument(skip(self), fields(service = %self.exposure.key))]
    pub async fn run(&self) -> Result<DeletionPhase> {
        let mut phase = DeletionPhase::Guarded;
        while phase != DeletionPhase::Released {
            let next = match self.step(phase).await {
                Ok(next) => next,
                Err(e) => {
                    warn!("Teardown of {} stopped in phase {}: {}", self.exposure.key, phase, e);
                    return Err(e);
                }
            };
            debug!("Teardown of {}: {} -> {}", self.exposure.key, phase, next);
            phase = next;
        }
        Ok(phase)
    }

    async fn step(&self, phase: DeletionPhase) -> Result<DeletionPhase> {
        match phase {
            DeletionPhase::Guarded => Ok(DeletionPhase::Detaching),
            DeletionPhase::Detaching => {
                let sets = self.target_sets().await?;
                let removed = targets::detach_all(self.backend, &sets, self.batch_size).await?;
                if removed > 0 {
                    info!("Detached {} targets", removed);
                }
                Ok(DeletionPhase::DeletingLoadBalancer)
            }
            DeletionPhase::DeletingLoadBalancer => {
                if self.owned_load_balancer().await?.is_some() {
                    delete_load_balancer_and_groups(self.backend, &self.load_balancer, &self.lookup_tags).await?;
                } else {
                    // A same-named balancer we do not own is left alone; groups are ours by tag
                    self.delete_owned_groups().await?;
                }
                self.verify_load_balancer_gone().await?;
                Ok(DeletionPhase::RevokingRules)
            }
            DeletionPhase::RevokingRules => {
                let revoked = security::revoke_owned(self.backend, &self.rule_owner).await?;
                if revoked > 0 {
                    info!("Revoked {} security rules", revoked);
                }
                self.verify_released().await?;
                self.store.remove_guard(&self.exposure.key).await?;
                info!("Released {} after removing all cloud resources", self.exposure.key);
                Ok(DeletionPhase::Released)
            }
            DeletionPhase::Released => Ok(DeletionPhase::Released),
        }
    }

    async fn owned_load_balancer(&self) -> Result<Option<ObservedLoadBalancer>> {
        Ok(self
            .backend
            .describe_load_balancer(&self.load_balancer)
            .await?
            .filter(|lb| naming::is_owned(&lb.tags, self.cluster_name, &self.exposure.uid)))
    }

    async fn target_sets(&self) -> Result<Vec<TargetSetId>> {
        let mut sets: Vec<TargetSetId> = owned_target_groups(self.backend, &self.lookup_tags)
            .await?
            .into_keys()
            .map(TargetSetId::TargetGroup)
            .collect();

        if let Some(lb) = self.owned_load_balancer().await? {
            if lb.kind == LoadBalancerKind::Classic {
                sets.push(TargetSetId::LoadBalancer(lb.name));
            }
        }
        Ok(sets)
    }

    async fn delete_owned_groups(&self) -> Result<()> {
        for group in owned_target_groups(self.backend, &self.lookup_tags).await?.keys() {
            ignore_not_found(self.backend.delete_target_group(group).await)?;
        }
        Ok(())
    }

    async fn verify_load_balancer_gone(&self) -> Result<()> {
        if self.owned_load_balancer().await?.is_some() {
            return Err(ControllerError::DeletionPending(format!(
                "load balancer {} still exists",
                self.load_balancer
            )));
        }
        let groups = owned_target_groups(self.backend, &self.lookup_tags).await?;
        if !groups.is_empty() {
            return Err(ControllerError::DeletionPending(format!(
                "{} target groups still exist",
                groups.len()
            )));
        }
        Ok(())
    }

    /// Nothing tagged for this Service may remain when the guard is dropped
    async fn verify_released(&self) -> Result<()> {
        self.verify_load_balancer_gone().await?;
        let rules = security::owned_rules(self.backend, &self.rule_owner).await?;
        if !rules.is_empty() {
            return Err(ControllerError::DeletionPending(format!(
                "{} security rules still exist",
                rules.len()
            )));
        }
        Ok(())
    }
}
