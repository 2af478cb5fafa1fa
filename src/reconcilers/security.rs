// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Security group rules for traffic and health checks reaching the targets.
//!
//! Only rules carrying this Service's owner marker are ever listed, created or revoked.
//! A rule with the same (group, protocol, port, source) tuple owned by anyone else is
//! left untouched; we add our own tagged copy next to it.

use crate::cloud::{CloudBackend, CloudError};
use crate::error::Result;
use crate::reconcilers::targets::DesiredMembers;
use crate::translate::DesiredLoadBalancerSpec;
use crate::types::{HealthCheckPort, Protocol, RuleFilter, SecurityRule};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleOutcome {
    pub authorized: usize,
    pub revoked: usize,
}

/// Every rule this Service needs on the node security groups
pub fn required_rules(
    desired: &DesiredLoadBalancerSpec,
    members: &DesiredMembers,
    health_check_sources: &[String],
) -> BTreeSet<SecurityRule> {
    let groups: BTreeSet<&str> = members
        .instances
        .values()
        .flat_map(|r| r.security_groups.iter().map(String::as_str))
        .collect();

    let health_ports: BTreeSet<u16> = match desired.health_check.port {
        HealthCheckPort::Explicit(port) => BTreeSet::from([port]),
        HealthCheckPort::TrafficPort => members.traffic_ports.iter().map(|(_, port)| *port).collect(),
    };

    let mut rules = BTreeSet::new();
    for group in groups {
        let rule = |protocol: Protocol, port: u16, source: &str| SecurityRule {
            group_id: group.to_string(),
            protocol,
            from_port: port,
            to_port: port,
            source: source.to_string(),
            owner: Some(desired.rule_owner.clone()),
        };

        for (protocol, port) in &members.traffic_ports {
            for source in &desired.source_ranges {
                rules.insert(rule(*protocol, *port, source));
            }
        }
        // Health checks are TCP or HTTP, both over TCP
        for port in &health_ports {
            for source in health_check_sources {
                rules.insert(rule(Protocol::Tcp, *port, source));
            }
        }
    }

    rules
}

/// Rules currently carrying `owner`, across every group
pub async fn owned_rules(backend: &dyn CloudBackend, owner: &str) -> Result<BTreeSet<SecurityRule>> {
    let filter = RuleFilter {
        group_ids: None,
        owner: Some(owner.to_string()),
    };
    Ok(backend.describe_security_rules(&filter).await?.into_iter().collect())
}

#[instrument(skip_all, fields(owner = %desired.rule_owner))]
pub async fn reconcile_rules(
    backend: &dyn CloudBackend,
    desired: &DesiredLoadBalancerSpec,
    members: &DesiredMembers,
    health_check_sources: &[String],
) -> Result<RuleOutcome> {
    let required = required_rules(desired, members, health_check_sources);
    let current = owned_rules(backend, &desired.rule_owner).await?;

    let to_add: Vec<SecurityRule> = required.difference(&current).cloned().collect();
    let to_remove: Vec<SecurityRule> = current.difference(&required).cloned().collect();

    let mut outcome = RuleOutcome::default();
    if !to_add.is_empty() {
        outcome.authorized = authorize(backend, &to_add).await?;
        info!("Authorized {} security rules", outcome.authorized);
    }
    if !to_remove.is_empty() {
        outcome.revoked = revoke(backend, &to_remove).await?;
        info!("Revoked {} stale security rules", outcome.revoked);
    }

    Ok(outcome)
}

/// Revoke everything carrying `owner`; returns how many rules were removed
pub async fn revoke_owned(backend: &dyn CloudBackend, owner: &str) -> Result<usize> {
    let current: Vec<SecurityRule> = owned_rules(backend, owner).await?.into_iter().collect();
    if current.is_empty() {
        return Ok(0);
    }
    revoke(backend, &current).await
}

async fn authorize(backend: &dyn CloudBackend, rules: &[SecurityRule]) -> Result<usize> {
    match backend.authorize_security_rules(rules).await {
        Ok(()) => Ok(rules.len()),
        Err(CloudError::AlreadyExists { .. }) => {
            // Someone raced us on part of the batch; fall back to one at a time
            let mut added = 0;
            for rule in rules {
                match backend.authorize_security_rules(std::slice::from_ref(rule)).await {
                    Ok(()) => added += 1,
                    Err(CloudError::AlreadyExists { .. }) => debug!("Rule {} already present", rule),
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(added)
        }
        Err(e) => Err(e.into()),
    }
}

async fn revoke(backend: &dyn CloudBackend, rules: &[SecurityRule]) -> Result<usize> {
    match backend.revoke_security_rules(rules).await {
        Ok(()) => Ok(rules.len()),
        Err(e) if e.is_not_found() => {
            let mut removed = 0;
            for rule in rules {
                match backend.revoke_security_rules(std::slice::from_ref(rule)).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.is_not_found() => debug!("Rule {} already gone", rule),
                    Err(e) => {
                        warn!("Failed to revoke rule {}: {}", rule, e);
                        return Err(e.into());
                    }
                }
            }
            Ok(removed)
        }
        Err(e) => Err(e.into()),
    }
}
