// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Load balancer lifecycle: find, create, update in place, or replace.
//!
//! The load balancer is always looked up by its deterministic name, so a pass that
//! crashed after creating it rediscovers it instead of creating a second one.

use crate::cloud::{ignore_not_found, CloudBackend, CloudError};
use crate::error::{ControllerError, Result};
use crate::translate::{naming, DesiredLoadBalancerSpec};
use crate::types::{CreateLoadBalancer, Listener, ObservedLoadBalancer, TargetGroup, Tags};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument, warn};

/// Result of one lifecycle step
#[derive(Debug, Clone)]
pub struct LoadBalancerOutcome {
    pub observed: ObservedLoadBalancer,
    /// The load balancer did not exist before this pass (or was replaced)
    pub created: bool,
    /// Number of mutating backend calls issued
    pub changes: usize,
}

/// Describe the load balancer by name, refusing one this Service does not own
pub async fn find_owned(
    backend: &dyn CloudBackend,
    name: &str,
    cluster_name: &str,
    uid: &str,
) -> Result<Option<ObservedLoadBalancer>> {
    match backend.describe_load_balancer(name).await? {
        Some(lb) if !naming::is_owned(&lb.tags, cluster_name, uid) => Err(ControllerError::Conflict(format!(
            "load balancer {} exists but is not tagged as owned by this service",
            name
        ))),
        other => Ok(other),
    }
}

/// Target groups carrying this Service's ownership tags, by name
pub async fn owned_target_groups(backend: &dyn CloudBackend, lookup_tags: &Tags) -> Result<BTreeMap<String, TargetGroup>> {
    Ok(backend
        .describe_target_groups(lookup_tags)
        .await?
        .into_iter()
        .map(|tg| (tg.name.clone(), tg))
        .collect())
}

#[instrument(skip(backend, desired), fields(load_balancer = %desired.name))]
pub async fn ensure_load_balancer(
    backend: &dyn CloudBackend,
    desired: &DesiredLoadBalancerSpec,
    cluster_name: &str,
) -> Result<LoadBalancerOutcome> {
    let existing = find_owned(backend, &desired.name, cluster_name, &desired.uid).await?;

    match existing {
        None => create(backend, desired).await,
        Some(observed) if desired.requires_recreate(observed.kind, observed.scheme, observed.target_mode) => {
            info!(
                "Replacing load balancer {}: {:?}/{:?}/{:?} -> {:?}/{:?}/{:?}",
                desired.name,
                observed.kind,
                observed.scheme,
                observed.target_mode,
                desired.kind,
                desired.scheme,
                desired.target_mode
            );
            let removed = delete_load_balancer_and_groups(backend, &desired.name, &desired.lookup_tags).await?;
            let mut outcome = create(backend, desired).await?;
            outcome.changes += removed;
            Ok(outcome)
        }
        Some(observed) => update(backend, desired, observed).await,
    }
}

async fn create(backend: &dyn CloudBackend, desired: &DesiredLoadBalancerSpec) -> Result<LoadBalancerOutcome> {
    let existing_groups = owned_target_groups(backend, &desired.lookup_tags).await?;
    let mut changes = ensure_target_groups(backend, desired, &existing_groups).await?;

    let request = CreateLoadBalancer {
        name: desired.name.clone(),
        kind: desired.kind,
        scheme: desired.scheme,
        target_mode: desired.target_mode,
        listeners: desired.listeners.clone(),
        attributes: desired.attributes.clone(),
        tags: desired.tags.clone(),
    };

    let observed = match backend.create_load_balancer(&request).await {
        Ok(observed) => {
            changes += 1;
            info!("Created load balancer {} ({})", observed.name, observed.dns_name);
            observed
        }
        Err(CloudError::AlreadyExists { .. }) => {
            // Lost a race with our own earlier pass; adopt what is there
            debug!("Load balancer {} appeared concurrently, re-reading", desired.name);
            backend
                .describe_load_balancer(&desired.name)
                .await?
                .ok_or_else(|| CloudError::Backend {
                    message: format!("load balancer {} reported existing but not found", desired.name),
                    retryable: true,
                })?
        }
        Err(e) => return Err(e.into()),
    };

    Ok(LoadBalancerOutcome {
        observed,
        created: true,
        changes,
    })
}

/// Create missing target groups and bring health checks of existing ones in line
async fn ensure_target_groups(
    backend: &dyn CloudBackend,
    desired: &DesiredLoadBalancerSpec,
    existing: &BTreeMap<String, TargetGroup>,
) -> Result<usize> {
    let mut changes = 0;

    for spec in &desired.target_groups {
        match existing.get(&spec.name) {
            None => match backend.create_target_group(spec).await {
                Ok(_) => {
                    changes += 1;
                    debug!("Created target group {}", spec.name);
                }
                Err(CloudError::AlreadyExists { .. }) => {
                    debug!("Target group {} already exists", spec.name);
                }
                Err(e) => return Err(e.into()),
            },
            Some(group) if group.health_check != spec.health_check => {
                backend
                    .update_target_group_health_check(&spec.name, &spec.health_check)
                    .await?;
                changes += 1;
                debug!("Updated health check of target group {}", spec.name);
            }
            Some(_) => {}
        }
    }

    Ok(changes)
}

async fn update(
    backend: &dyn CloudBackend,
    desired: &DesiredLoadBalancerSpec,
    observed: ObservedLoadBalancer,
) -> Result<LoadBalancerOutcome> {
    let groups = owned_target_groups(backend, &desired.lookup_tags).await?;
    let mut changes = ensure_target_groups(backend, desired, &groups).await?;

    let current: BTreeMap<_, &Listener> = observed.listeners.iter().map(|l| (l.key(), l)).collect();
    let wanted: BTreeMap<_, &Listener> = desired.listeners.iter().map(|l| (l.key(), l)).collect();

    for (key, listener) in &wanted {
        match current.get(key) {
            None => {
                backend.create_listener(&desired.name, listener).await?;
                changes += 1;
                debug!("Added listener {}/{}", listener.protocol, listener.port);
            }
            Some(existing) if *existing != *listener => {
                backend.update_listener(&desired.name, listener).await?;
                changes += 1;
                debug!("Updated listener {}/{}", listener.protocol, listener.port);
            }
            Some(_) => {}
        }
    }

    for (key, listener) in &current {
        if !wanted.contains_key(key) {
            ignore_not_found(backend.delete_listener(&desired.name, listener).await)?;
            changes += 1;
            debug!("Removed listener {}/{}", listener.protocol, listener.port);
        }
    }

    // Groups are only deletable once no listener points at them
    let wanted_groups: BTreeSet<&str> = desired.target_groups.iter().map(|g| g.name.as_str()).collect();
    for name in groups.keys().filter(|name| !wanted_groups.contains(name.as_str())) {
        ignore_not_found(backend.delete_target_group(name).await)?;
        changes += 1;
        debug!("Deleted stale target group {}", name);
    }

    if observed.attributes != desired.attributes {
        backend
            .update_load_balancer_attributes(&desired.name, &desired.attributes)
            .await?;
        changes += 1;
        debug!("Updated attributes of load balancer {}", desired.name);
    }

    if changes > 0 {
        info!("Updated load balancer {} ({} changes)", desired.name, changes);
    }

    let observed = match changes {
        0 => observed,
        _ => backend
            .describe_load_balancer(&desired.name)
            .await?
            .unwrap_or(observed),
    };

    Ok(LoadBalancerOutcome {
        observed,
        created: false,
        changes,
    })
}

/// Delete the load balancer and every owned target group; absent resources count as done.
///
/// Returns the number of resources actually removed.
pub async fn delete_load_balancer_and_groups(backend: &dyn CloudBackend, name: &str, lookup_tags: &Tags) -> Result<usize> {
    let mut removed = 0;

    match backend.delete_load_balancer(name).await {
        Ok(()) => {
            removed += 1;
            info!("Deleted load balancer {}", name);
        }
        Err(e) if e.is_not_found() => debug!("Load balancer {} already gone", name),
        Err(e) => return Err(e.into()),
    }

    for group in owned_target_groups(backend, lookup_tags).await?.keys() {
        match backend.delete_target_group(group).await {
            Ok(()) => {
                removed += 1;
                debug!("Deleted target group {}", group);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!("Failed to delete target group {}: {}", group, e);
                return Err(e.into());
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::ops;
    use crate::cloud::MemoryCloud;
    use crate::config::Config;
    use crate::constants::options as keys;
    use crate::test_utils::exposure;
    use crate::translate::translate;
    use crate::types::{ListenerBackend, LoadBalancerKind, ServiceExposure};

    fn config() -> Config {
        Config {
            cluster_name: "test".to_string(),
            ..Config::default()
        }
    }

    fn network_exposure() -> ServiceExposure {
        let mut exp = exposure("default", "web", &[(80, 8080, 30080), (443, 8443, 30443)], &["node-a"]);
        exp.options.insert(keys::KIND.to_string(), "network".to_string());
        exp
    }

    #[tokio::test]
    async fn test_create_then_noop() {
        let cloud = MemoryCloud::new("test-1");
        let desired = translate(&network_exposure(), &config()).unwrap();

        let first = ensure_load_balancer(&cloud, &desired, "test").await.unwrap();
        assert!(first.created);
        assert_eq!(cloud.target_groups().len(), 2);
        assert_eq!(first.observed.listeners.len(), 2);

        let before = cloud.mutation_count();
        let second = ensure_load_balancer(&cloud, &desired, "test").await.unwrap();
        assert!(!second.created);
        assert_eq!(second.changes, 0);
        assert_eq!(cloud.mutation_count(), before);
        assert_eq!(first.observed.dns_name, second.observed.dns_name);
    }

    #[tokio::test]
    async fn test_port_removal_drops_listener_and_group() {
        let cloud = MemoryCloud::new("test-1");
        let mut exp = network_exposure();
        ensure_load_balancer(&cloud, &translate(&exp, &config()).unwrap(), "test")
            .await
            .unwrap();

        exp.ports.pop();
        let desired = translate(&exp, &config()).unwrap();
        let outcome = ensure_load_balancer(&cloud, &desired, "test").await.unwrap();

        assert_eq!(outcome.changes, 2);
        assert_eq!(outcome.observed.listeners.len(), 1);
        assert_eq!(cloud.target_groups().len(), 1);
    }

    #[tokio::test]
    async fn test_node_port_change_moves_target_group() {
        let cloud = MemoryCloud::new("test-1");
        let mut exp = network_exposure();
        let created = ensure_load_balancer(&cloud, &translate(&exp, &config()).unwrap(), "test")
            .await
            .unwrap();

        exp.ports[0].node_port = Some(31080);
        let desired = translate(&exp, &config()).unwrap();
        let outcome = ensure_load_balancer(&cloud, &desired, "test").await.unwrap();

        assert!(!outcome.created);
        assert_eq!(outcome.observed.dns_name, created.observed.dns_name);
        // new group, repointed listener, stale group removed
        assert_eq!(outcome.changes, 3);

        let mut ports: Vec<u16> = cloud.target_groups().iter().map(|g| g.port).collect();
        ports.sort();
        assert_eq!(ports, vec![30443, 31080]);
        assert!(outcome
            .observed
            .listeners
            .iter()
            .any(|l| l.backend == ListenerBackend::TargetGroup(desired.target_groups[0].name.clone())));

        let again = ensure_load_balancer(&cloud, &desired, "test").await.unwrap();
        assert_eq!(again.changes, 0);
    }

    #[tokio::test]
    async fn test_attribute_change_updates_in_place() {
        let cloud = MemoryCloud::new("test-1");
        let mut exp = network_exposure();
        let created = ensure_load_balancer(&cloud, &translate(&exp, &config()).unwrap(), "test")
            .await
            .unwrap();

        exp.options.insert(keys::CROSS_ZONE.to_string(), "true".to_string());
        let outcome = ensure_load_balancer(&cloud, &translate(&exp, &config()).unwrap(), "test")
            .await
            .unwrap();

        assert!(!outcome.created);
        assert!(outcome.observed.attributes.cross_zone);
        assert_eq!(outcome.observed.dns_name, created.observed.dns_name);
        assert_eq!(cloud.call_count(ops::UPDATE_ATTRIBUTES), 1);
    }

    #[tokio::test]
    async fn test_kind_change_recreates() {
        let cloud = MemoryCloud::new("test-1");
        let mut exp = exposure("default", "web", &[(80, 8080, 30080)], &["node-a"]);
        ensure_load_balancer(&cloud, &translate(&exp, &config()).unwrap(), "test")
            .await
            .unwrap();

        exp.options.insert(keys::KIND.to_string(), "network".to_string());
        let outcome = ensure_load_balancer(&cloud, &translate(&exp, &config()).unwrap(), "test")
            .await
            .unwrap();

        assert!(outcome.created);
        assert_eq!(outcome.observed.kind, LoadBalancerKind::Network);
        assert_eq!(cloud.load_balancers().len(), 1);
        assert_eq!(cloud.call_count(ops::DELETE_LOAD_BALANCER), 1);
    }

    #[tokio::test]
    async fn test_foreign_load_balancer_is_a_conflict() {
        let cloud = MemoryCloud::new("test-1");
        let exp = network_exposure();
        let desired = translate(&exp, &config()).unwrap();

        // Same name, different cluster
        let other = Config {
            cluster_name: "other".to_string(),
            ..Config::default()
        };
        ensure_load_balancer(&cloud, &translate(&exp, &other).unwrap(), "other")
            .await
            .unwrap();

        let err = ensure_load_balancer(&cloud, &desired, "test").await.unwrap_err();
        assert!(matches!(err, ControllerError::Conflict(_)));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_failed_create_leaves_groups_for_next_pass() {
        let cloud = MemoryCloud::new("test-1");
        let desired = translate(&network_exposure(), &config()).unwrap();
        cloud.fail_next(ops::CREATE_LOAD_BALANCER, CloudError::Throttled("busy".to_string()));

        assert!(ensure_load_balancer(&cloud, &desired, "test").await.is_err());
        assert_eq!(cloud.target_groups().len(), 2);

        let outcome = ensure_load_balancer(&cloud, &desired, "test").await.unwrap();
        assert!(outcome.created);
        assert_eq!(cloud.target_groups().len(), 2);
        assert_eq!(cloud.load_balancers().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let cloud = MemoryCloud::new("test-1");
        let desired = translate(&network_exposure(), &config()).unwrap();
        ensure_load_balancer(&cloud, &desired, "test").await.unwrap();

        let removed = delete_load_balancer_and_groups(&cloud, &desired.name, &desired.lookup_tags)
            .await
            .unwrap();
        assert_eq!(removed, 3);

        let removed = delete_load_balancer_and_groups(&cloud, &desired.name, &desired.lookup_tags)
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert!(cloud.load_balancers().is_empty());
        assert!(cloud.target_groups().is_empty());
    }
}
