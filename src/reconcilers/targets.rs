// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Target registration: diff desired members against what the backend reports.
//!
//! Nothing about previous registrations is remembered between passes; the observed
//! membership is fetched fresh every time.

use crate::cloud::CloudBackend;
use crate::error::{ControllerError, Result};
use crate::instances::InstanceCache;
use crate::translate::DesiredLoadBalancerSpec;
use crate::types::{
    InstanceRecord, LoadBalancerKind, Protocol, ServiceExposure, Target, TargetMode, TargetPort, TargetSetId,
    TrafficPolicy,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument, warn};

/// Who should be registered where, for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredMembers {
    pub sets: BTreeMap<TargetSetId, BTreeSet<Target>>,
    /// Instances of the nodes that receive traffic, keyed by node name
    pub instances: BTreeMap<String, InstanceRecord>,
    /// (protocol, port) pairs traffic arrives on at the nodes or pods
    pub traffic_ports: BTreeSet<(Protocol, u16)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetOutcome {
    pub registered: usize,
    pub deregistered: usize,
    pub failed_deregistrations: usize,
}

impl TargetOutcome {
    pub fn changes(&self) -> usize {
        self.registered + self.deregistered
    }
}

/// Nodes that should receive traffic under the Service's traffic policy
fn traffic_nodes(exposure: &ServiceExposure) -> BTreeSet<String> {
    match exposure.traffic_policy {
        TrafficPolicy::Cluster => exposure.nodes.iter().cloned().collect(),
        TrafficPolicy::Local => {
            let hosting: BTreeSet<&str> = exposure
                .ready_endpoints()
                .filter_map(|e| e.node_name.as_deref())
                .collect();
            exposure
                .nodes
                .iter()
                .filter(|n| hosting.contains(n.as_str()))
                .cloned()
                .collect()
        }
    }
}

#[instrument(skip_all, fields(service = %exposure.key))]
pub async fn desired_members(
    exposure: &ServiceExposure,
    desired: &DesiredLoadBalancerSpec,
    instances: &InstanceCache,
) -> Result<DesiredMembers> {
    let mut members = DesiredMembers::default();

    match desired.target_mode {
        TargetMode::Instance => {
            let nodes = traffic_nodes(exposure);
            members.instances = instances.get_many(&nodes).await?;

            let ids: BTreeSet<&str> = members.instances.values().map(|r| r.instance_id.as_str()).collect();
            let target_set = |port: Option<u16>| -> BTreeSet<Target> {
                ids.iter()
                    .map(|id| Target {
                        id: id.to_string(),
                        port,
                    })
                    .collect()
            };

            match desired.kind {
                LoadBalancerKind::Classic => {
                    members
                        .sets
                        .insert(TargetSetId::LoadBalancer(desired.name.clone()), target_set(None));
                }
                LoadBalancerKind::Network => {
                    for group in &desired.target_groups {
                        members
                            .sets
                            .insert(TargetSetId::TargetGroup(group.name.clone()), target_set(None));
                    }
                }
            }

            for mapping in &desired.ports {
                if let Some(node_port) = mapping.node_port {
                    members.traffic_ports.insert((mapping.protocol, node_port));
                }
            }
        }
        TargetMode::Ip => {
            let mut nodes = BTreeSet::new();

            for mapping in &desired.ports {
                let Some(group) = &mapping.target_group else {
                    continue;
                };
                let mut targets = BTreeSet::new();

                for endpoint in exposure.ready_endpoints() {
                    let port = match &mapping.target_port {
                        TargetPort::Number(n) => u16::try_from(*n).ok(),
                        TargetPort::Named(name) => endpoint.ports.get(name).copied(),
                    };
                    let Some(port) = port else {
                        debug!("Endpoint {} has no port for {:?}", endpoint.address, mapping.target_port);
                        continue;
                    };

                    targets.insert(Target {
                        id: endpoint.address.clone(),
                        port: Some(port),
                    });
                    members.traffic_ports.insert((mapping.protocol, port));
                    if let Some(node) = &endpoint.node_name {
                        nodes.insert(node.clone());
                    }
                }

                members.sets.insert(TargetSetId::TargetGroup(group.clone()), targets);
            }

            members.instances = instances.get_many(&nodes).await?;
        }
    }

    Ok(members)
}

/// Bring every target set in line with `members`.
///
/// Registration failures abort the pass. Deregistration failures are counted and the pass
/// carries on, so one stuck target never blocks the others.
#[instrument(skip_all)]
pub async fn reconcile_targets(
    backend: &dyn CloudBackend,
    members: &DesiredMembers,
    batch_size: usize,
) -> Result<TargetOutcome> {
    let mut outcome = TargetOutcome::default();
    let batch_size = batch_size.max(1);

    for (set, wanted) in &members.sets {
        let current: BTreeSet<Target> = backend.describe_targets(set).await?.into_iter().collect();

        let to_register: Vec<Target> = wanted.difference(&current).cloned().collect();
        let to_deregister: Vec<Target> = current.difference(wanted).cloned().collect();

        for chunk in to_register.chunks(batch_size) {
            backend.register_targets(set, chunk).await?;
            outcome.registered += chunk.len();
        }
        if !to_register.is_empty() {
            info!("Registered {} targets on {}", to_register.len(), set);
        }

        for chunk in to_deregister.chunks(batch_size) {
            match backend.deregister_targets(set, chunk).await {
                Ok(()) => outcome.deregistered += chunk.len(),
                Err(e) if e.is_not_found() => {
                    debug!("Target set {} vanished during deregistration", set);
                }
                Err(e) => {
                    warn!("Failed to deregister {} targets from {}: {}", chunk.len(), set, e);
                    outcome.failed_deregistrations += chunk.len();
                }
            }
        }
        if !to_deregister.is_empty() {
            info!("Deregistered {} targets from {}", to_deregister.len(), set);
        }
    }

    Ok(outcome)
}

/// Remove every registration from the given sets; used while tearing down
pub async fn detach_all(backend: &dyn CloudBackend, sets: &[TargetSetId], batch_size: usize) -> Result<usize> {
    let mut removed = 0;
    let batch_size = batch_size.max(1);

    for set in sets {
        let current = match backend.describe_targets(set).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e.into()),
        };

        for chunk in current.chunks(batch_size) {
            match backend.deregister_targets(set, chunk).await {
                Ok(()) => removed += chunk.len(),
                Err(e) if e.is_not_found() => break,
                Err(e) => {
                    return Err(ControllerError::PartialFailure(format!(
                        "detaching targets from {}: {}",
                        set, e
                    )))
                }
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::ops;
    use crate::cloud::{CloudError, MemoryCloud};
    use crate::config::Config;
    use crate::constants::options as keys;
    use crate::reconcilers::loadbalancer::ensure_load_balancer;
    use crate::test_utils::{exposure, instance};
    use crate::translate::translate;
    use crate::types::BackendEndpoint;
    use std::sync::Arc;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            cluster_name: "test".to_string(),
            target_batch_size: 2,
            ..Config::default()
        }
    }

    fn cloud_with_nodes(count: u32) -> Arc<MemoryCloud> {
        let cloud = Arc::new(MemoryCloud::new("test-1"));
        for n in 1..=count {
            cloud.add_instance(instance(&format!("node-{}", n), n));
        }
        cloud
    }

    fn endpoint(address: &str, node: &str, ready: bool) -> BackendEndpoint {
        BackendEndpoint {
            address: address.to_string(),
            node_name: Some(node.to_string()),
            ready,
            ports: BTreeMap::from([(String::new(), 8080)]),
        }
    }

    fn network(nodes: &[&str]) -> ServiceExposure {
        let mut exp = exposure("default", "web", &[(80, 8080, 30080)], nodes);
        exp.options.insert(keys::KIND.to_string(), "network".to_string());
        exp
    }

    async fn converge(cloud: &Arc<MemoryCloud>, exp: &ServiceExposure) -> TargetOutcome {
        let cfg = config();
        let desired = translate(exp, &cfg).unwrap();
        ensure_load_balancer(cloud.as_ref(), &desired, "test").await.unwrap();
        let cache = InstanceCache::new(cloud.clone(), Duration::from_secs(60));
        let members = desired_members(exp, &desired, &cache).await.unwrap();
        reconcile_targets(cloud.as_ref(), &members, cfg.target_batch_size)
            .await
            .unwrap()
    }

    fn group_set(exp: &ServiceExposure) -> TargetSetId {
        let desired = translate(exp, &config()).unwrap();
        TargetSetId::TargetGroup(desired.target_groups[0].name.clone())
    }

    #[tokio::test]
    async fn test_registers_every_eligible_node() {
        let cloud = cloud_with_nodes(3);
        let exp = network(&["node-1", "node-2", "node-3"]);

        let outcome = converge(&cloud, &exp).await;

        assert_eq!(outcome.registered, 3);
        assert_eq!(cloud.targets(&group_set(&exp)).len(), 3);
        // Batches of two
        assert_eq!(cloud.call_count(ops::REGISTER_TARGETS), 2);
    }

    #[tokio::test]
    async fn test_converges_after_node_removal() {
        let cloud = cloud_with_nodes(3);
        converge(&cloud, &network(&["node-1", "node-2", "node-3"])).await;

        let exp = network(&["node-1", "node-3"]);
        let outcome = converge(&cloud, &exp).await;

        assert_eq!(outcome.registered, 0);
        assert_eq!(outcome.deregistered, 1);
        let ids: Vec<_> = cloud.targets(&group_set(&exp)).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["i-0000000001".to_string(), "i-0000000003".to_string()]);
    }

    #[tokio::test]
    async fn test_second_pass_is_a_noop() {
        let cloud = cloud_with_nodes(2);
        let exp = network(&["node-1", "node-2"]);
        converge(&cloud, &exp).await;

        let before = cloud.mutation_count();
        let outcome = converge(&cloud, &exp).await;

        assert_eq!(outcome.changes(), 0);
        assert_eq!(cloud.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_local_policy_only_targets_hosting_nodes() {
        let cloud = cloud_with_nodes(3);
        let mut exp = network(&["node-1", "node-2", "node-3"]);
        exp.traffic_policy = TrafficPolicy::Local;
        exp.endpoints = vec![
            endpoint("10.1.0.1", "node-2", true),
            endpoint("10.1.0.2", "node-3", false),
        ];

        converge(&cloud, &exp).await;

        let ids: Vec<_> = cloud.targets(&group_set(&exp)).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["i-0000000002".to_string()]);
    }

    #[tokio::test]
    async fn test_ip_mode_registers_ready_pods() {
        let cloud = cloud_with_nodes(2);
        let mut exp = network(&["node-1", "node-2"]);
        exp.options.insert(keys::TARGET_TYPE.to_string(), "ip".to_string());
        exp.endpoints = vec![
            endpoint("10.1.0.1", "node-1", true),
            endpoint("10.1.0.2", "node-2", true),
            endpoint("10.1.0.3", "node-2", false),
        ];

        converge(&cloud, &exp).await;

        let targets = cloud.targets(&group_set(&exp));
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.port == Some(8080)));
    }

    #[tokio::test]
    async fn test_named_target_port_resolved_per_endpoint() {
        let cloud = cloud_with_nodes(1);
        let mut exp = network(&["node-1"]);
        exp.options.insert(keys::TARGET_TYPE.to_string(), "ip".to_string());
        exp.ports[0].target_port = TargetPort::Named("http".to_string());
        let mut named = endpoint("10.1.0.1", "node-1", true);
        named.ports = BTreeMap::from([("http".to_string(), 9000)]);
        exp.endpoints = vec![named, endpoint("10.1.0.2", "node-1", true)];

        let cfg = config();
        let desired = translate(&exp, &cfg).unwrap();
        let cache = InstanceCache::new(cloud.clone(), Duration::from_secs(60));
        let members = desired_members(&exp, &desired, &cache).await.unwrap();

        let targets: Vec<_> = members.sets.values().flatten().cloned().collect();
        assert_eq!(
            targets,
            vec![Target {
                id: "10.1.0.1".to_string(),
                port: Some(9000)
            }]
        );
        assert!(members.traffic_ports.contains(&(Protocol::Tcp, 9000)));
    }

    #[tokio::test]
    async fn test_deregistration_failure_does_not_stop_pass() {
        let cloud = cloud_with_nodes(2);
        converge(&cloud, &network(&["node-1", "node-2"])).await;
        cloud.fail_next(ops::DEREGISTER_TARGETS, CloudError::Throttled("busy".to_string()));

        let outcome = converge(&cloud, &network(&["node-1"])).await;

        assert_eq!(outcome.failed_deregistrations, 1);
        assert_eq!(outcome.deregistered, 0);
    }

    #[tokio::test]
    async fn test_unknown_instance_fails_pass() {
        let cloud = cloud_with_nodes(1);
        let exp = network(&["node-1", "node-9"]);
        let desired = translate(&exp, &config()).unwrap();
        let cache = InstanceCache::new(cloud.clone(), Duration::from_secs(60));

        let err = desired_members(&exp, &desired, &cache).await.unwrap_err();
        assert!(matches!(err, ControllerError::InstanceLookup { .. }));
    }

    #[tokio::test]
    async fn test_detach_all_empties_sets() {
        let cloud = cloud_with_nodes(3);
        let exp = network(&["node-1", "node-2", "node-3"]);
        converge(&cloud, &exp).await;

        let set = group_set(&exp);
        let removed = detach_all(cloud.as_ref(), &[set.clone()], 2).await.unwrap();

        assert_eq!(removed, 3);
        assert!(cloud.targets(&set).is_empty());
        assert_eq!(
            detach_all(cloud.as_ref(), &[TargetSetId::TargetGroup("gone".to_string())], 2)
                .await
                .unwrap(),
            0
        );
    }
}
