// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The controller's view of a `type: LoadBalancer` Service.
//!
//! A [`ServiceExposure`] is assembled from the Service itself, its EndpointSlices and the
//! cluster's Nodes, so every later stage works on one consistent snapshot.

use crate::constants::{kubernetes as k8s, OPTION_PREFIX};
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Queue identity of a Service: namespace and name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconciliationKey {
    pub namespace: String,
    pub name: String,
}

impl ReconciliationKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_service(service: &Service) -> Self {
        Self::new(service.namespace().unwrap_or_default(), service.name_any())
    }
}

impl fmt::Display for ReconciliationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TrafficPolicy {
    /// Any eligible node may receive traffic and forward it across the cluster
    #[default]
    Cluster,
    /// Only nodes hosting a ready endpoint receive traffic
    Local,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetPort {
    Number(i32),
    Named(String),
}

/// One Service port as declared; validated by the translator, not here
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExposedPort {
    pub name: Option<String>,
    pub protocol: String,
    pub port: i32,
    pub target_port: TargetPort,
    pub node_port: Option<i32>,
}

/// A backend endpoint selected by the Service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub address: String,
    pub node_name: Option<String>,
    pub ready: bool,
    /// Endpoint ports keyed by port name (empty string for an unnamed port)
    pub ports: BTreeMap<String, u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceExposure {
    pub key: ReconciliationKey,
    pub uid: String,
    pub ports: Vec<ExposedPort>,
    /// Annotations under the controller's prefix; everything else is ignored
    pub options: BTreeMap<String, String>,
    pub source_ranges: Vec<String>,
    pub traffic_policy: TrafficPolicy,
    pub health_check_node_port: Option<i32>,
    pub endpoints: Vec<BackendEndpoint>,
    /// Nodes eligible to receive load-balancer traffic, sorted
    pub nodes: Vec<String>,
    /// Hostnames currently published in the Service status
    pub ingress: Vec<String>,
    /// Whether the deletion guard is present
    pub guarded: bool,
    pub deleting: bool,
    /// Whether the Service still asks for a load balancer at all
    pub wants_load_balancer: bool,
}

impl ServiceExposure {
    /// Assemble an exposure from its Kubernetes objects.
    ///
    /// Returns `None` for objects that have not been persisted yet (no UID).
    pub fn from_objects(service: &Service, slices: &[EndpointSlice], nodes: &[Node]) -> Option<Self> {
        let uid = service.metadata.uid.clone()?;
        let spec = service.spec.as_ref();

        let wants_load_balancer = spec
            .and_then(|s| s.type_.as_deref())
            .is_some_and(|t| t == k8s::LOAD_BALANCER_TYPE)
            && spec.and_then(|s| s.load_balancer_class.as_ref()).is_none();

        let ports = spec
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|p| ExposedPort {
                        name: p.name.clone().filter(|n| !n.is_empty()),
                        protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                        port: p.port,
                        target_port: match &p.target_port {
                            Some(IntOrString::Int(n)) => TargetPort::Number(*n),
                            Some(IntOrString::String(s)) => TargetPort::Named(s.clone()),
                            None => TargetPort::Number(p.port),
                        },
                        node_port: p.node_port,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let options = service
            .annotations()
            .iter()
            .filter(|(k, _)| k.starts_with(OPTION_PREFIX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let traffic_policy = match spec.and_then(|s| s.external_traffic_policy.as_deref()) {
            Some("Local") => TrafficPolicy::Local,
            _ => TrafficPolicy::Cluster,
        };

        let ingress = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|ingress| {
                ingress
                    .iter()
                    .filter_map(|i| i.hostname.clone().or_else(|| i.ip.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let mut eligible: Vec<String> = nodes
            .iter()
            .filter(|n| is_node_eligible(n))
            .map(|n| n.name_any())
            .collect();
        eligible.sort();

        Some(ServiceExposure {
            key: ReconciliationKey::from_service(service),
            uid,
            ports,
            options,
            source_ranges: spec
                .and_then(|s| s.load_balancer_source_ranges.clone())
                .unwrap_or_default(),
            traffic_policy,
            health_check_node_port: spec.and_then(|s| s.health_check_node_port),
            endpoints: collect_endpoints(slices),
            nodes: eligible,
            ingress,
            guarded: service.finalizers().iter().any(|f| f == k8s::FINALIZER),
            deleting: service.metadata.deletion_timestamp.is_some(),
            wants_load_balancer,
        })
    }

    /// Whether this pass must tear the load balancer down instead of converging it
    pub fn needs_teardown(&self) -> bool {
        self.deleting || !self.wants_load_balancer
    }

    /// Stable hash of every input the translator reads.
    ///
    /// Two exposures with the same fingerprint translate to the same result, so a
    /// validation failure recorded against a fingerprint stays valid until it changes.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.uid.hash(&mut hasher);
        self.ports.hash(&mut hasher);
        self.options.hash(&mut hasher);
        self.source_ranges.hash(&mut hasher);
        self.traffic_policy.hash(&mut hasher);
        self.health_check_node_port.hash(&mut hasher);
        hasher.finish()
    }

    /// Ready endpoints, the only ones that may receive traffic
    pub fn ready_endpoints(&self) -> impl Iterator<Item = &BackendEndpoint> {
        self.endpoints.iter().filter(|e| e.ready)
    }
}

/// A node may receive traffic when it reports Ready and is not explicitly excluded
pub fn is_node_eligible(node: &Node) -> bool {
    if node.labels().contains_key(k8s::EXCLUDE_FROM_LB_LABEL) {
        return false;
    }

    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn collect_endpoints(slices: &[EndpointSlice]) -> Vec<BackendEndpoint> {
    let mut endpoints = Vec::new();

    for slice in slices {
        let ports: BTreeMap<String, u16> = slice
            .ports
            .as_ref()
            .map(|ports| {
                ports
                    .iter()
                    .filter_map(|p| {
                        let port = u16::try_from(p.port?).ok()?;
                        Some((p.name.clone().unwrap_or_default(), port))
                    })
                    .collect()
            })
            .unwrap_or_default();

        for endpoint in &slice.endpoints {
            // A missing ready condition means ready, per the EndpointSlice API
            let ready = endpoint
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true);

            for address in &endpoint.addresses {
                endpoints.push(BackendEndpoint {
                    address: address.clone(),
                    node_name: endpoint.node_name.clone(),
                    ready,
                    ports: ports.clone(),
                });
            }
        }
    }

    endpoints.sort_by(|a, b| a.address.cmp(&b.address));
    endpoints.dedup_by(|a, b| a.address == b.address);
    endpoints
}
