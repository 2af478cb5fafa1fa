// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Value snapshots of cloud-backend resources.
//!
//! Everything fetched from the backend is held as an owned, immutable value for the
//! duration of one reconciliation pass; no handle outlives the pass that fetched it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type Tags = BTreeMap<String, String>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerKind {
    /// Single-object load balancer; targets register directly on it
    Classic,
    /// Listener + target-group load balancer
    Network,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    InternetFacing,
    Internal,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    Instance,
    Ip,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckProtocol {
    Tcp,
    Http,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HealthCheckPort {
    /// Probe the same port traffic is forwarded to
    TrafficPort,
    Explicit(u16),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HealthCheck {
    pub protocol: HealthCheckProtocol,
    pub port: HealthCheckPort,
    pub path: Option<String>,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

/// Where a listener forwards its traffic
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ListenerBackend {
    /// Classic load balancers forward straight to a port on the registered instances
    InstancePort(u16),
    /// Network load balancers forward to a named target group
    TargetGroup(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Listener {
    pub protocol: Protocol,
    pub port: u16,
    pub backend: ListenerBackend,
}

impl Listener {
    pub fn key(&self) -> (Protocol, u16) {
        (self.protocol, self.port)
    }
}

/// Mutable-in-place load balancer attributes
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct LoadBalancerAttributes {
    pub idle_timeout_secs: Option<u32>,
    pub proxy_protocol: bool,
    pub cross_zone: bool,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    /// Only classic load balancers carry a health check on the load balancer itself
    pub health_check: Option<HealthCheck>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TargetGroupSpec {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    pub mode: TargetMode,
    pub health_check: HealthCheck,
    pub tags: Tags,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TargetGroup {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    pub mode: TargetMode,
    pub health_check: HealthCheck,
    pub tags: Tags,
    /// Load balancer the group is attached to, if any
    pub load_balancer: Option<String>,
}

/// A registration on a target set; `port` overrides the set's default port
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub id: String,
    pub port: Option<u16>,
}

/// The thing targets register against
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetSetId {
    LoadBalancer(String),
    TargetGroup(String),
}

impl fmt::Display for TargetSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSetId::LoadBalancer(name) => write!(f, "load-balancer/{}", name),
            TargetSetId::TargetGroup(name) => write!(f, "target-group/{}", name),
        }
    }
}

/// Everything needed to create a load balancer shell
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CreateLoadBalancer {
    pub name: String,
    pub kind: LoadBalancerKind,
    pub scheme: Scheme,
    pub target_mode: TargetMode,
    pub listeners: Vec<Listener>,
    pub attributes: LoadBalancerAttributes,
    pub tags: Tags,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObservedLoadBalancer {
    pub name: String,
    pub dns_name: String,
    pub kind: LoadBalancerKind,
    pub scheme: Scheme,
    pub target_mode: TargetMode,
    pub listeners: Vec<Listener>,
    pub attributes: LoadBalancerAttributes,
    pub tags: Tags,
}

/// An ingress rule on a security group
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecurityRule {
    pub group_id: String,
    pub protocol: Protocol,
    pub from_port: u16,
    pub to_port: u16,
    pub source: String,
    /// Ownership marker; `None` for rules created by anyone but this controller
    pub owner: Option<String>,
}

impl SecurityRule {
    /// The (group, protocol, port range, source) tuple, ignoring ownership
    pub fn tuple(&self) -> (&str, Protocol, u16, u16, &str) {
        (&self.group_id, self.protocol, self.from_port, self.to_port, &self.source)
    }
}

impl fmt::Display for SecurityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}-{} from {}",
            self.group_id, self.protocol, self.from_port, self.to_port, self.source
        )
    }
}

/// Filter for security rule listings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleFilter {
    pub group_ids: Option<Vec<String>>,
    pub owner: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InstanceRecord {
    pub node_name: String,
    pub instance_id: String,
    pub availability_zone: String,
    pub private_address: String,
    pub security_groups: Vec<String>,
}
