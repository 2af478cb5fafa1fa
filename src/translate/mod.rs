// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Desired-state translation: `ServiceExposure` → [`DesiredLoadBalancerSpec`].
//!
//! Translation is a pure function. Any error it returns is a validation error and is
//! terminal for the inputs that produced it.

pub mod naming;
pub mod options;

use crate::config::Config;
use crate::constants::LOCAL_HEALTH_CHECK_PATH;
use crate::error::{ControllerError, Result};
use crate::types::{
    HealthCheck, HealthCheckPort, HealthCheckProtocol, Listener, ListenerBackend, LoadBalancerAttributes,
    LoadBalancerKind, Protocol, Scheme, ServiceExposure, Tags, TargetGroupSpec, TargetMode, TargetPort,
    TrafficPolicy,
};
use options::LoadBalancerOptions;
use std::collections::BTreeSet;
use std::net::IpAddr;

const ANYWHERE: &str = "0.0.0.0/0";
const DEFAULT_IDLE_TIMEOUT_SECS: u32 = 60;
const CLASSIC_UNHEALTHY_THRESHOLD: u32 = 6;
const NETWORK_UNHEALTHY_THRESHOLD: u32 = 2;

/// One validated Service port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub name: Option<String>,
    pub protocol: Protocol,
    pub port: u16,
    /// Absent only in IP target mode, where traffic bypasses node ports
    pub node_port: Option<u16>,
    pub target_port: TargetPort,
    /// Target group fed by this port (network load balancers only)
    pub target_group: Option<String>,
}

/// Everything the lifecycle, target and security stages need, fixed for one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredLoadBalancerSpec {
    pub name: String,
    pub uid: String,
    pub kind: LoadBalancerKind,
    pub scheme: Scheme,
    pub target_mode: TargetMode,
    pub ports: Vec<PortMapping>,
    pub listeners: Vec<Listener>,
    pub target_groups: Vec<TargetGroupSpec>,
    pub attributes: LoadBalancerAttributes,
    pub health_check: HealthCheck,
    pub tags: Tags,
    /// Tag subset used to find this Service's resources again
    pub lookup_tags: Tags,
    /// CIDRs allowed to reach the exposed ports
    pub source_ranges: Vec<String>,
    /// Owner marker for security rules
    pub rule_owner: String,
    pub traffic_policy: TrafficPolicy,
}

impl DesiredLoadBalancerSpec {
    /// Whether `observed` differs in an attribute that cannot be changed in place
    pub fn requires_recreate(&self, kind: LoadBalancerKind, scheme: Scheme, mode: TargetMode) -> bool {
        self.kind != kind || self.scheme != scheme || self.target_mode != mode
    }
}

fn invalid(message: impl Into<String>) -> ControllerError {
    ControllerError::Validation(message.into())
}

pub fn translate(exposure: &ServiceExposure, config: &Config) -> Result<DesiredLoadBalancerSpec> {
    let options = LoadBalancerOptions::parse(&exposure.options).map_err(|problems| invalid(problems.join("; ")))?;

    check_option_conflicts(&options)?;

    let ports = map_ports(exposure, &options)?;
    let health_check = build_health_check(exposure, &options, &ports)?;
    let name = naming::load_balancer_name(&exposure.uid);

    let mut tags = options.additional_tags.clone();
    tags.extend(naming::ownership_tags(&config.cluster_name, exposure));

    let (listeners, target_groups) = match options.kind {
        LoadBalancerKind::Classic => {
            let listeners = ports
                .iter()
                .filter_map(|p| {
                    p.node_port.map(|node_port| Listener {
                        protocol: p.protocol,
                        port: p.port,
                        backend: ListenerBackend::InstancePort(node_port),
                    })
                })
                .collect();
            (listeners, Vec::new())
        }
        LoadBalancerKind::Network => {
            let mut listeners = Vec::new();
            let mut groups = Vec::new();
            for mapping in &ports {
                let Some(group_name) = mapping.target_group.clone() else {
                    continue;
                };
                groups.push(TargetGroupSpec {
                    name: group_name.clone(),
                    protocol: mapping.protocol,
                    port: group_port(options.target_mode, mapping.port, mapping.node_port, &mapping.target_port),
                    mode: options.target_mode,
                    health_check: health_check.clone(),
                    tags: tags.clone(),
                });
                listeners.push(Listener {
                    protocol: mapping.protocol,
                    port: mapping.port,
                    backend: ListenerBackend::TargetGroup(group_name),
                });
            }
            (listeners, groups)
        }
    };

    let mut subnets = options.subnets.clone();
    subnets.sort();
    subnets.dedup();
    let mut security_groups = options.extra_security_groups.clone();
    security_groups.sort();
    security_groups.dedup();

    let attributes = LoadBalancerAttributes {
        idle_timeout_secs: match options.kind {
            LoadBalancerKind::Classic => Some(options.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)),
            LoadBalancerKind::Network => None,
        },
        proxy_protocol: options.proxy_protocol,
        cross_zone: options.cross_zone,
        subnets,
        security_groups,
        health_check: match options.kind {
            LoadBalancerKind::Classic => Some(health_check.clone()),
            LoadBalancerKind::Network => None,
        },
    };

    Ok(DesiredLoadBalancerSpec {
        name,
        uid: exposure.uid.clone(),
        kind: options.kind,
        scheme: options.scheme,
        target_mode: options.target_mode,
        ports,
        listeners,
        target_groups,
        attributes,
        health_check,
        tags,
        lookup_tags: naming::lookup_tags(&config.cluster_name, &exposure.uid),
        source_ranges: source_ranges(exposure, options.scheme, config)?,
        rule_owner: naming::rule_owner(&config.cluster_name, &exposure.uid),
        traffic_policy: exposure.traffic_policy,
    })
}

fn check_option_conflicts(options: &LoadBalancerOptions) -> Result<()> {
    if options.kind == LoadBalancerKind::Classic && options.target_mode == TargetMode::Ip {
        return Err(invalid("target-type ip requires kind network"));
    }
    if options.kind == LoadBalancerKind::Network && options.idle_timeout_secs.is_some() {
        return Err(invalid("idle-timeout is only supported by kind classic"));
    }
    if options.hc_timeout_secs >= options.hc_interval_secs {
        return Err(invalid(format!(
            "healthcheck-timeout ({}s) must be shorter than healthcheck-interval ({}s)",
            options.hc_timeout_secs, options.hc_interval_secs
        )));
    }
    Ok(())
}

fn map_ports(exposure: &ServiceExposure, options: &LoadBalancerOptions) -> Result<Vec<PortMapping>> {
    if exposure.ports.is_empty() {
        return Err(invalid("service exposes no ports"));
    }

    let mut seen = BTreeSet::new();
    let mut mappings = Vec::with_capacity(exposure.ports.len());

    for port in &exposure.ports {
        let protocol = match port.protocol.as_str() {
            "TCP" => Protocol::Tcp,
            "UDP" => Protocol::Udp,
            other => return Err(invalid(format!("protocol {} is not supported", other))),
        };
        if protocol == Protocol::Udp && options.kind == LoadBalancerKind::Classic {
            return Err(invalid("UDP ports require kind network"));
        }

        let service_port = u16::try_from(port.port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| invalid(format!("port {} is out of range", port.port)))?;

        if !seen.insert((protocol, service_port)) {
            return Err(invalid(format!("duplicate port {}/{}", protocol, service_port)));
        }

        let node_port = match port.node_port {
            Some(n) => Some(
                u16::try_from(n)
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| invalid(format!("node port {} is out of range", n)))?,
            ),
            None => None,
        };
        if node_port.is_none() && options.target_mode == TargetMode::Instance {
            return Err(invalid(format!(
                "port {}/{} has no node port allocated, required by target-type instance",
                protocol, service_port
            )));
        }

        mappings.push(PortMapping {
            name: port.name.clone(),
            protocol,
            port: service_port,
            node_port,
            target_port: port.target_port.clone(),
            target_group: match options.kind {
                LoadBalancerKind::Network => Some(naming::target_group_name(
                    &exposure.uid,
                    protocol,
                    service_port,
                    group_port(options.target_mode, service_port, node_port, &port.target_port),
                )),
                LoadBalancerKind::Classic => None,
            },
        });
    }

    Ok(mappings)
}

/// Port a target group forwards to: the node port for instance targets, the pod port for IP targets
fn group_port(mode: TargetMode, service_port: u16, node_port: Option<u16>, target_port: &TargetPort) -> u16 {
    match (mode, node_port, target_port) {
        (TargetMode::Instance, Some(node_port), _) => node_port,
        (TargetMode::Ip, _, TargetPort::Number(n)) => u16::try_from(*n).unwrap_or(service_port),
        _ => service_port,
    }
}

fn build_health_check(
    exposure: &ServiceExposure,
    options: &LoadBalancerOptions,
    ports: &[PortMapping],
) -> Result<HealthCheck> {
    // Local traffic policy gets kube-proxy's per-node health endpoint unless overridden
    let local_check_port = match (exposure.traffic_policy, exposure.health_check_node_port) {
        (TrafficPolicy::Local, Some(port)) => Some(
            u16::try_from(port)
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| invalid(format!("health check node port {} is out of range", port)))?,
        ),
        _ => None,
    };

    let protocol = options.hc_protocol.unwrap_or(if local_check_port.is_some() {
        HealthCheckProtocol::Http
    } else {
        HealthCheckProtocol::Tcp
    });

    if options.hc_path.is_some() && protocol != HealthCheckProtocol::Http {
        return Err(invalid("healthcheck-path requires healthcheck-protocol http"));
    }

    let mut port = options
        .hc_port
        .or(local_check_port.map(HealthCheckPort::Explicit))
        .unwrap_or(HealthCheckPort::TrafficPort);

    // A classic load balancer has a single check, pinned to the first traffic port
    if options.kind == LoadBalancerKind::Classic && port == HealthCheckPort::TrafficPort {
        let first = ports
            .iter()
            .find_map(|p| p.node_port)
            .ok_or_else(|| invalid("no node port available for the health check"))?;
        port = HealthCheckPort::Explicit(first);
    }

    let path = match protocol {
        HealthCheckProtocol::Http => Some(options.hc_path.clone().unwrap_or_else(|| {
            if local_check_port.is_some() {
                LOCAL_HEALTH_CHECK_PATH.to_string()
            } else {
                "/".to_string()
            }
        })),
        HealthCheckProtocol::Tcp => None,
    };

    Ok(HealthCheck {
        protocol,
        port,
        path,
        interval_secs: options.hc_interval_secs,
        timeout_secs: options.hc_timeout_secs,
        healthy_threshold: options.hc_healthy_threshold,
        unhealthy_threshold: options.hc_unhealthy_threshold.unwrap_or(match options.kind {
            LoadBalancerKind::Classic => CLASSIC_UNHEALTHY_THRESHOLD,
            LoadBalancerKind::Network => NETWORK_UNHEALTHY_THRESHOLD,
        }),
    })
}

fn source_ranges(exposure: &ServiceExposure, scheme: Scheme, config: &Config) -> Result<Vec<String>> {
    let mut ranges: Vec<String> = if !exposure.source_ranges.is_empty() {
        exposure.source_ranges.iter().map(|r| r.trim().to_string()).collect()
    } else if scheme == Scheme::Internal {
        config.internal_source_ranges.clone()
    } else {
        vec![ANYWHERE.to_string()]
    };

    for range in &ranges {
        if !is_cidr(range) {
            return Err(invalid(format!("source range '{}' is not a CIDR", range)));
        }
    }
    ranges.sort();
    ranges.dedup();
    Ok(ranges)
}

/// Whether `value` is an IPv4 or IPv6 network in `address/prefix` form
pub fn is_cidr(value: &str) -> bool {
    let Some((address, prefix)) = value.split_once('/') else {
        return false;
    };
    let Ok(address) = address.parse::<IpAddr>() else {
        return false;
    };
    let max = if address.is_ipv4() { 32 } else { 128 };
    prefix.parse::<u8>().is_ok_and(|p| p <= max)
}
