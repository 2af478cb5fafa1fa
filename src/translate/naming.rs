// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Deterministic names and tags derived from a Service's identity.
//!
//! These are what let a restarted controller find the resources it created before the
//! crash: nothing is looked up by a remembered identifier.

use crate::constants::tags;
use crate::types::{Protocol, ServiceExposure, Tags};

const MAX_NAME_LEN: usize = 32;

fn uid_hex(uid: &str) -> String {
    uid.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// `a` followed by the first 31 UID characters
pub fn load_balancer_name(uid: &str) -> String {
    let mut name = String::from("a");
    name.extend(uid_hex(uid).chars().take(MAX_NAME_LEN - 1));
    name
}

/// One target group per (protocol, port) of a network load balancer.
///
/// The port the group forwards to is part of the name, so a changed node or target port
/// produces a new group instead of silently reusing one that points at the old port.
pub fn target_group_name(uid: &str, protocol: Protocol, port: u16, target_port: u16) -> String {
    let hex: String = uid_hex(uid).chars().take(14).collect();
    format!("t{}-{}-{}-{}", hex, protocol.as_str(), port, target_port)
}

pub fn cluster_tag_key(cluster_name: &str) -> String {
    format!("{}{}", tags::CLUSTER_PREFIX, cluster_name)
}

/// Tags identifying every resource that belongs to `exposure`
pub fn ownership_tags(cluster_name: &str, exposure: &ServiceExposure) -> Tags {
    Tags::from([
        (cluster_tag_key(cluster_name), tags::CLUSTER_OWNED.to_string()),
        (tags::SERVICE_UID.to_string(), exposure.uid.clone()),
        (tags::SERVICE_NAME.to_string(), exposure.key.to_string()),
    ])
}

/// Tag subset used to query the backend for a Service's resources
pub fn lookup_tags(cluster_name: &str, uid: &str) -> Tags {
    Tags::from([
        (cluster_tag_key(cluster_name), tags::CLUSTER_OWNED.to_string()),
        (tags::SERVICE_UID.to_string(), uid.to_string()),
    ])
}

/// Whether `resource_tags` mark the resource as owned by this Service
pub fn is_owned(resource_tags: &Tags, cluster_name: &str, uid: &str) -> bool {
    lookup_tags(cluster_name, uid)
        .iter()
        .all(|(k, v)| resource_tags.get(k) == Some(v))
}

/// Owner marker carried by security rules
pub fn rule_owner(cluster_name: &str, uid: &str) -> String {
    format!("cloudlb:{}:{}", cluster_name, uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID: &str = "6f0c2b5e-1d3a-4c8b-9e7f-0a1b2c3d4e5f";

    #[test]
    fn test_load_balancer_name_is_deterministic_and_bounded() {
        let name = load_balancer_name(UID);
        assert_eq!(name, "a6f0c2b5e1d3a4c8b9e7f0a1b2c3d4e5");
        assert_eq!(name.len(), 32);
        assert_eq!(name, load_balancer_name(UID));
    }

    #[test]
    fn test_target_group_name_includes_port() {
        let name = target_group_name(UID, Protocol::Tcp, 443, 30443);
        assert_eq!(name, "t6f0c2b5e1d3a4c-tcp-443-30443");
        assert!(name.len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_target_group_name_follows_target_port() {
        assert_ne!(
            target_group_name(UID, Protocol::Tcp, 80, 30080),
            target_group_name(UID, Protocol::Tcp, 80, 31080)
        );
        let longest = target_group_name(UID, Protocol::Udp, 65535, 65535);
        assert!(longest.len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_is_owned_requires_matching_uid() {
        let tags = lookup_tags("prod", UID);
        assert!(is_owned(&tags, "prod", UID));
        assert!(!is_owned(&tags, "prod", "other-uid"));
        assert!(!is_owned(&tags, "staging", UID));
        assert!(!is_owned(&Tags::new(), "prod", UID));
    }
}
