// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Typed view over the `cloudlb.io/*` annotation bag.
//!
//! Every accepted option is listed in [`OPTION_TABLE`] with its type, default and
//! bounds. Unknown keys and malformed values are rejected here, before any backend call.

use crate::constants::options as keys;
use crate::types::{HealthCheckPort, HealthCheckProtocol, LoadBalancerKind, Scheme, Tags, TargetMode};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    Enum(&'static [&'static str]),
    Bool,
    /// Unsigned integer within inclusive bounds
    Number { min: u32, max: u32 },
    /// `traffic-port` or a port number
    HealthCheckPort,
    /// Comma separated, non-empty items
    List,
    /// Absolute URL path
    Path,
    /// `key=value` pairs separated by commas
    TagMap,
}

#[derive(Debug, Clone, Copy)]
pub struct OptionDef {
    pub key: &'static str,
    pub ty: OptionType,
    pub default: Option<&'static str>,
}

pub const OPTION_TABLE: &[OptionDef] = &[
    OptionDef { key: keys::KIND, ty: OptionType::Enum(&["classic", "network"]), default: Some("classic") },
    OptionDef { key: keys::SCHEME, ty: OptionType::Enum(&["internet-facing", "internal"]), default: Some("internet-facing") },
    OptionDef { key: keys::SUBNETS, ty: OptionType::List, default: None },
    OptionDef { key: keys::EXTRA_SECURITY_GROUPS, ty: OptionType::List, default: None },
    OptionDef { key: keys::TARGET_TYPE, ty: OptionType::Enum(&["instance", "ip"]), default: Some("instance") },
    OptionDef { key: keys::IDLE_TIMEOUT, ty: OptionType::Number { min: 1, max: 4000 }, default: None },
    OptionDef { key: keys::PROXY_PROTOCOL, ty: OptionType::Bool, default: Some("false") },
    OptionDef { key: keys::CROSS_ZONE, ty: OptionType::Bool, default: Some("false") },
    OptionDef { key: keys::HC_PROTOCOL, ty: OptionType::Enum(&["tcp", "http"]), default: None },
    OptionDef { key: keys::HC_PORT, ty: OptionType::HealthCheckPort, default: None },
    OptionDef { key: keys::HC_PATH, ty: OptionType::Path, default: None },
    OptionDef { key: keys::HC_INTERVAL, ty: OptionType::Number { min: 5, max: 300 }, default: Some("10") },
    OptionDef { key: keys::HC_TIMEOUT, ty: OptionType::Number { min: 2, max: 120 }, default: Some("5") },
    OptionDef { key: keys::HC_HEALTHY_THRESHOLD, ty: OptionType::Number { min: 2, max: 10 }, default: Some("2") },
    OptionDef { key: keys::HC_UNHEALTHY_THRESHOLD, ty: OptionType::Number { min: 2, max: 10 }, default: None },
    OptionDef { key: keys::ADDITIONAL_TAGS, ty: OptionType::TagMap, default: None },
];

/// Tag key prefixes users may not set through `additional-tags`
const RESERVED_TAG_PREFIXES: &[&str] = &["cloudlb.io/", "kubernetes.io/cluster/"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum OptionValue {
    Text(String),
    Bool(bool),
    Number(u32),
    Port(HealthCheckPort),
    List(Vec<String>),
    Tags(Tags),
}

impl OptionType {
    fn parse(&self, raw: &str) -> Result<OptionValue, String> {
        let raw = raw.trim();
        match self {
            OptionType::Enum(allowed) => {
                if allowed.contains(&raw) {
                    Ok(OptionValue::Text(raw.to_string()))
                } else {
                    Err(format!("'{}' is not one of {}", raw, allowed.join(", ")))
                }
            }
            OptionType::Bool => match raw {
                "true" => Ok(OptionValue::Bool(true)),
                "false" => Ok(OptionValue::Bool(false)),
                other => Err(format!("'{}' is not a boolean", other)),
            },
            OptionType::Number { min, max } => {
                let value: u32 = raw
                    .parse()
                    .map_err(|_| format!("'{}' is not a non-negative integer", raw))?;
                if value < *min || value > *max {
                    return Err(format!("{} is outside {}..={}", value, min, max));
                }
                Ok(OptionValue::Number(value))
            }
            OptionType::HealthCheckPort => {
                if raw == "traffic-port" {
                    return Ok(OptionValue::Port(HealthCheckPort::TrafficPort));
                }
                match raw.parse::<u16>() {
                    Ok(port) if port > 0 => Ok(OptionValue::Port(HealthCheckPort::Explicit(port))),
                    _ => Err(format!("'{}' is neither 'traffic-port' nor a port number", raw)),
                }
            }
            OptionType::List => {
                let items: Vec<String> = raw.split(',').map(|s| s.trim().to_string()).collect();
                if items.iter().any(String::is_empty) {
                    return Err("list contains an empty item".to_string());
                }
                Ok(OptionValue::List(items))
            }
            OptionType::Path => {
                if raw.starts_with('/') && !raw.contains(char::is_whitespace) {
                    Ok(OptionValue::Text(raw.to_string()))
                } else {
                    Err(format!("'{}' is not an absolute path", raw))
                }
            }
            OptionType::TagMap => {
                let mut tags = Tags::new();
                for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    let (key, value) = pair
                        .split_once('=')
                        .ok_or_else(|| format!("tag '{}' is not key=value", pair))?;
                    let key = key.trim();
                    if key.is_empty() {
                        return Err(format!("tag '{}' has an empty key", pair));
                    }
                    if RESERVED_TAG_PREFIXES.iter().any(|p| key.starts_with(p)) {
                        return Err(format!("tag key '{}' is reserved", key));
                    }
                    tags.insert(key.to_string(), value.trim().to_string());
                }
                Ok(OptionValue::Tags(tags))
            }
        }
    }
}

pub fn lookup(key: &str) -> Option<&'static OptionDef> {
    OPTION_TABLE.iter().find(|d| d.key == key)
}

/// Validated load-balancer options with table defaults applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerOptions {
    pub kind: LoadBalancerKind,
    pub scheme: Scheme,
    pub subnets: Vec<String>,
    pub extra_security_groups: Vec<String>,
    pub target_mode: TargetMode,
    pub idle_timeout_secs: Option<u32>,
    pub proxy_protocol: bool,
    pub cross_zone: bool,
    pub hc_protocol: Option<HealthCheckProtocol>,
    pub hc_port: Option<HealthCheckPort>,
    pub hc_path: Option<String>,
    pub hc_interval_secs: u32,
    pub hc_timeout_secs: u32,
    pub hc_healthy_threshold: u32,
    pub hc_unhealthy_threshold: Option<u32>,
    pub additional_tags: Tags,
}

impl LoadBalancerOptions {
    /// Parse the annotation bag, reporting every problem found at once
    pub fn parse(raw: &BTreeMap<String, String>) -> Result<Self, Vec<String>> {
        let mut values: BTreeMap<&'static str, OptionValue> = BTreeMap::new();
        let mut problems = Vec::new();

        for (key, value) in raw {
            match lookup(key) {
                None => problems.push(format!("unknown option {}", key)),
                Some(def) => match def.ty.parse(value) {
                    Ok(parsed) => {
                        values.insert(def.key, parsed);
                    }
                    Err(e) => problems.push(format!("{}: {}", key, e)),
                },
            }
        }

        for def in OPTION_TABLE {
            if let (Some(default), false) = (def.default, values.contains_key(def.key)) {
                match def.ty.parse(default) {
                    Ok(parsed) => {
                        values.insert(def.key, parsed);
                    }
                    Err(e) => problems.push(format!("default for {}: {}", def.key, e)),
                }
            }
        }

        if !problems.is_empty() {
            return Err(problems);
        }

        let text = |key: &str| match values.get(key) {
            Some(OptionValue::Text(s)) => Some(s.as_str()),
            _ => None,
        };
        let flag = |key: &str| matches!(values.get(key), Some(OptionValue::Bool(true)));
        let number = |key: &str| match values.get(key) {
            Some(OptionValue::Number(n)) => Some(*n),
            _ => None,
        };
        let list = |key: &str| match values.get(key) {
            Some(OptionValue::List(items)) => items.clone(),
            _ => Vec::new(),
        };

        Ok(LoadBalancerOptions {
            kind: match text(keys::KIND) {
                Some("network") => LoadBalancerKind::Network,
                _ => LoadBalancerKind::Classic,
            },
            scheme: match text(keys::SCHEME) {
                Some("internal") => Scheme::Internal,
                _ => Scheme::InternetFacing,
            },
            subnets: list(keys::SUBNETS),
            extra_security_groups: list(keys::EXTRA_SECURITY_GROUPS),
            target_mode: match text(keys::TARGET_TYPE) {
                Some("ip") => TargetMode::Ip,
                _ => TargetMode::Instance,
            },
            idle_timeout_secs: number(keys::IDLE_TIMEOUT),
            proxy_protocol: flag(keys::PROXY_PROTOCOL),
            cross_zone: flag(keys::CROSS_ZONE),
            hc_protocol: text(keys::HC_PROTOCOL).map(|p| match p {
                "http" => HealthCheckProtocol::Http,
                _ => HealthCheckProtocol::Tcp,
            }),
            hc_port: match values.get(keys::HC_PORT) {
                Some(OptionValue::Port(port)) => Some(*port),
                _ => None,
            },
            hc_path: text(keys::HC_PATH).map(str::to_string),
            hc_interval_secs: number(keys::HC_INTERVAL).unwrap_or(10),
            hc_timeout_secs: number(keys::HC_TIMEOUT).unwrap_or(5),
            hc_healthy_threshold: number(keys::HC_HEALTHY_THRESHOLD).unwrap_or(2),
            hc_unhealthy_threshold: number(keys::HC_UNHEALTHY_THRESHOLD),
            additional_tags: match values.get(keys::ADDITIONAL_TAGS) {
                Some(OptionValue::Tags(tags)) => tags.clone(),
                _ => Tags::new(),
            },
        })
    }
}
