// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Abstract cloud backend capability.
//!
//! The controller only ever talks to the cloud through [`CloudBackend`]. Deletes of
//! resources that are already gone report [`CloudError::NotFound`]; callers decide
//! whether that counts as success.

pub mod memory;
pub mod throttle;

pub use memory::MemoryCloud;
pub use throttle::{RateLimiter, ThrottledBackend};

use crate::types::{
    CreateLoadBalancer, HealthCheck, InstanceRecord, Listener, LoadBalancerAttributes, ObservedLoadBalancer,
    RuleFilter, SecurityRule, Tags, Target, TargetGroup, TargetGroupSpec, TargetSetId,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("{kind} {id} is still in use")]
    ResourceInUse { kind: &'static str, id: String },

    #[error("Request throttled: {0}")]
    Throttled(String),

    #[error("Call {0} timed out")]
    Timeout(String),

    #[error("Call cancelled by shutdown")]
    Cancelled,

    #[error("Request rejected: {0}")]
    InvalidRequest(String),

    #[error("Backend failure: {message}")]
    Backend { message: String, retryable: bool },
}

impl CloudError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CloudError::NotFound { kind, id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            CloudError::InvalidRequest(_) => false,
            CloudError::Backend { retryable, .. } => *retryable,
            _ => true,
        }
    }
}

pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Treat "already absent" as success for idempotent deletes
pub fn ignore_not_found(result: CloudResult<()>) -> CloudResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Look a load balancer up by its deterministic name
    async fn describe_load_balancer(&self, name: &str) -> CloudResult<Option<ObservedLoadBalancer>>;

    async fn create_load_balancer(&self, request: &CreateLoadBalancer) -> CloudResult<ObservedLoadBalancer>;

    async fn update_load_balancer_attributes(
        &self,
        name: &str,
        attributes: &LoadBalancerAttributes,
    ) -> CloudResult<()>;

    async fn delete_load_balancer(&self, name: &str) -> CloudResult<()>;

    async fn create_listener(&self, load_balancer: &str, listener: &Listener) -> CloudResult<()>;

    /// Replace the listener bound to the same (protocol, port)
    async fn update_listener(&self, load_balancer: &str, listener: &Listener) -> CloudResult<()>;

    async fn delete_listener(&self, load_balancer: &str, listener: &Listener) -> CloudResult<()>;

    /// List target groups carrying every given tag
    async fn describe_target_groups(&self, tags: &Tags) -> CloudResult<Vec<TargetGroup>>;

    async fn create_target_group(&self, spec: &TargetGroupSpec) -> CloudResult<TargetGroup>;

    async fn update_target_group_health_check(&self, name: &str, health_check: &HealthCheck) -> CloudResult<()>;

    async fn delete_target_group(&self, name: &str) -> CloudResult<()>;

    async fn describe_targets(&self, set: &TargetSetId) -> CloudResult<Vec<Target>>;

    async fn register_targets(&self, set: &TargetSetId, targets: &[Target]) -> CloudResult<()>;

    async fn deregister_targets(&self, set: &TargetSetId, targets: &[Target]) -> CloudResult<()>;

    async fn describe_security_rules(&self, filter: &RuleFilter) -> CloudResult<Vec<SecurityRule>>;

    async fn authorize_security_rules(&self, rules: &[SecurityRule]) -> CloudResult<()>;

    async fn revoke_security_rules(&self, rules: &[SecurityRule]) -> CloudResult<()>;

    /// Resolve node names to instances; unknown nodes are simply absent from the result
    async fn describe_instances(&self, node_names: &[String]) -> CloudResult<Vec<InstanceRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(CloudError::not_found("load balancer", "a1"))).is_ok());
        assert!(ignore_not_found(Err(CloudError::Throttled("slow down".to_string()))).is_err());
    }

    #[test]
    fn test_retryability() {
        assert!(CloudError::Timeout("describe".to_string()).is_retryable());
        assert!(!CloudError::InvalidRequest("bad".to_string()).is_retryable());
        assert!(!CloudError::Backend {
            message: "quota".to_string(),
            retryable: false
        }
        .is_retryable());
    }
}
