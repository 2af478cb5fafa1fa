// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Shared outbound call budget for the cloud backend.
//!
//! Every worker goes through one [`ThrottledBackend`], which draws from a single token
//! bucket, bounds each call with a timeout, and aborts outstanding calls once the
//! shutdown grace period is over.

use super::{CloudBackend, CloudError, CloudResult};
use crate::types::{
    CreateLoadBalancer, HealthCheck, InstanceRecord, Listener, LoadBalancerAttributes, ObservedLoadBalancer,
    RuleFilter, SecurityRule, Tags, Target, TargetGroup, TargetGroupSpec, TargetSetId,
};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiter; callers are suspended, not failed, until `max_wait` runs out
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    max_wait: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(refill_per_sec: f64, burst: u32, max_wait: Duration) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            refill_per_sec,
            max_wait,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for a refill when the bucket is empty
    pub async fn acquire(&self, op: &str) -> CloudResult<()> {
        let deadline = Instant::now() + self.max_wait;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
            };

            if Instant::now() + wait > deadline {
                warn!(operation = %op, "Cloud call budget exhausted, giving up");
                return Err(CloudError::Throttled(format!(
                    "no call budget for {} within {:?}",
                    op, self.max_wait
                )));
            }

            debug!(operation = %op, wait_ms = wait.as_millis() as u64, "Waiting for call budget");
            sleep(wait).await;
        }
    }
}

pub struct ThrottledBackend {
    inner: Arc<dyn CloudBackend>,
    limiter: Arc<RateLimiter>,
    call_timeout: Duration,
    abort: CancellationToken,
}

impl ThrottledBackend {
    pub fn new(
        inner: Arc<dyn CloudBackend>,
        limiter: Arc<RateLimiter>,
        call_timeout: Duration,
        abort: CancellationToken,
    ) -> Self {
        Self {
            inner,
            limiter,
            call_timeout,
            abort,
        }
    }

    async fn call<T, F>(&self, op: &'static str, request: F) -> CloudResult<T>
    where
        F: Future<Output = CloudResult<T>> + Send,
    {
        let guarded = async {
            self.limiter.acquire(op).await?;
            timeout(self.call_timeout, request)
                .await
                .map_err(|_| CloudError::Timeout(op.to_string()))?
        };

        tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(CloudError::Cancelled),
            result = guarded => result,
        }
    }
}

#[async_trait]
impl CloudBackend for ThrottledBackend {
    async fn describe_load_balancer(&self, name: &str) -> CloudResult<Option<ObservedLoadBalancer>> {
        self.call("describe_load_balancer", self.inner.describe_load_balancer(name))
            .await
    }

    async fn create_load_balancer(&self, request: &CreateLoadBalancer) -> CloudResult<ObservedLoadBalancer> {
        self.call("create_load_balancer", self.inner.create_load_balancer(request))
            .await
    }

    async fn update_load_balancer_attributes(
        &self,
        name: &str,
        attributes: &LoadBalancerAttributes,
    ) -> CloudResult<()> {
        self.call(
            "update_load_balancer_attributes",
            self.inner.update_load_balancer_attributes(name, attributes),
        )
        .await
    }

    async fn delete_load_balancer(&self, name: &str) -> CloudResult<()> {
        self.call("delete_load_balancer", self.inner.delete_load_balancer(name))
            .await
    }

    async fn create_listener(&self, load_balancer: &str, listener: &Listener) -> CloudResult<()> {
        self.call("create_listener", self.inner.create_listener(load_balancer, listener))
            .await
    }

    async fn update_listener(&self, load_balancer: &str, listener: &Listener) -> CloudResult<()> {
        self.call("update_listener", self.inner.update_listener(load_balancer, listener))
            .await
    }

    async fn delete_listener(&self, load_balancer: &str, listener: &Listener) -> CloudResult<()> {
        self.call("delete_listener", self.inner.delete_listener(load_balancer, listener))
            .await
    }

    async fn describe_target_groups(&self, tags: &Tags) -> CloudResult<Vec<TargetGroup>> {
        self.call("describe_target_groups", self.inner.describe_target_groups(tags))
            .await
    }

    async fn create_target_group(&self, spec: &TargetGroupSpec) -> CloudResult<TargetGroup> {
        self.call("create_target_group", self.inner.create_target_group(spec))
            .await
    }

    async fn update_target_group_health_check(&self, name: &str, health_check: &HealthCheck) -> CloudResult<()> {
        self.call(
            "update_target_group_health_check",
            self.inner.update_target_group_health_check(name, health_check),
        )
        .await
    }

    async fn delete_target_group(&self, name: &str) -> CloudResult<()> {
        self.call("delete_target_group", self.inner.delete_target_group(name))
            .await
    }

    async fn describe_targets(&self, set: &TargetSetId) -> CloudResult<Vec<Target>> {
        self.call("describe_targets", self.inner.describe_targets(set)).await
    }

    async fn register_targets(&self, set: &TargetSetId, targets: &[Target]) -> CloudResult<()> {
        self.call("register_targets", self.inner.register_targets(set, targets))
            .await
    }

    async fn deregister_targets(&self, set: &TargetSetId, targets: &[Target]) -> CloudResult<()> {
        self.call("deregister_targets", self.inner.deregister_targets(set, targets))
            .await
    }

    async fn describe_security_rules(&self, filter: &RuleFilter) -> CloudResult<Vec<SecurityRule>> {
        self.call("describe_security_rules", self.inner.describe_security_rules(filter))
            .await
    }

    async fn authorize_security_rules(&self, rules: &[SecurityRule]) -> CloudResult<()> {
        self.call("authorize_security_rules", self.inner.authorize_security_rules(rules))
            .await
    }

    async fn revoke_security_rules(&self, rules: &[SecurityRule]) -> CloudResult<()> {
        self.call("revoke_security_rules", self.inner.revoke_security_rules(rules))
            .await
    }

    async fn describe_instances(&self, node_names: &[String]) -> CloudResult<Vec<InstanceRecord>> {
        self.call("describe_instances", self.inner.describe_instances(node_names))
            .await
    }
}
