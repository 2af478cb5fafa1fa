// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! In-memory cloud backend.
//!
//! Behaves like an eventually-consistent load-balancer API with strict resource
//! dependencies (a target group in use cannot be deleted, listeners need their target
//! group, and so on). Failures can be injected per operation, and every successful
//! mutating call is counted.

use super::{CloudBackend, CloudError, CloudResult};
use crate::types::{
    CreateLoadBalancer, HealthCheck, InstanceRecord, Listener, ListenerBackend, LoadBalancerAttributes,
    LoadBalancerKind, ObservedLoadBalancer, RuleFilter, SecurityRule, Tags, Target, TargetGroup,
    TargetGroupSpec, TargetSetId,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Operation names accepted by [`MemoryCloud::fail_next`]
pub mod ops {
    pub const DESCRIBE_LOAD_BALANCER: &str = "describe_load_balancer";
    pub const CREATE_LOAD_BALANCER: &str = "create_load_balancer";
    pub const UPDATE_ATTRIBUTES: &str = "update_load_balancer_attributes";
    pub const DELETE_LOAD_BALANCER: &str = "delete_load_balancer";
    pub const CREATE_LISTENER: &str = "create_listener";
    pub const UPDATE_LISTENER: &str = "update_listener";
    pub const DELETE_LISTENER: &str = "delete_listener";
    pub const DESCRIBE_TARGET_GROUPS: &str = "describe_target_groups";
    pub const CREATE_TARGET_GROUP: &str = "create_target_group";
    pub const UPDATE_TARGET_GROUP: &str = "update_target_group_health_check";
    pub const DELETE_TARGET_GROUP: &str = "delete_target_group";
    pub const DESCRIBE_TARGETS: &str = "describe_targets";
    pub const REGISTER_TARGETS: &str = "register_targets";
    pub const DEREGISTER_TARGETS: &str = "deregister_targets";
    pub const DESCRIBE_RULES: &str = "describe_security_rules";
    pub const AUTHORIZE_RULES: &str = "authorize_security_rules";
    pub const REVOKE_RULES: &str = "revoke_security_rules";
    pub const DESCRIBE_INSTANCES: &str = "describe_instances";
}

#[derive(Default)]
struct State {
    load_balancers: BTreeMap<String, ObservedLoadBalancer>,
    target_groups: BTreeMap<String, TargetGroup>,
    targets: BTreeMap<TargetSetId, BTreeSet<Target>>,
    rules: BTreeSet<SecurityRule>,
    instances: BTreeMap<String, InstanceRecord>,
    dns_counter: u64,
}

impl State {
    fn target_group_mut(&mut self, name: &str) -> CloudResult<&mut TargetGroup> {
        self.target_groups
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found("target group", name))
    }

    fn attach_listener_target(&mut self, load_balancer: &str, listener: &Listener) -> CloudResult<()> {
        if let ListenerBackend::TargetGroup(tg) = &listener.backend {
            let group = self.target_group_mut(tg)?;
            match &group.load_balancer {
                Some(owner) if owner != load_balancer => {
                    return Err(CloudError::ResourceInUse {
                        kind: "target group",
                        id: tg.clone(),
                    })
                }
                _ => group.load_balancer = Some(load_balancer.to_string()),
            }
        }
        Ok(())
    }

    /// Release target groups no listener of `load_balancer` points at any more
    fn detach_unreferenced(&mut self, load_balancer: &str) {
        let referenced: BTreeSet<String> = self
            .load_balancers
            .get(load_balancer)
            .map(|lb| {
                lb.listeners
                    .iter()
                    .filter_map(|l| match &l.backend {
                        ListenerBackend::TargetGroup(tg) => Some(tg.clone()),
                        ListenerBackend::InstancePort(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        for group in self.target_groups.values_mut() {
            if group.load_balancer.as_deref() == Some(load_balancer) && !referenced.contains(&group.name) {
                group.load_balancer = None;
            }
        }
    }

    fn target_set_exists(&self, set: &TargetSetId) -> bool {
        match set {
            TargetSetId::LoadBalancer(name) => self
                .load_balancers
                .get(name)
                .is_some_and(|lb| lb.kind == LoadBalancerKind::Classic),
            TargetSetId::TargetGroup(name) => self.target_groups.contains_key(name),
        }
    }
}

pub struct MemoryCloud {
    region: String,
    state: Mutex<State>,
    faults: Mutex<HashMap<&'static str, VecDeque<CloudError>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    mutations: AtomicUsize,
}

impl MemoryCloud {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            state: Mutex::new(State::default()),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            mutations: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call to `op` fail with `error`; queued errors fire in order
    pub fn fail_next(&self, op: &'static str, error: CloudError) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of successful mutating calls so far
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn call_count(&self, op: &'static str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(op)
            .copied()
            .unwrap_or(0)
    }

    pub fn add_instance(&self, record: InstanceRecord) {
        self.state().instances.insert(record.node_name.clone(), record);
    }

    pub fn remove_instance(&self, node_name: &str) {
        self.state().instances.remove(node_name);
    }

    /// Seed a rule as if another actor had created it
    pub fn add_rule(&self, rule: SecurityRule) {
        self.state().rules.insert(rule);
    }

    pub fn load_balancer(&self, name: &str) -> Option<ObservedLoadBalancer> {
        self.state().load_balancers.get(name).cloned()
    }

    pub fn load_balancers(&self) -> Vec<ObservedLoadBalancer> {
        self.state().load_balancers.values().cloned().collect()
    }

    pub fn target_groups(&self) -> Vec<TargetGroup> {
        self.state().target_groups.values().cloned().collect()
    }

    pub fn targets(&self, set: &TargetSetId) -> Vec<Target> {
        self.state()
            .targets
            .get(set)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rules(&self) -> Vec<SecurityRule> {
        self.state().rules.iter().cloned().collect()
    }

    /// Count every resource still tagged with `uid` or owned by `owner`
    pub fn resources_owned_by(&self, uid_tag: (&str, &str), owner: &str) -> usize {
        let state = self.state();
        let (key, value) = uid_tag;
        let tagged = |tags: &Tags| tags.get(key).is_some_and(|v| v == value);

        let lbs = state.load_balancers.values().filter(|lb| tagged(&lb.tags)).count();
        let tgs = state.target_groups.values().filter(|tg| tagged(&tg.tags)).count();
        let rules = state
            .rules
            .iter()
            .filter(|r| r.owner.as_deref() == Some(owner))
            .count();
        lbs + tgs + rules
    }

    fn enter(&self, op: &'static str) -> CloudResult<()> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(op)
            .or_default() += 1;

        let injected = self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(op)
            .and_then(VecDeque::pop_front);

        match injected {
            Some(error) => {
                debug!("Injected failure for {}: {}", op, error);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CloudBackend for MemoryCloud {
    async fn describe_load_balancer(&self, name: &str) -> CloudResult<Option<ObservedLoadBalancer>> {
        self.enter(ops::DESCRIBE_LOAD_BALANCER)?;
        Ok(self.state().load_balancers.get(name).cloned())
    }

    async fn create_load_balancer(&self, request: &CreateLoadBalancer) -> CloudResult<ObservedLoadBalancer> {
        self.enter(ops::CREATE_LOAD_BALANCER)?;
        let mut state = self.state();

        if state.load_balancers.contains_key(&request.name) {
            return Err(CloudError::AlreadyExists {
                kind: "load balancer",
                id: request.name.clone(),
            });
        }
        for listener in &request.listeners {
            if let ListenerBackend::TargetGroup(tg) = &listener.backend {
                let group = state
                    .target_groups
                    .get(tg)
                    .ok_or_else(|| CloudError::not_found("target group", tg.as_str()))?;
                if group.load_balancer.as_ref().is_some_and(|owner| owner != &request.name) {
                    return Err(CloudError::ResourceInUse {
                        kind: "target group",
                        id: tg.clone(),
                    });
                }
            }
        }

        state.dns_counter += 1;
        let observed = ObservedLoadBalancer {
            name: request.name.clone(),
            dns_name: format!(
                "{}-{:08x}.elb.{}.cloudlb.internal",
                request.name, state.dns_counter, self.region
            ),
            kind: request.kind,
            scheme: request.scheme,
            target_mode: request.target_mode,
            listeners: request.listeners.clone(),
            attributes: request.attributes.clone(),
            tags: request.tags.clone(),
        };
        state.load_balancers.insert(request.name.clone(), observed.clone());
        for listener in &request.listeners {
            state.attach_listener_target(&request.name, listener)?;
        }
        if request.kind == LoadBalancerKind::Classic {
            state
                .targets
                .insert(TargetSetId::LoadBalancer(request.name.clone()), BTreeSet::new());
        }
        drop(state);

        self.mutated();
        Ok(observed)
    }

    async fn update_load_balancer_attributes(
        &self,
        name: &str,
        attributes: &LoadBalancerAttributes,
    ) -> CloudResult<()> {
        self.enter(ops::UPDATE_ATTRIBUTES)?;
        let mut state = self.state();
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found("load balancer", name))?;
        lb.attributes = attributes.clone();
        drop(state);

        self.mutated();
        Ok(())
    }

    async fn delete_load_balancer(&self, name: &str) -> CloudResult<()> {
        self.enter(ops::DELETE_LOAD_BALANCER)?;
        let mut state = self.state();
        if state.load_balancers.remove(name).is_none() {
            return Err(CloudError::not_found("load balancer", name));
        }
        state.detach_unreferenced(name);
        state.targets.remove(&TargetSetId::LoadBalancer(name.to_string()));
        drop(state);

        self.mutated();
        Ok(())
    }

    async fn create_listener(&self, load_balancer: &str, listener: &Listener) -> CloudResult<()> {
        self.enter(ops::CREATE_LISTENER)?;
        let mut state = self.state();
        let exists = state
            .load_balancers
            .get(load_balancer)
            .ok_or_else(|| CloudError::not_found("load balancer", load_balancer))?
            .listeners
            .iter()
            .any(|l| l.key() == listener.key());
        if exists {
            return Err(CloudError::AlreadyExists {
                kind: "listener",
                id: format!("{}:{}/{}", load_balancer, listener.protocol, listener.port),
            });
        }
        state.attach_listener_target(load_balancer, listener)?;
        if let Some(lb) = state.load_balancers.get_mut(load_balancer) {
            lb.listeners.push(listener.clone());
        }
        drop(state);

        self.mutated();
        Ok(())
    }

    async fn update_listener(&self, load_balancer: &str, listener: &Listener) -> CloudResult<()> {
        self.enter(ops::UPDATE_LISTENER)?;
        let mut state = self.state();
        let exists = state
            .load_balancers
            .get(load_balancer)
            .ok_or_else(|| CloudError::not_found("load balancer", load_balancer))?
            .listeners
            .iter()
            .any(|l| l.key() == listener.key());
        if !exists {
            return Err(CloudError::not_found(
                "listener",
                format!("{}:{}", load_balancer, listener.port),
            ));
        }
        state.attach_listener_target(load_balancer, listener)?;
        if let Some(lb) = state.load_balancers.get_mut(load_balancer) {
            for slot in lb.listeners.iter_mut().filter(|l| l.key() == listener.key()) {
                *slot = listener.clone();
            }
        }
        state.detach_unreferenced(load_balancer);
        drop(state);

        self.mutated();
        Ok(())
    }

    async fn delete_listener(&self, load_balancer: &str, listener: &Listener) -> CloudResult<()> {
        self.enter(ops::DELETE_LISTENER)?;
        let mut state = self.state();
        let lb = state
            .load_balancers
            .get_mut(load_balancer)
            .ok_or_else(|| CloudError::not_found("load balancer", load_balancer))?;
        let before = lb.listeners.len();
        lb.listeners.retain(|l| l.key() != listener.key());
        if lb.listeners.len() == before {
            return Err(CloudError::not_found(
                "listener",
                format!("{}:{}", load_balancer, listener.port),
            ));
        }
        state.detach_unreferenced(load_balancer);
        drop(state);

        self.mutated();
        Ok(())
    }

    async fn describe_target_groups(&self, tags: &Tags) -> CloudResult<Vec<TargetGroup>> {
        self.enter(ops::DESCRIBE_TARGET_GROUPS)?;
        Ok(self
            .state()
            .target_groups
            .values()
            .filter(|tg| tags.iter().all(|(k, v)| tg.tags.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn create_target_group(&self, spec: &TargetGroupSpec) -> CloudResult<TargetGroup> {
        self.enter(ops::CREATE_TARGET_GROUP)?;
        let mut state = self.state();
        if state.target_groups.contains_key(&spec.name) {
            return Err(CloudError::AlreadyExists {
                kind: "target group",
                id: spec.name.clone(),
            });
        }
        let group = TargetGroup {
            name: spec.name.clone(),
            protocol: spec.protocol,
            port: spec.port,
            mode: spec.mode,
            health_check: spec.health_check.clone(),
            tags: spec.tags.clone(),
            load_balancer: None,
        };
        state.target_groups.insert(spec.name.clone(), group.clone());
        state
            .targets
            .insert(TargetSetId::TargetGroup(spec.name.clone()), BTreeSet::new());
        drop(state);

        self.mutated();
        Ok(group)
    }

    async fn update_target_group_health_check(&self, name: &str, health_check: &HealthCheck) -> CloudResult<()> {
        self.enter(ops::UPDATE_TARGET_GROUP)?;
        self.state().target_group_mut(name)?.health_check = health_check.clone();
        self.mutated();
        Ok(())
    }

    async fn delete_target_group(&self, name: &str) -> CloudResult<()> {
        self.enter(ops::DELETE_TARGET_GROUP)?;
        let mut state = self.state();
        let group = state
            .target_groups
            .get(name)
            .ok_or_else(|| CloudError::not_found("target group", name))?;
        if group.load_balancer.is_some() {
            return Err(CloudError::ResourceInUse {
                kind: "target group",
                id: name.to_string(),
            });
        }
        state.target_groups.remove(name);
        state.targets.remove(&TargetSetId::TargetGroup(name.to_string()));
        drop(state);

        self.mutated();
        Ok(())
    }

    async fn describe_targets(&self, set: &TargetSetId) -> CloudResult<Vec<Target>> {
        self.enter(ops::DESCRIBE_TARGETS)?;
        let state = self.state();
        if !state.target_set_exists(set) {
            return Err(CloudError::not_found("target set", set.to_string()));
        }
        Ok(state
            .targets
            .get(set)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn register_targets(&self, set: &TargetSetId, targets: &[Target]) -> CloudResult<()> {
        self.enter(ops::REGISTER_TARGETS)?;
        let mut state = self.state();
        if !state.target_set_exists(set) {
            return Err(CloudError::not_found("target set", set.to_string()));
        }
        state.targets.entry(set.clone()).or_default().extend(targets.iter().cloned());
        drop(state);

        self.mutated();
        Ok(())
    }

    async fn deregister_targets(&self, set: &TargetSetId, targets: &[Target]) -> CloudResult<()> {
        self.enter(ops::DEREGISTER_TARGETS)?;
        let mut state = self.state();
        if !state.target_set_exists(set) {
            return Err(CloudError::not_found("target set", set.to_string()));
        }
        if let Some(registered) = state.targets.get_mut(set) {
            for target in targets {
                registered.remove(target);
            }
        }
        drop(state);

        self.mutated();
        Ok(())
    }

    async fn describe_security_rules(&self, filter: &RuleFilter) -> CloudResult<Vec<SecurityRule>> {
        self.enter(ops::DESCRIBE_RULES)?;
        Ok(self
            .state()
            .rules
            .iter()
            .filter(|r| {
                filter
                    .group_ids
                    .as_ref()
                    .map_or(true, |groups| groups.contains(&r.group_id))
            })
            .filter(|r| filter.owner.is_none() || r.owner == filter.owner)
            .cloned()
            .collect())
    }

    async fn authorize_security_rules(&self, rules: &[SecurityRule]) -> CloudResult<()> {
        self.enter(ops::AUTHORIZE_RULES)?;
        let mut state = self.state();
        if let Some(duplicate) = rules.iter().find(|r| state.rules.contains(*r)) {
            return Err(CloudError::AlreadyExists {
                kind: "security rule",
                id: duplicate.to_string(),
            });
        }
        state.rules.extend(rules.iter().cloned());
        drop(state);

        self.mutated();
        Ok(())
    }

    async fn revoke_security_rules(&self, rules: &[SecurityRule]) -> CloudResult<()> {
        self.enter(ops::REVOKE_RULES)?;
        let mut state = self.state();
        if let Some(missing) = rules.iter().find(|r| !state.rules.contains(*r)) {
            return Err(CloudError::not_found("security rule", missing.to_string()));
        }
        for rule in rules {
            state.rules.remove(rule);
        }
        drop(state);

        self.mutated();
        Ok(())
    }

    async fn describe_instances(&self, node_names: &[String]) -> CloudResult<Vec<InstanceRecord>> {
        self.enter(ops::DESCRIBE_INSTANCES)?;
        let state = self.state();
        Ok(node_names
            .iter()
            .filter_map(|n| state.instances.get(n).cloned())
            .collect())
    }
}
