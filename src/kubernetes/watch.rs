// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Triggers that feed the Service controller besides the Services themselves.
//!
//! EndpointSlices map to the Service they belong to, but only for Services we track.
//! Nodes are watched directly so that deletions are seen as deletions: they invalidate
//! the instance cache and, like eligibility flips, trigger every Service. Status
//! heartbeats alone trigger nothing.

use crate::constants::kubernetes as k8s;
use crate::error::Result;
use crate::instances::InstanceCache;
use crate::types::{is_node_eligible, ReconciliationKey};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::{stream, Stream, StreamExt};
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, ResourceExt};
use kube_runtime::watcher::{self, Event};
use kube_runtime::WatchStreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Services currently handled by the controller
#[derive(Clone, Default)]
pub struct TrackedServices(Arc<Mutex<HashSet<ReconciliationKey>>>);

impl TrackedServices {
    fn lock(&self) -> MutexGuard<'_, HashSet<ReconciliationKey>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, key: ReconciliationKey) {
        self.lock().insert(key);
    }

    pub fn remove(&self, key: &ReconciliationKey) -> bool {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &ReconciliationKey) -> bool {
        self.lock().contains(key)
    }

    /// The Service an EndpointSlice belongs to, if we track it
    pub fn service_for_slice(&self, slice: &EndpointSlice) -> Option<ObjectRef<Service>> {
        let name = slice.labels().get(k8s::SERVICE_NAME_LABEL)?;
        let namespace = slice.namespace().unwrap_or_default();
        let key = ReconciliationKey::new(namespace.clone(), name.clone());
        if !self.contains(&key) {
            return None;
        }
        debug!("Endpoints of {} changed", key);
        Some(ObjectRef::new(name).within(&namespace))
    }
}

/// Signals that every Service should be reconciled again
pub type NodeChanges = UnboundedReceiver<()>;

#[derive(Default)]
struct NodeState {
    eligibility: HashMap<String, bool>,
    /// Nodes seen while a (re)list is in progress
    relist: Option<HashMap<String, bool>>,
    listed: bool,
}

/// Tracks node eligibility and reports the changes that matter to load balancers
pub struct NodeWatch {
    instances: InstanceCache,
    state: Mutex<NodeState>,
    changes: UnboundedSender<()>,
}

impl NodeWatch {
    pub fn new(instances: InstanceCache) -> (Self, NodeChanges) {
        let (changes, receiver) = mpsc::unbounded();
        let watch = Self {
            instances,
            state: Mutex::new(NodeState::default()),
            changes,
        };
        (watch, receiver)
    }

    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        if self.changes.unbounded_send(()).is_err() {
            debug!("Node change dropped, controller is gone");
        }
    }

    pub async fn on_node(&self, event: Event<Node>) {
        let mut removed = Vec::new();
        let changed = {
            let mut state = self.state();
            match event {
                Event::Init => {
                    state.relist = Some(HashMap::new());
                    false
                }
                Event::InitApply(node) => {
                    let eligible = is_node_eligible(&node);
                    state.relist.get_or_insert_with(HashMap::new).insert(node.name_any(), eligible);
                    false
                }
                Event::InitDone => {
                    let fresh = state.relist.take().unwrap_or_default();
                    removed = state
                        .eligibility
                        .keys()
                        .filter(|name| !fresh.contains_key(*name))
                        .cloned()
                        .collect();
                    let flipped = fresh
                        .iter()
                        .any(|(name, eligible)| state.eligibility.get(name).copied().unwrap_or(false) != *eligible);
                    let was_listed = state.listed;
                    state.eligibility = fresh;
                    state.listed = true;
                    // The first list is covered by the controller's own initial reconcile
                    was_listed && (flipped || !removed.is_empty())
                }
                Event::Apply(node) => {
                    let name = node.name_any();
                    let eligible = is_node_eligible(&node);
                    let previous = state.eligibility.insert(name.clone(), eligible);
                    let flipped = previous.unwrap_or(false) != eligible;
                    if flipped {
                        info!("Node {} is now {}", name, if eligible { "eligible" } else { "ineligible" });
                    }
                    flipped
                }
                Event::Delete(node) => {
                    let name = node.name_any();
                    info!("Node {} removed", name);
                    state.eligibility.remove(&name);
                    removed.push(name);
                    true
                }
            }
        };

        for name in &removed {
            self.instances.invalidate(name).await;
        }
        if changed {
            self.notify();
        }
    }

    /// Watch nodes until `shutdown` fires
    pub async fn run(self, client: Client, shutdown: CancellationToken) -> Result<()> {
        let nodes: Api<Node> = Api::all(client);
        let events = watcher::watcher(nodes, watcher::Config::default())
            .default_backoff()
            .filter_map(|result| async move {
                match result {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!("Node watch error: {}", e);
                        None
                    }
                }
            });

        info!("Watching nodes");
        let watch = &self;
        tokio::select! {
            _ = shutdown.cancelled() => info!("Stopping node watch"),
            _ = events.for_each(|event| async move { watch.on_node(event).await }) => {
                warn!("Node watch ended unexpectedly");
            }
        }
        Ok(())
    }
}

/// Periodic full resync ticks; the first one fires after one `period`
pub fn resync_ticks(period: Duration) -> impl Stream<Item = ()> + Send + Sync + 'static {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    stream::unfold(ticker, |mut ticker| async move {
        ticker.tick().await;
        debug!("Periodic resync");
        Some(((), ticker))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::ops;
    use crate::cloud::MemoryCloud;
    use crate::test_utils::{endpoint_slice, instance, not_ready_node, ready_node};
    use futures::FutureExt;

    fn node_watch() -> (NodeWatch, NodeChanges, Arc<MemoryCloud>) {
        let cloud = Arc::new(MemoryCloud::new("test-1"));
        let instances = InstanceCache::new(cloud.clone(), Duration::from_secs(60));
        let (watch, changes) = NodeWatch::new(instances);
        (watch, changes, cloud)
    }

    fn pending(changes: &mut NodeChanges) -> usize {
        let mut count = 0;
        while let Some(Some(())) = changes.next().now_or_never() {
            count += 1;
        }
        count
    }

    async fn initial_list(watch: &NodeWatch, nodes: Vec<Node>) {
        watch.on_node(Event::Init).await;
        for node in nodes {
            watch.on_node(Event::InitApply(node)).await;
        }
        watch.on_node(Event::InitDone).await;
    }

    #[test]
    fn test_only_tracked_services_follow_their_slices() {
        let tracked = TrackedServices::default();
        tracked.insert(ReconciliationKey::new("default", "web"));

        let web = endpoint_slice("default", "web", &[("10.0.1.1", "n1", true)], 8080);
        let other = endpoint_slice("default", "other", &[("10.0.1.2", "n1", true)], 8080);

        assert_eq!(
            tracked.service_for_slice(&web),
            Some(ObjectRef::new("web").within("default"))
        );
        assert_eq!(tracked.service_for_slice(&other), None);

        tracked.remove(&ReconciliationKey::new("default", "web"));
        assert_eq!(tracked.service_for_slice(&web), None);
    }

    #[tokio::test]
    async fn test_node_heartbeat_does_not_trigger() {
        let (watch, mut changes, _) = node_watch();
        initial_list(&watch, vec![ready_node("node-1")]).await;
        assert_eq!(pending(&mut changes), 0);

        watch.on_node(Event::Apply(ready_node("node-1"))).await;
        assert_eq!(pending(&mut changes), 0);

        watch.on_node(Event::Apply(not_ready_node("node-1"))).await;
        assert_eq!(pending(&mut changes), 1);
    }

    #[tokio::test]
    async fn test_node_removal_invalidates_cache() {
        let (watch, mut changes, cloud) = node_watch();
        cloud.add_instance(instance("node-1", 1));
        watch.instances.get("node-1").await.unwrap();
        initial_list(&watch, vec![ready_node("node-1")]).await;

        watch.on_node(Event::Delete(ready_node("node-1"))).await;

        assert_eq!(pending(&mut changes), 1);
        watch.instances.get("node-1").await.unwrap();
        assert_eq!(cloud.call_count(ops::DESCRIBE_INSTANCES), 2);
    }

    #[tokio::test]
    async fn test_relist_notices_nodes_removed_while_disconnected() {
        let (watch, mut changes, cloud) = node_watch();
        cloud.add_instance(instance("node-2", 2));
        initial_list(&watch, vec![ready_node("node-1"), ready_node("node-2")]).await;
        watch.instances.get("node-2").await.unwrap();

        // Same nodes again: nothing to do
        initial_list(&watch, vec![ready_node("node-1"), ready_node("node-2")]).await;
        assert_eq!(pending(&mut changes), 0);

        initial_list(&watch, vec![ready_node("node-1")]).await;
        assert_eq!(pending(&mut changes), 1);
        watch.instances.get("node-2").await.unwrap();
        assert_eq!(cloud.call_count(ops::DESCRIBE_INSTANCES), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_ticks_once_per_period() {
        let mut ticks = Box::pin(resync_ticks(Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(ticks.next().now_or_never().is_none());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(ticks.next().await, Some(()));
    }
}
