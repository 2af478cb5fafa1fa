// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Test utilities: a mock Kubernetes API, object fixtures and an in-memory exposure store.

use crate::constants::kubernetes as k8s;
use crate::error::Result;
use crate::kubernetes::store::{EventSeverity, ExposureStore};
use crate::types::{ExposedPort, InstanceRecord, ReconciliationKey, ServiceExposure, TargetPort, TrafficPolicy};
use async_trait::async_trait;
use http::{Request, Response};
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::client::Body;
use kube::Client;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service as TowerService;

/// A mock HTTP service that returns predefined responses based on request paths.
#[derive(Clone)]
pub struct MockService {
    responses: Arc<Mutex<HashMap<(String, String), (u16, String)>>>,
    requests: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn on(self, method: &str, path: &str, status: u16, body: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), (status, body.to_string()));
        self
    }

    /// Add a response for GET requests matching the exact path
    pub fn on_get(self, path: &str, status: u16, body: &str) -> Self {
        self.on("GET", path, status, body)
    }

    /// Add a response for PATCH requests matching the exact path
    pub fn on_patch(self, path: &str, status: u16, body: &str) -> Self {
        self.on("PATCH", path, status, body)
    }

    /// Build a kube Client from this mock service
    pub fn into_client(self) -> Client {
        Client::new(self, "default")
    }

    /// Whether a request with this method and exact path was received
    pub fn was_called(&self, method: &str, path: &str) -> bool {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .any(|(m, p)| m == method && p == path)
    }

    fn find_response(&self, method: &str, path: &str) -> Option<(u16, String)> {
        let responses = self.responses.lock().unwrap();

        // Exact match only; the store hits sibling paths (service vs. service/status)
        responses.get(&(method.to_string(), path.to_string())).cloned()
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl TowerService<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        self.requests.lock().unwrap().push((method.clone(), path.clone()));
        let response = self.find_response(&method, &path);

        Box::pin(async move {
            let (status, body) = response.unwrap_or_else(|| (404, not_found_json("resource", &path)));
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(body.into_bytes()))
                .unwrap())
        })
    }
}

/// Create a 404 not found response
pub fn not_found_json(resource: &str, name: &str) -> String {
    serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": format!("{} \"{}\" not found", resource, name),
        "reason": "NotFound",
        "code": 404
    })
    .to_string()
}

/// Wrap objects in a Kubernetes list response
pub fn list_json<T: Serialize>(kind: &str, api_version: &str, items: &[T]) -> String {
    serde_json::json!({
        "kind": kind,
        "apiVersion": api_version,
        "metadata": { "resourceVersion": "1" },
        "items": items,
    })
    .to_string()
}

/// A `type: LoadBalancer` Service with `(port, target_port, node_port)` TCP ports
pub fn lb_service(namespace: &str, name: &str, uid: &str, ports: &[(i32, i32, i32)]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(k8s::LOAD_BALANCER_TYPE.to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port, target, node_port)| ServicePort {
                        name: Some(format!("p{}", port)),
                        protocol: Some("TCP".to_string()),
                        port: *port,
                        target_port: Some(IntOrString::Int(*target)),
                        node_port: Some(*node_port),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn with_annotations(mut service: Service, annotations: &[(&str, &str)]) -> Service {
    let existing = service.metadata.annotations.get_or_insert_with(BTreeMap::new);
    for (k, v) in annotations {
        existing.insert(k.to_string(), v.to_string());
    }
    service
}

pub fn with_finalizer(mut service: Service) -> Service {
    service
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(k8s::FINALIZER.to_string());
    service
}

fn node(name: &str, ready: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn ready_node(name: &str) -> Node {
    node(name, true)
}

pub fn not_ready_node(name: &str) -> Node {
    node(name, false)
}

/// One EndpointSlice for `service` with `(address, node, ready)` endpoints on an unnamed port
pub fn endpoint_slice(namespace: &str, service: &str, endpoints: &[(&str, &str, bool)], port: i32) -> EndpointSlice {
    EndpointSlice {
        metadata: ObjectMeta {
            name: Some(format!("{}-abc12", service)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                k8s::SERVICE_NAME_LABEL.to_string(),
                service.to_string(),
            )])),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: endpoints
            .iter()
            .map(|(address, node, ready)| Endpoint {
                addresses: vec![address.to_string()],
                node_name: Some(node.to_string()),
                conditions: Some(EndpointConditions {
                    ready: Some(*ready),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
        ports: Some(vec![EndpointPort {
            port: Some(port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
    }
}

/// Deterministic UID-shaped identifier for a fixture Service
pub fn uid_for(namespace: &str, name: &str) -> String {
    let seed = format!("{}/{}", namespace, name)
        .bytes()
        .fold(0xcbf29ce484222325u64, |hash, b| (hash ^ u64::from(b)).wrapping_mul(0x100000001b3));
    format!("{:08x}-0000-4000-8000-{:012x}", seed >> 32, seed & 0xffff_ffff_ffff)
}

/// A ready-to-translate exposure built without going through Kubernetes objects
pub fn exposure(namespace: &str, name: &str, ports: &[(i32, i32, i32)], nodes: &[&str]) -> ServiceExposure {
    ServiceExposure {
        key: ReconciliationKey::new(namespace, name),
        uid: uid_for(namespace, name),
        ports: ports
            .iter()
            .map(|(port, target, node_port)| ExposedPort {
                name: Some(format!("p{}", port)),
                protocol: "TCP".to_string(),
                port: *port,
                target_port: TargetPort::Number(*target),
                node_port: Some(*node_port),
            })
            .collect(),
        options: BTreeMap::new(),
        source_ranges: Vec::new(),
        traffic_policy: TrafficPolicy::Cluster,
        health_check_node_port: None,
        endpoints: Vec::new(),
        nodes: nodes.iter().map(|n| n.to_string()).collect(),
        ingress: Vec::new(),
        guarded: false,
        deleting: false,
        wants_load_balancer: true,
    }
}

/// Instance `i-{n}` backing `node_name`, in the shared node security group
pub fn instance(node_name: &str, n: u32) -> InstanceRecord {
    InstanceRecord {
        node_name: node_name.to_string(),
        instance_id: format!("i-{:010}", n),
        availability_zone: "test-1a".to_string(),
        private_address: format!("10.0.0.{}", n),
        security_groups: vec!["sg-nodes".to_string()],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub key: ReconciliationKey,
    pub severity: EventSeverity,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
struct StoreState {
    exposures: BTreeMap<ReconciliationKey, ServiceExposure>,
    events: Vec<RecordedEvent>,
    status_updates: usize,
}

/// [`ExposureStore`] over a map, mimicking the API server's finalizer semantics:
/// releasing the guard on a deleting exposure removes it.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, exposure: ServiceExposure) {
        self.state
            .lock()
            .unwrap()
            .exposures
            .insert(exposure.key.clone(), exposure);
    }

    pub fn exposure(&self, key: &ReconciliationKey) -> Option<ServiceExposure> {
        self.state.lock().unwrap().exposures.get(key).cloned()
    }

    /// Apply `edit` to a stored exposure
    pub fn update(&self, key: &ReconciliationKey, edit: impl FnOnce(&mut ServiceExposure)) {
        if let Some(exposure) = self.state.lock().unwrap().exposures.get_mut(key) {
            edit(exposure);
        }
    }

    /// Request deletion; unguarded exposures disappear immediately
    pub fn delete(&self, key: &ReconciliationKey) {
        let mut state = self.state.lock().unwrap();
        let remove = match state.exposures.get_mut(key) {
            Some(exposure) if exposure.guarded => {
                exposure.deleting = true;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            state.exposures.remove(key);
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn events_with_reason(&self, reason: &str) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }

    pub fn status_updates(&self) -> usize {
        self.state.lock().unwrap().status_updates
    }
}

#[async_trait]
impl ExposureStore for MemoryStore {
    async fn get(&self, key: &ReconciliationKey) -> Result<Option<ServiceExposure>> {
        Ok(self.exposure(key))
    }

    async fn add_guard(&self, key: &ReconciliationKey) -> Result<()> {
        self.update(key, |e| e.guarded = true);
        Ok(())
    }

    async fn remove_guard(&self, key: &ReconciliationKey) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let remove = match state.exposures.get_mut(key) {
            Some(exposure) => {
                exposure.guarded = false;
                exposure.deleting
            }
            None => false,
        };
        if remove {
            state.exposures.remove(key);
        }
        Ok(())
    }

    async fn update_ingress(&self, key: &ReconciliationKey, hostnames: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.status_updates += 1;
        if let Some(exposure) = state.exposures.get_mut(key) {
            exposure.ingress = hostnames.to_vec();
        }
        Ok(())
    }

    async fn record_event(&self, exposure: &ServiceExposure, severity: EventSeverity, reason: &str, note: String) {
        self.state.lock().unwrap().events.push(RecordedEvent {
            key: exposure.key.clone(),
            severity,
            reason: reason.to_string(),
            note,
        });
    }
}
