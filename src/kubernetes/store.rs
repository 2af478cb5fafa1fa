// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Orchestrator-side reads and writes for Services.
//!
//! The reconcilers only see [`ExposureStore`]; [`KubeExposureStore`] backs it with the
//! Kubernetes API.

use crate::constants::{kubernetes as k8s, OPERATOR_NAME};
use crate::error::Result;
use crate::types::{ReconciliationKey, ServiceExposure};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::{
    api::{ListParams, Patch, PatchParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

#[async_trait]
pub trait ExposureStore: Send + Sync {
    /// Fresh snapshot of a Service with its endpoints and the eligible nodes
    async fn get(&self, key: &ReconciliationKey) -> Result<Option<ServiceExposure>>;

    async fn add_guard(&self, key: &ReconciliationKey) -> Result<()>;

    /// Drop the deletion guard; a Service that is already gone counts as success
    async fn remove_guard(&self, key: &ReconciliationKey) -> Result<()>;

    async fn update_ingress(&self, key: &ReconciliationKey, hostnames: &[String]) -> Result<()>;

    /// Fire-and-forget event record; failures are logged, never returned
    async fn record_event(&self, exposure: &ServiceExposure, severity: EventSeverity, reason: &str, note: String);
}

pub struct KubeExposureStore {
    client: Client,
    recorder: Recorder,
}

impl KubeExposureStore {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: OPERATOR_NAME.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
        }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Merge-patch the finalizer list, pinned to the resourceVersion we read
    async fn patch_finalizers<F>(&self, key: &ReconciliationKey, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<String>) -> bool + Send,
    {
        let api = self.services(&key.namespace);
        let Some(service) = api.get_opt(&key.name).await? else {
            debug!("Service {} is gone, nothing to patch", key);
            return Ok(());
        };

        let mut finalizers = service.finalizers().to_vec();
        if !edit(&mut finalizers) {
            return Ok(());
        }

        let patch = json!({
            "metadata": {
                "resourceVersion": service.resource_version(),
                "finalizers": finalizers,
            }
        });
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Whether a Service is relevant to this controller at all
pub fn is_managed(service: &Service) -> bool {
    let is_load_balancer = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == k8s::LOAD_BALANCER_TYPE);
    is_load_balancer || service.finalizers().iter().any(|f| f == k8s::FINALIZER)
}

#[async_trait]
impl ExposureStore for KubeExposureStore {
    #[instrument(skip(self), fields(service = %key))]
    async fn get(&self, key: &ReconciliationKey) -> Result<Option<ServiceExposure>> {
        let Some(service) = self.services(&key.namespace).get_opt(&key.name).await? else {
            return Ok(None);
        };

        let slices: Api<EndpointSlice> = Api::namespaced(self.client.clone(), &key.namespace);
        let selector = format!("{}={}", k8s::SERVICE_NAME_LABEL, key.name);
        let slices = slices.list(&ListParams::default().labels(&selector)).await?;

        let nodes: Api<Node> = Api::all(self.client.clone());
        let nodes = nodes.list(&ListParams::default()).await?;

        Ok(ServiceExposure::from_objects(&service, &slices.items, &nodes.items))
    }

    #[instrument(skip(self), fields(service = %key))]
    async fn add_guard(&self, key: &ReconciliationKey) -> Result<()> {
        self.patch_finalizers(key, |finalizers| {
            if finalizers.iter().any(|f| f == k8s::FINALIZER) {
                return false;
            }
            finalizers.push(k8s::FINALIZER.to_string());
            true
        })
        .await?;
        info!("Added deletion guard to {}", key);
        Ok(())
    }

    #[instrument(skip(self), fields(service = %key))]
    async fn remove_guard(&self, key: &ReconciliationKey) -> Result<()> {
        self.patch_finalizers(key, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != k8s::FINALIZER);
            finalizers.len() != before
        })
        .await?;
        info!("Released deletion guard on {}", key);
        Ok(())
    }

    #[instrument(skip(self), fields(service = %key))]
    async fn update_ingress(&self, key: &ReconciliationKey, hostnames: &[String]) -> Result<()> {
        let ingress: Vec<_> = hostnames.iter().map(|h| json!({ "hostname": h })).collect();
        let patch = json!({
            "status": {
                "loadBalancer": {
                    "ingress": ingress,
                }
            }
        });

        self.services(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!("Published load balancer address for {}: {:?}", key, hostnames);
        Ok(())
    }

    async fn record_event(&self, exposure: &ServiceExposure, severity: EventSeverity, reason: &str, note: String) {
        let reference = ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Service".to_string()),
            name: Some(exposure.key.name.clone()),
            namespace: Some(exposure.key.namespace.clone()),
            uid: Some(exposure.uid.clone()),
            ..Default::default()
        };
        let event = Event {
            type_: match severity {
                EventSeverity::Normal => EventType::Normal,
                EventSeverity::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!("Failed to publish {} event for {}: {}", reason, exposure.key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        endpoint_slice, lb_service, list_json, not_found_json, ready_node, with_finalizer, MockService,
    };

    const SERVICE_PATH: &str = "/api/v1/namespaces/default/services/web";
    const SLICES_PATH: &str = "/apis/discovery.k8s.io/v1/namespaces/default/endpointslices";
    const NODES_PATH: &str = "/api/v1/nodes";

    fn service_body(service: &Service) -> String {
        serde_json::to_string(service).unwrap()
    }

    #[tokio::test]
    async fn test_get_assembles_exposure() {
        let service = lb_service("default", "web", "uid-1", &[(80, 8080, 30080)]);
        let slice = endpoint_slice("default", "web", &[("10.0.1.5", "node-a", true)], 8080);
        let client = MockService::new()
            .on_get(SERVICE_PATH, 200, &service_body(&service))
            .on_get(SLICES_PATH, 200, &list_json("EndpointSliceList", "discovery.k8s.io/v1", &[slice]))
            .on_get(NODES_PATH, 200, &list_json("NodeList", "v1", &[ready_node("node-a")]))
            .into_client();

        let store = KubeExposureStore::new(client);
        let exposure = store
            .get(&ReconciliationKey::new("default", "web"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exposure.uid, "uid-1");
        assert_eq!(exposure.nodes, vec!["node-a".to_string()]);
        assert_eq!(exposure.endpoints.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_service_is_none() {
        let client = MockService::new()
            .on_get(SERVICE_PATH, 404, &not_found_json("services", "web"))
            .into_client();

        let store = KubeExposureStore::new(client);
        let exposure = store.get(&ReconciliationKey::new("default", "web")).await.unwrap();
        assert!(exposure.is_none());
    }

    #[tokio::test]
    async fn test_remove_guard_patches_service() {
        let service = with_finalizer(lb_service("default", "web", "uid-1", &[(80, 8080, 30080)]));
        let mock = MockService::new()
            .on_get(SERVICE_PATH, 200, &service_body(&service))
            .on_patch(SERVICE_PATH, 200, &service_body(&service));
        let store = KubeExposureStore::new(mock.clone().into_client());

        store.remove_guard(&ReconciliationKey::new("default", "web")).await.unwrap();

        assert!(mock.was_called("PATCH", SERVICE_PATH));
    }

    #[tokio::test]
    async fn test_remove_guard_skips_patch_when_absent() {
        let service = lb_service("default", "web", "uid-1", &[(80, 8080, 30080)]);
        let mock = MockService::new().on_get(SERVICE_PATH, 200, &service_body(&service));
        let store = KubeExposureStore::new(mock.clone().into_client());

        store.remove_guard(&ReconciliationKey::new("default", "web")).await.unwrap();

        assert!(!mock.was_called("PATCH", SERVICE_PATH));
    }

    #[tokio::test]
    async fn test_remove_guard_on_deleted_service_succeeds() {
        let mock = MockService::new();
        let store = KubeExposureStore::new(mock.clone().into_client());

        store.remove_guard(&ReconciliationKey::new("default", "web")).await.unwrap();
        assert!(!mock.was_called("PATCH", SERVICE_PATH));
    }

    #[tokio::test]
    async fn test_update_ingress_patches_status() {
        let service = lb_service("default", "web", "uid-1", &[(80, 8080, 30080)]);
        let status_path = format!("{}/status", SERVICE_PATH);
        let mock = MockService::new().on_patch(&status_path, 200, &service_body(&service));
        let store = KubeExposureStore::new(mock.clone().into_client());

        store
            .update_ingress(
                &ReconciliationKey::new("default", "web"),
                &["a1.elb.example".to_string()],
            )
            .await
            .unwrap();

        assert!(mock.was_called("PATCH", &status_path));
    }

    #[test]
    fn test_is_managed() {
        let service = lb_service("default", "web", "uid-1", &[(80, 8080, 30080)]);
        assert!(is_managed(&service));

        let mut cluster_ip = service.clone();
        cluster_ip.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_string());
        assert!(!is_managed(&cluster_ip));
        assert!(is_managed(&with_finalizer(cluster_ip)));
    }
}
