// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Read-through node → instance cache.
//!
//! Entries expire after a TTL and are refetched lazily on the next lookup. Node removal
//! invalidates explicitly. A miss that the backend cannot resolve is an error, never an
//! empty record.

use crate::cloud::CloudBackend;
use crate::error::{ControllerError, Result};
use crate::types::InstanceRecord;
use moka::future::Cache;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const MAX_CACHED_NODES: u64 = 10_000;

#[derive(Clone)]
pub struct InstanceCache {
    backend: Arc<dyn CloudBackend>,
    cache: Cache<String, InstanceRecord>,
}

impl InstanceCache {
    pub fn new(backend: Arc<dyn CloudBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            cache: Cache::builder()
                .max_capacity(MAX_CACHED_NODES)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Resolve one node, fetching from the backend on a miss
    #[instrument(skip(self))]
    pub async fn get(&self, node_name: &str) -> Result<InstanceRecord> {
        let backend = self.backend.clone();
        let name = node_name.to_string();

        self.cache
            .try_get_with(node_name.to_string(), async move {
                debug!("Instance cache miss for node {}", name);
                let records = backend.describe_instances(std::slice::from_ref(&name)).await?;
                records
                    .into_iter()
                    .find(|r| r.node_name == name)
                    .ok_or_else(|| ControllerError::InstanceLookup {
                        node: name.clone(),
                        message: "no instance registered for node".to_string(),
                    })
            })
            .await
            .map_err(|e| ControllerError::InstanceLookup {
                node: node_name.to_string(),
                message: e.to_string(),
            })
    }

    /// Resolve a set of nodes with at most one backend call for all misses.
    ///
    /// Any node the backend cannot resolve fails the whole call.
    #[instrument(skip_all)]
    pub async fn get_many<'a, I>(&self, node_names: I) -> Result<BTreeMap<String, InstanceRecord>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut records = BTreeMap::new();
        let mut misses = Vec::new();
        for name in node_names {
            match self.cache.get(name).await {
                Some(record) => {
                    records.insert(name.clone(), record);
                }
                None => misses.push(name.clone()),
            }
        }
        if misses.is_empty() {
            return Ok(records);
        }

        debug!("Instance cache miss for {} nodes", misses.len());
        let fetched = self
            .backend
            .describe_instances(&misses)
            .await
            .map_err(|e| ControllerError::InstanceLookup {
                node: misses.join(","),
                message: e.to_string(),
            })?;
        let mut fetched: BTreeMap<String, InstanceRecord> =
            fetched.into_iter().map(|r| (r.node_name.clone(), r)).collect();

        for name in misses {
            let record = fetched.remove(&name).ok_or_else(|| ControllerError::InstanceLookup {
                node: name.clone(),
                message: "no instance registered for node".to_string(),
            })?;
            self.cache.insert(name.clone(), record.clone()).await;
            records.insert(name, record);
        }
        Ok(records)
    }

    pub async fn invalidate(&self, node_name: &str) {
        debug!("Invalidating instance cache entry for node {}", node_name);
        self.cache.invalidate(node_name).await;
    }
}
