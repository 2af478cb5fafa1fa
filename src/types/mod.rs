// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Data model shared by every reconciliation stage.

pub mod cloud;
pub mod exposure;

pub use cloud::*;
pub use exposure::{
    is_node_eligible, BackendEndpoint, ExposedPort, ReconciliationKey, ServiceExposure, TargetPort,
    TrafficPolicy,
};
