// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation stages and the pass that runs them in order.

pub mod finalizer;
pub mod loadbalancer;
pub mod security;
pub mod service;
pub mod targets;

pub use finalizer::{DeletionPhase, Teardown};
pub use service::{PassOutcome, ServiceReconciler};
