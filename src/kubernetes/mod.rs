// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes side of the controller: the exposure store and the watch triggers.

pub mod store;
pub mod watch;

pub use store::{EventSeverity, ExposureStore, KubeExposureStore};
pub use watch::{resync_ticks, NodeChanges, NodeWatch, TrackedServices};
