// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Controller wiring around the reconcilers.

pub mod backoff;
pub mod service;

pub use backoff::Backoff;
pub use service::{Context, ServiceController};
