// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Glue between the stores and kube-runtime: shared watches, the controller driver and its
//! retry policy.

pub mod backoff;
pub mod controller;
pub mod shared;

pub use backoff::Backoff;
pub use controller::{run, ControllerSettings, Reconciler};
pub use shared::SharedWatch;
