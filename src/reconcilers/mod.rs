// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Reconcilers driven by the runtime: placement of queued instances and per-cluster counting.

pub mod counter;
pub mod placement;

pub use counter::{cluster_of, CounterReconciler};
pub use placement::{queued_on, ClusterChanges, PlacementReconciler};
