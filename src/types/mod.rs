// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Custom resources handled by the scheduler.

pub mod cluster;
pub mod instance;

pub use cluster::{SchedulingLimits, SfCluster, SfClusterSpec, SfClusterStatus};
pub use instance::{SfServiceInstance, SfServiceInstanceSpec, SfServiceInstanceStatus};
