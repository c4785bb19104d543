// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[kube(
    group = "resource.servicefabrik.io",
    version = "v1alpha1",
    kind = "SFCluster",
    root = "SfCluster"
)]
#[kube(namespaced)]
#[kube(status = "SfClusterStatus")]
#[serde(rename_all = "camelCase")]
pub struct SfClusterSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduling_limits: Option<SchedulingLimits>,
}

/// Capacity hints honoured by the placement scheduler
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SfClusterStatus {
    #[serde(default)]
    pub service_instance_count: u64,
}

impl SfCluster {
    /// Number of instances bound to this cluster as last written by the counter
    pub fn instance_count(&self) -> u64 {
        self.status
            .as_ref()
            .map(|s| s.service_instance_count)
            .unwrap_or_default()
    }

    pub fn max_instances(&self) -> Option<u64> {
        self.spec
            .scheduling_limits
            .as_ref()
            .and_then(|l| l.max_instances)
    }

    /// Whether one more instance fits, given `bound` instances already on the cluster
    pub fn has_capacity_for(&self, bound: u64) -> bool {
        self.max_instances().map_or(true, |max| bound < max)
    }

    pub fn set_instance_count(&mut self, count: u64) {
        self.status
            .get_or_insert_with(SfClusterStatus::default)
            .service_instance_count = count;
    }
}
