// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::{labels, states};
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[kube(
    group = "osb.servicefabrik.io",
    version = "v1alpha1",
    kind = "SFServiceInstance",
    root = "SfServiceInstance"
)]
#[kube(namespaced)]
#[kube(status = "SfServiceInstanceStatus")]
#[serde(rename_all = "camelCase")]
pub struct SfServiceInstanceSpec {
    pub service_id: String,
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_guid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space_guid: Option<String>,
    /// Name of the SFCluster this instance is bound to. Written once by the scheduler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SfServiceInstanceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SfServiceInstance {
    /// The cluster this instance is bound to, if any. An empty binding counts as unbound.
    pub fn bound_cluster(&self) -> Option<&str> {
        self.spec
            .cluster_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    /// Value of the lifecycle label
    pub fn lifecycle_state(&self) -> Option<&str> {
        self.labels().get(labels::STATE).map(|s| s.as_str())
    }

    pub fn status_state(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.state.as_deref())
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the placement scheduler should pick a cluster for this instance
    pub fn awaits_scheduling(&self) -> bool {
        !self.is_terminating()
            && self.bound_cluster().is_none()
            && self.lifecycle_state() == Some(states::IN_QUEUE)
    }

    /// Whether this instance contributes to the instance count of `cluster`
    pub fn counts_towards(&self, cluster: &str) -> bool {
        !self.is_terminating() && self.bound_cluster() == Some(cluster)
    }

    /// Bind to `cluster` and advance the lifecycle label. Spec and labels only, status is separate.
    pub fn bind(&mut self, cluster: &str) {
        self.spec.cluster_id = Some(cluster.to_string());
        self.labels_mut()
            .insert(labels::STATE.to_string(), states::SCHEDULED.to_string());
    }

    /// Whether a bound instance still reports a pre-scheduling state
    pub fn needs_scheduled_status(&self) -> bool {
        self.bound_cluster().is_some()
            && matches!(self.status_state(), None | Some(states::IN_QUEUE))
    }

    pub fn set_status_state(&mut self, state: &str) {
        self.status
            .get_or_insert_with(SfServiceInstanceStatus::default)
            .state = Some(state.to_string());
    }
}
