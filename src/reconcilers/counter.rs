// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Counter reconciler - keeps `status.serviceInstanceCount` of every cluster equal to the
//! number of live instances bound to it.

use crate::error::Result;
use crate::runtime::Reconciler;
use crate::store::Store;
use crate::types::{SfCluster, SfServiceInstance};
use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CounterReconciler {
    instances: Arc<dyn Store<SfServiceInstance>>,
    clusters: Arc<dyn Store<SfCluster>>,
}

impl CounterReconciler {
    pub fn new(
        instances: Arc<dyn Store<SfServiceInstance>>,
        clusters: Arc<dyn Store<SfCluster>>,
    ) -> Self {
        Self {
            instances,
            clusters,
        }
    }

    /// Full recount from the current instance list
    async fn count_bound(&self, cluster: &str) -> Result<u64> {
        let instances = self.instances.list(None).await?;
        Ok(instances.iter().filter(|i| i.counts_towards(cluster)).count() as u64)
    }
}

#[async_trait]
impl Reconciler for CounterReconciler {
    type Kind = SfCluster;

    async fn reconcile(&self, key: &ObjectRef<SfCluster>) -> Result<Action> {
        let Some(cluster) = self.clusters.get(key).await? else {
            let orphans = self.count_bound(&key.name).await?;
            if orphans > 0 {
                warn!(
                    orphans,
                    "Instances are bound to cluster {} which does not exist", key
                );
            } else {
                debug!("Cluster is gone, nothing to count");
            }
            return Ok(Action::await_change());
        };

        let count = self.count_bound(&key.name).await?;
        let current = cluster.instance_count();
        if count == current && cluster.status.is_some() {
            debug!(count, "Instance count is up to date");
            return Ok(Action::await_change());
        }

        let mut updated = cluster;
        updated.set_instance_count(count);
        // a stale read surfaces as a conflict and is retried
        self.clusters.update_status(&updated).await?;
        info!(from = current, to = count, "Updated instance count");

        Ok(Action::await_change())
    }
}

/// The cluster an instance's binding counts towards, for routing instance changes to the
/// counter of that cluster
pub fn cluster_of(
    cluster_namespace: String,
) -> impl Fn(Arc<SfServiceInstance>) -> Option<ObjectRef<SfCluster>> + Send + Sync + 'static {
    move |instance| {
        instance
            .bound_cluster()
            .map(|name| ObjectRef::new(name).within(&cluster_namespace))
    }
}
