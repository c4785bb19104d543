// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Placement reconciler - binds each queued service instance to exactly one cluster.

use crate::constants::states;
use crate::error::{Result, SchedulerError};
use crate::runtime::Reconciler;
use crate::store::Store;
use crate::strategy::{bound_counts, select_cluster, ConfigHandle, Strategy};
use crate::types::{SfCluster, SfServiceInstance};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use kube::runtime::controller::Action;
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

pub struct PlacementReconciler {
    instances: Arc<dyn Store<SfServiceInstance>>,
    clusters: Arc<dyn Store<SfCluster>>,
    /// Namespace holding the SFCluster objects
    cluster_namespace: String,
    config: ConfigHandle,
}

impl PlacementReconciler {
    pub fn new(
        instances: Arc<dyn Store<SfServiceInstance>>,
        clusters: Arc<dyn Store<SfCluster>>,
        cluster_namespace: impl Into<String>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            instances,
            clusters,
            cluster_namespace: cluster_namespace.into(),
            config,
        }
    }

    /// Bound instances whose status never caught up with the binding get it written now
    async fn repair_status(&self, instance: &SfServiceInstance) -> Result<Action> {
        if instance.needs_scheduled_status() {
            let mut updated = instance.clone();
            updated.set_status_state(states::SCHEDULED);
            self.instances.update_status(&updated).await?;
            debug!("Set status of bound instance to {}", states::SCHEDULED);
        }
        Ok(Action::await_change())
    }
}

#[async_trait]
impl Reconciler for PlacementReconciler {
    type Kind = SfServiceInstance;

    async fn reconcile(&self, key: &ObjectRef<SfServiceInstance>) -> Result<Action> {
        let Some(instance) = self.instances.get(key).await? else {
            debug!("Instance is gone, nothing to schedule");
            return Ok(Action::await_change());
        };

        if instance.is_terminating() {
            return Ok(Action::await_change());
        }

        // never re-bind or migrate
        if let Some(cluster) = instance.bound_cluster() {
            debug!("Instance already bound to cluster {}", cluster);
            return self.repair_status(&instance).await;
        }

        if !instance.awaits_scheduling() {
            debug!(
                state = instance.lifecycle_state().unwrap_or_default(),
                "Instance is not queued for scheduling, skipping"
            );
            return Ok(Action::await_change());
        }

        let strategy = Strategy::from_config(&self.config.current()?)?;

        let clusters = self.clusters.list(Some(&self.cluster_namespace)).await?;
        let all_instances = self.instances.list(None).await?;
        let load = bound_counts(&all_instances);

        let chosen = select_cluster(&instance, &clusters, &load, &strategy)
            .ok_or_else(|| SchedulerError::NoEligibleCluster(key.to_string()))?;
        let cluster_name = chosen.name_any();

        // binding and label in one write, a conflict aborts with nothing applied
        let mut updated = instance.clone();
        updated.bind(&cluster_name);
        let mut bound = self.instances.update(&updated).await?;

        info!(
            cluster = %cluster_name,
            strategy = strategy.name(),
            "Scheduled instance"
        );

        bound.set_status_state(states::SCHEDULED);
        self.instances.update_status(&bound).await?;

        Ok(Action::await_change())
    }
}

/// On every signal, the cached instances still waiting for a cluster
pub fn queued_on(
    signals: impl Stream<Item = ()> + Send + 'static,
    instances: reflector::Store<SfServiceInstance>,
) -> impl Stream<Item = ObjectRef<SfServiceInstance>> + Send + 'static {
    signals.flat_map(move |()| {
        let queued: Vec<_> = instances
            .state()
            .iter()
            .filter(|instance| instance.awaits_scheduling())
            .map(|instance| ObjectRef::from_obj(&**instance))
            .collect();
        stream::iter(queued)
    })
}

/// Tracks what placement depends on per cluster: its labels and its spec, seen through the
/// generation. Status writes such as a new instance count change neither.
#[derive(Debug, Default)]
pub struct ClusterChanges {
    known: HashMap<String, (Option<i64>, BTreeMap<String, String>)>,
    relisted: Option<HashSet<String>>,
}

impl ClusterChanges {
    /// Whether `event` can open room for queued instances
    pub fn observe(&mut self, event: &Event<SfCluster>) -> bool {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                false
            }
            Event::InitApply(cluster) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(cluster.name_any());
                }
                self.remember(cluster)
            }
            Event::InitDone => {
                if let Some(relisted) = self.relisted.take() {
                    self.known.retain(|name, _| relisted.contains(name));
                }
                false
            }
            Event::Apply(cluster) => self.remember(cluster),
            Event::Delete(cluster) => {
                self.known.remove(&cluster.name_any());
                false
            }
        }
    }

    fn remember(&mut self, cluster: &SfCluster) -> bool {
        let seen = (cluster.metadata.generation, cluster.labels().clone());
        self.known.insert(cluster.name_any(), seen.clone()) != Some(seen)
    }
}
