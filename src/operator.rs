// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Wires the configuration source and both controllers onto one set of stores.
//!
//! Instances and clusters are each watched once and shared by both controllers. Placement
//! runs for every instance change and re-queues the instances still waiting whenever
//! capacity may have opened up: a new or changed cluster, a deleted instance, a
//! configuration change or the periodic resync. The counter runs for every cluster change
//! and for the cluster of every bound instance that changes or goes away.

use crate::config::Config;
use crate::health::Health;
use crate::reconcilers::{
    cluster_of, queued_on, ClusterChanges, CounterReconciler, PlacementReconciler,
};
use crate::runtime::{self, ControllerSettings, SharedWatch};
use crate::store::Store;
use crate::strategy::{ConfigHandle, ConfigWatcher};
use crate::types::{SfCluster, SfServiceInstance};
use anyhow::Context;
use futures::channel::mpsc::{self, UnboundedSender};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Event;
use kube::runtime::Controller;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The stores the operator reads from and writes to
#[derive(Clone)]
pub struct Stores {
    pub instances: Arc<dyn Store<SfServiceInstance>>,
    pub clusters: Arc<dyn Store<SfCluster>>,
    pub config_maps: Arc<dyn Store<ConfigMap>>,
}

pub struct Operator {
    config: Config,
    stores: Stores,
    health: Arc<Health>,
}

impl Operator {
    pub fn new(config: Config, stores: Stores, health: Arc<Health>) -> Self {
        Self {
            config,
            stores,
            health,
        }
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let Operator {
            config,
            stores,
            health,
        } = self;

        let (config_watcher, config_handle) = ConfigWatcher::new(
            stores.config_maps.clone(),
            ObjectRef::new(&config.configmap_name).within(&config.namespace),
            config.configmap_key.clone(),
        );
        // the watch replays the current document as well, a failed first read is not fatal
        if let Err(e) = config_watcher.load().await {
            warn!("Initial scheduler configuration load failed: {}", e);
        }

        let pool = Arc::new(Semaphore::new(config.workers.max(1)));
        let settings = ControllerSettings {
            workers: config.workers,
            backoff: config.backoff,
            shutdown_grace: config.shutdown_grace,
        };

        // subscribers have to exist before the watches start
        let instances = SharedWatch::<SfServiceInstance>::new();
        let clusters = SharedWatch::<SfCluster>::new();
        let placed = instances
            .subscribe()
            .context("Failed to subscribe to instance changes")?;
        let counted = instances
            .subscribe()
            .context("Failed to subscribe to instance changes")?;
        let cluster_changes = clusters
            .subscribe()
            .context("Failed to subscribe to cluster changes")?;

        let (requeue_tx, requeue_rx) = mpsc::unbounded();
        let (recount_tx, recount_rx) = mpsc::unbounded();
        let (released_tx, released_rx) = mpsc::unbounded();

        let placement = Controller::for_shared_stream(placed, instances.reader())
            .reconcile_on(queued_on(requeue_rx, instances.reader()));
        let counter = Controller::for_shared_stream(cluster_changes, clusters.reader())
            .watches_shared_stream(counted, cluster_of(config.namespace.clone()))
            .reconcile_on(released_rx)
            .reconcile_all_on(recount_rx);

        let instance_watch = instances.run(
            stores.instances.watch(),
            on_instance_deleted(config.namespace.clone(), released_tx, requeue_tx.clone()),
        );
        let cluster_watch = clusters.run(
            stores.clusters.watch(),
            on_cluster_changed(requeue_tx.clone()),
        );

        let placement = runtime::run(
            "placement",
            placement,
            Arc::new(PlacementReconciler::new(
                stores.instances.clone(),
                stores.clusters.clone(),
                config.namespace.clone(),
                config_handle.clone(),
            )),
            pool.clone(),
            &settings,
            shutdown.clone(),
        );
        let counter = runtime::run(
            "counter",
            counter,
            Arc::new(CounterReconciler::new(
                stores.instances.clone(),
                stores.clusters.clone(),
            )),
            pool,
            &settings,
            shutdown.clone(),
        );

        health.set_ready(true);
        info!(namespace = %config.namespace, "Scheduler started");

        let (_, _, _, _, _, _, watched) = tokio::join!(
            placement,
            counter,
            until_cancelled(shutdown.clone(), instance_watch),
            until_cancelled(shutdown.clone(), cluster_watch),
            resync(
                config.resync_interval,
                vec![requeue_tx.clone(), recount_tx],
                shutdown.clone()
            ),
            forward_config_changes(config_handle, requeue_tx, shutdown.clone()),
            config_watcher.run(shutdown.clone()),
        );

        health.set_ready(false);
        info!("Scheduler stopped");
        watched
    }
}

/// A deleted instance lowers the count of its cluster and frees room for queued ones
fn on_instance_deleted(
    cluster_namespace: String,
    released: UnboundedSender<ObjectRef<SfCluster>>,
    requeue: UnboundedSender<()>,
) -> impl FnMut(&Event<SfServiceInstance>) + Send {
    move |event| {
        let Event::Delete(instance) = event else {
            return;
        };
        if let Some(cluster) = instance.bound_cluster() {
            // send errors only mean the controllers are gone
            let _ = released.unbounded_send(ObjectRef::new(cluster).within(&cluster_namespace));
            let _ = requeue.unbounded_send(());
        }
    }
}

/// Requeue waiting instances when a cluster shows up or changes labels or spec
fn on_cluster_changed(requeue: UnboundedSender<()>) -> impl FnMut(&Event<SfCluster>) + Send {
    let mut changes = ClusterChanges::default();
    move |event| {
        if changes.observe(event) {
            let _ = requeue.unbounded_send(());
        }
    }
}

async fn until_cancelled(shutdown: CancellationToken, work: impl Future<Output = ()>) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = work => warn!("Watch ended before shutdown"),
    }
}

/// Signal every target once per `period`, starting one period from now
async fn resync(period: Duration, targets: Vec<UnboundedSender<()>>, shutdown: CancellationToken) {
    let mut ticks = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticks.tick() => {}
        }
        debug!("Periodic resync");
        for target in &targets {
            let _ = target.unbounded_send(());
        }
    }
}

/// A new strategy may place instances the previous one could not
async fn forward_config_changes(
    mut handle: ConfigHandle,
    requeue: UnboundedSender<()>,
    shutdown: CancellationToken,
) {
    loop {
        let changed = tokio::select! {
            _ = shutdown.cancelled() => return,
            changed = handle.changed() => changed,
        };
        if !changed || requeue.unbounded_send(()).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{labels, states};
    use crate::runtime::Backoff;
    use crate::store::MemoryStore;
    use crate::test_utils::eventually;
    use crate::types::{SfClusterSpec, SfServiceInstanceSpec};
    use futures::StreamExt;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        instances: Arc<MemoryStore<SfServiceInstance>>,
        clusters: Arc<MemoryStore<SfCluster>>,
        config_maps: Arc<MemoryStore<ConfigMap>>,
        health: Arc<Health>,
        shutdown: CancellationToken,
        task: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                instances: Arc::new(MemoryStore::new()),
                clusters: Arc::new(MemoryStore::new()),
                config_maps: Arc::new(MemoryStore::new()),
                health: Arc::new(Health::new(Duration::from_secs(60))),
                shutdown: CancellationToken::new(),
                task: None,
            }
        }

        fn start(&mut self) {
            let config = Config {
                backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
                shutdown_grace: Duration::from_secs(1),
                ..Default::default()
            };
            let stores = Stores {
                instances: self.instances.clone(),
                clusters: self.clusters.clone(),
                config_maps: self.config_maps.clone(),
            };
            let operator = Operator::new(config, stores, self.health.clone());
            self.task = Some(tokio::spawn(operator.run(self.shutdown.clone())));
        }

        async fn stop(mut self) {
            self.shutdown.cancel();
            if let Some(task) = self.task.take() {
                task.await.unwrap().unwrap();
            }
        }

        async fn add_cluster(&self, name: &str, cluster_labels: &[(&str, &str)]) {
            let cluster = SfCluster {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some("default".to_string()),
                    labels: Some(
                        cluster_labels
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                },
                spec: SfClusterSpec::default(),
                status: None,
            };
            self.clusters.create(&cluster).await.unwrap();
        }

        async fn add_instance(&self, name: &str, plan_id: &str) {
            let instance = SfServiceInstance {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some("default".to_string()),
                    labels: Some(BTreeMap::from([(
                        labels::STATE.to_string(),
                        states::IN_QUEUE.to_string(),
                    )])),
                    ..Default::default()
                },
                spec: SfServiceInstanceSpec {
                    service_id: "service-id".to_string(),
                    plan_id: plan_id.to_string(),
                    ..Default::default()
                },
                status: None,
            };
            self.instances.create(&instance).await.unwrap();
        }

        async fn set_config(&self, document: &str) {
            let key = ObjectRef::new("interoperator-config").within("default");
            let data = Some(BTreeMap::from([("config".to_string(), document.to_string())]));
            match self.config_maps.get(&key).await.unwrap() {
                Some(mut cm) => {
                    cm.data = data;
                    self.config_maps.update(&cm).await.unwrap();
                }
                None => {
                    let cm = ConfigMap {
                        metadata: ObjectMeta {
                            name: Some(key.name.clone()),
                            namespace: Some("default".to_string()),
                            ..Default::default()
                        },
                        data,
                        ..Default::default()
                    };
                    self.config_maps.create(&cm).await.unwrap();
                }
            }
        }

        /// Wait until `name` is bound and marked scheduled, returning the cluster
        async fn scheduled_on(&self, name: &str) -> Option<String> {
            let key = ObjectRef::new(name).within("default");
            let found = eventually(WAIT, || {
                let instances = self.instances.clone();
                let key = key.clone();
                async move {
                    instances
                        .get(&key)
                        .await
                        .unwrap()
                        .is_some_and(|i| i.status_state() == Some(states::SCHEDULED))
                }
            })
            .await;
            if !found {
                return None;
            }
            let instance = self.instances.get(&key).await.unwrap()?;
            instance.bound_cluster().map(str::to_string)
        }

        async fn count_reaches(&self, cluster: &str, expected: u64) -> bool {
            let key = ObjectRef::new(cluster).within("default");
            eventually(WAIT, || {
                let clusters = self.clusters.clone();
                let key = key.clone();
                async move {
                    clusters
                        .get(&key)
                        .await
                        .unwrap()
                        .is_some_and(|c| c.status.is_some() && c.instance_count() == expected)
                }
            })
            .await
        }
    }

    #[tokio::test]
    async fn test_schedules_and_counts_instances() {
        let mut harness = Harness::new();
        harness.add_cluster("1", &[]).await;
        harness.set_config("schedulerType: label-selector").await;
        harness.add_instance("foo1", "plan-id-1").await;
        harness.add_instance("foo2", "plan-id-2").await;
        harness.start();

        assert_eq!(harness.scheduled_on("foo1").await.as_deref(), Some("1"));
        assert_eq!(harness.scheduled_on("foo2").await.as_deref(), Some("1"));
        assert!(harness.count_reaches("1", 2).await);

        for name in ["foo1", "foo2"] {
            harness
                .instances
                .delete(&ObjectRef::new(name).within("default"))
                .await
                .unwrap();
        }
        assert!(harness.count_reaches("1", 0).await);
        assert!(harness.instances.list(None).await.unwrap().is_empty());

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_instance_waits_for_first_cluster() {
        let mut harness = Harness::new();
        harness.add_instance("foo", "plan-id-1").await;
        harness.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let waiting = harness
            .instances
            .get(&ObjectRef::new("foo").within("default"))
            .await
            .unwrap()
            .unwrap();
        assert!(waiting.awaits_scheduling());

        harness.add_cluster("late", &[]).await;
        assert_eq!(harness.scheduled_on("foo").await.as_deref(), Some("late"));
        assert!(harness.count_reaches("late", 1).await);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_configuration_change_unblocks_instances() {
        let mut harness = Harness::new();
        harness.add_cluster("a", &[("plan", "plan-x")]).await;
        harness
            .set_config("schedulerType: label-selector\nschedulerParameters:\n  plan: planId\n")
            .await;
        harness.add_instance("foo", "plan-y").await;
        harness.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let waiting = harness
            .instances
            .get(&ObjectRef::new("foo").within("default"))
            .await
            .unwrap()
            .unwrap();
        assert!(waiting.awaits_scheduling());

        harness.set_config("schedulerType: default").await;
        assert_eq!(harness.scheduled_on("foo").await.as_deref(), Some("a"));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_counts_converge_across_clusters() {
        let mut harness = Harness::new();
        for cluster in ["a", "b", "c"] {
            harness.add_cluster(cluster, &[]).await;
        }
        for i in 0..9 {
            harness.add_instance(&format!("inst-{}", i), "plan-id-1").await;
        }
        harness.start();

        let mut per_cluster: BTreeMap<String, u64> = BTreeMap::new();
        for i in 0..9 {
            let cluster = harness.scheduled_on(&format!("inst-{}", i)).await.unwrap();
            *per_cluster.entry(cluster).or_insert(0) += 1;
        }
        assert_eq!(per_cluster.values().sum::<u64>(), 9);
        for (cluster, expected) in &per_cluster {
            assert!(harness.count_reaches(cluster, *expected).await, "{}", cluster);
        }

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_readiness_follows_lifecycle() {
        let mut harness = Harness::new();
        harness.start();

        let health = harness.health.clone();
        assert!(crate::test_utils::wait_until(WAIT, || health.is_ready()).await);

        harness.stop().await;
        assert!(!health.is_ready());
    }

    #[tokio::test]
    async fn test_drifted_count_is_restored() {
        let mut harness = Harness::new();
        harness.add_cluster("1", &[]).await;
        harness.add_instance("foo", "plan-id-1").await;
        harness.start();

        assert_eq!(harness.scheduled_on("foo").await.as_deref(), Some("1"));
        assert!(harness.count_reaches("1", 1).await);

        let key = ObjectRef::new("1").within("default");
        let mut cluster = harness.clusters.get(&key).await.unwrap().unwrap();
        cluster.set_instance_count(42);
        harness.clusters.update_status(&cluster).await.unwrap();
        assert!(harness.count_reaches("1", 1).await);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_resync_signals_every_target_until_shutdown() {
        let (first_tx, mut first_rx) = mpsc::unbounded();
        let (second_tx, mut second_rx) = mpsc::unbounded();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(resync(
            Duration::from_millis(20),
            vec![first_tx, second_tx],
            shutdown.clone(),
        ));

        for _ in 0..2 {
            assert_eq!(first_rx.next().await, Some(()));
            assert_eq!(second_rx.next().await, Some(()));
        }

        shutdown.cancel();
        task.await.unwrap();
        // the senders went with the task
        while first_rx.next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_instance_deletion_releases_its_cluster() {
        let (released_tx, mut released_rx) = mpsc::unbounded();
        let (requeue_tx, mut requeue_rx) = mpsc::unbounded();
        let mut observe = on_instance_deleted("clusters".to_string(), released_tx, requeue_tx);

        let mut instance = SfServiceInstance::new("foo", SfServiceInstanceSpec::default());
        instance.metadata.namespace = Some("default".to_string());
        observe(&Event::Delete(instance.clone()));
        instance.bind("1");
        observe(&Event::Apply(instance.clone()));
        observe(&Event::Delete(instance));

        assert_eq!(
            released_rx.next().await,
            Some(ObjectRef::new("1").within("clusters"))
        );
        assert_eq!(requeue_rx.next().await, Some(()));
        assert!(released_rx.try_next().is_err());
        assert!(requeue_rx.try_next().is_err());
    }
}
