// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! In-process store with resource versions and watch support.

use crate::error::{Result, SchedulerError};
use crate::store::{Store, WatchStream};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Event;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::warn;

const EVENT_CAPACITY: usize = 1024;

/// Namespace and name
type Key = (Option<String>, String);

struct Objects<K> {
    items: BTreeMap<Key, K>,
    version: u64,
}

impl<K: Resource + Clone> Objects<K> {
    fn listing(&self) -> Vec<Event<K>> {
        std::iter::once(Event::Init)
            .chain(self.items.values().cloned().map(Event::InitApply))
            .chain(std::iter::once(Event::InitDone))
            .collect()
    }
}

/// Object store kept in memory. Every write bumps a store-wide resource version; spec and
/// status writes share that version. Spec writes also bump `metadata.generation`, status
/// writes never do.
pub struct MemoryStore<K> {
    objects: Arc<Mutex<Objects<K>>>,
    events: broadcast::Sender<Event<K>>,
}

fn key_of<K: Resource>(obj: &K) -> Key {
    (obj.namespace(), obj.name_any())
}

fn lock<K>(objects: &Mutex<Objects<K>>) -> MutexGuard<'_, Objects<K>> {
    // a panic while holding the lock leaves the map itself intact
    objects.lock().unwrap_or_else(|e| e.into_inner())
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            objects: Arc::new(Mutex::new(Objects {
                items: BTreeMap::new(),
                version: 0,
            })),
            events,
        }
    }

    fn publish(&self, event: Event<K>) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn replace(&self, obj: &K, status_only: bool) -> Result<K> {
        let key = key_of(obj);
        let stored = {
            let mut objects = lock(&self.objects);
            let current = objects
                .items
                .get(&key)
                .ok_or_else(|| SchedulerError::NotFound(ObjectRef::from_obj(obj).to_string()))?;

            if let Some(expected) = obj.resource_version() {
                if current.resource_version().as_deref() != Some(expected.as_str()) {
                    return Err(SchedulerError::Conflict(ObjectRef::from_obj(obj).to_string()));
                }
            }

            let generation = current.meta().generation;
            objects.version += 1;
            let mut stored = obj.clone();
            stored.meta_mut().resource_version = Some(objects.version.to_string());
            stored.meta_mut().generation = if status_only {
                generation
            } else {
                Some(generation.unwrap_or(0) + 1)
            };
            objects.items.insert(key, stored.clone());
            stored
        };
        self.publish(Event::Apply(stored.clone()));
        Ok(stored)
    }
}

impl<K> Default for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K> Store<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectRef<K>) -> Result<Option<K>> {
        let key = (key.namespace.clone(), key.name.clone());
        Ok(lock(&self.objects).items.get(&key).cloned())
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        Ok(lock(&self.objects)
            .items
            .iter()
            .filter(|((ns, _), _)| namespace.is_none() || ns.as_deref() == namespace)
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = key_of(obj);
        let stored = {
            let mut objects = lock(&self.objects);
            if objects.items.contains_key(&key) {
                return Err(SchedulerError::AlreadyExists(
                    ObjectRef::from_obj(obj).to_string(),
                ));
            }
            objects.version += 1;
            let mut stored = obj.clone();
            stored.meta_mut().resource_version = Some(objects.version.to_string());
            stored.meta_mut().generation = Some(1);
            objects.items.insert(key, stored.clone());
            stored
        };
        self.publish(Event::Apply(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        self.replace(obj, false)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        self.replace(obj, true)
    }

    async fn delete(&self, key: &ObjectRef<K>) -> Result<()> {
        let removed = lock(&self.objects)
            .items
            .remove(&(key.namespace.clone(), key.name.clone()))
            .ok_or_else(|| SchedulerError::NotFound(key.to_string()))?;
        self.publish(Event::Delete(removed));
        Ok(())
    }

    fn watch(&self) -> WatchStream<K> {
        // subscribe before taking the listing, duplicates are allowed but gaps are not
        let rx = self.events.subscribe();
        let listing = lock(&self.objects).listing();
        let objects = self.objects.clone();

        let updates = stream::unfold(rx, move |mut rx| {
            let objects = objects.clone();
            async move {
                match rx.recv().await {
                    Ok(event) => Some((vec![event], rx)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Watch subscriber lagged, {} events dropped, relisting", missed);
                        let listing = lock(&objects).listing();
                        Some((listing, rx))
                    }
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            }
        })
        .flat_map(stream::iter);

        stream::iter(listing).chain(updates).map(Ok).boxed()
    }
}
