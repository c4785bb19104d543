// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Typed, versioned, watchable object store the controllers read from and write to.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::Resource;

/// Change stream of one kind, in the vocabulary of [`watcher::watcher`]
pub type WatchStream<K> = BoxStream<'static, watcher::Result<watcher::Event<K>>>;

/// CRUD plus watch for one kind.
///
/// `update` and `update_status` fail with [`SchedulerError::Conflict`](crate::error::SchedulerError::Conflict)
/// when the object carries a stale resource version.
#[async_trait]
pub trait Store<K: Resource<DynamicType = ()>>: Send + Sync {
    async fn get(&self, key: &ObjectRef<K>) -> Result<Option<K>>;

    /// List objects, restricted to `namespace` when given
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    async fn update(&self, obj: &K) -> Result<K>;

    async fn update_status(&self, obj: &K) -> Result<K>;

    async fn delete(&self, key: &ObjectRef<K>) -> Result<()>;

    /// Subscribe to changes. The stream starts with a full listing (`Init`, `InitApply`...,
    /// `InitDone`), repeats one whenever it may have missed changes, and is at-least-once in
    /// between. Deletions carry the last known state of the object.
    fn watch(&self) -> WatchStream<K>;
}
