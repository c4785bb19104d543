// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! [`Store`] backed by the Kubernetes API server.

use crate::error::{Result, SchedulerError};
use crate::health::Health;
use crate::store::{Store, WatchStream};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub struct KubeStore<K> {
    client: Client,
    /// Namespace for references and objects that carry none
    default_namespace: String,
    /// Restricts list-all and watch to one namespace
    scope: Option<String>,
    timeout: Duration,
    health: Arc<Health>,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    pub fn new(
        client: Client,
        default_namespace: impl Into<String>,
        timeout: Duration,
        health: Arc<Health>,
    ) -> Self {
        Self {
            client,
            default_namespace: default_namespace.into(),
            scope: None,
            timeout,
            health,
            _kind: std::marker::PhantomData,
        }
    }

    /// Only list and watch objects in `namespace`
    pub fn scoped(mut self, namespace: impl Into<String>) -> Self {
        self.scope = Some(namespace.into());
        self
    }

    fn api_for(&self, namespace: Option<&str>) -> Api<K> {
        Api::namespaced(
            self.client.clone(),
            namespace.unwrap_or(&self.default_namespace),
        )
    }

    fn api_listing(&self, namespace: Option<&str>) -> Api<K> {
        match namespace.or(self.scope.as_deref()) {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn key_of(&self, obj: &K) -> ObjectRef<K> {
        ObjectRef::new(&obj.name_any()).within(
            obj.namespace()
                .as_deref()
                .unwrap_or(&self.default_namespace),
        )
    }

    /// Run one API call under the store timeout, translate its error and record the outcome
    async fn call<T, F>(&self, target: &str, fut: F) -> Result<T>
    where
        F: Future<Output = kube::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => {
                self.health.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                let err = map_error(e, target);
                if reached_server(&err) {
                    self.health.record_success();
                } else {
                    self.health.record_failure();
                }
                Err(err)
            }
            Err(_) => {
                self.health.record_failure();
                Err(SchedulerError::Timeout(self.timeout))
            }
        }
    }
}

fn map_error(err: kube::Error, target: &str) -> SchedulerError {
    match err {
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            SchedulerError::AlreadyExists(target.to_string())
        }
        kube::Error::Api(resp) if resp.code == 409 => SchedulerError::Conflict(target.to_string()),
        kube::Error::Api(resp) if resp.code == 404 => SchedulerError::NotFound(target.to_string()),
        other => SchedulerError::KubeError(other),
    }
}

/// Client-side rejections still prove the API server is answering
fn reached_server(err: &SchedulerError) -> bool {
    match err {
        SchedulerError::KubeError(kube::Error::Api(resp)) => resp.code < 500,
        SchedulerError::KubeError(_) | SchedulerError::Timeout(_) => false,
        _ => true,
    }
}

#[async_trait]
impl<K> Store<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    #[instrument(level = "debug", skip(self))]
    async fn get(&self, key: &ObjectRef<K>) -> Result<Option<K>> {
        let api = self.api_for(key.namespace.as_deref());
        self.call(&key.to_string(), api.get_opt(&key.name)).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let api = self.api_listing(namespace);
        let list = self
            .call(&K::plural(&()), api.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = self.key_of(obj);
        let api = self.api_for(key.namespace.as_deref());
        self.call(&key.to_string(), api.create(&PostParams::default(), obj))
            .await
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let key = self.key_of(obj);
        let api = self.api_for(key.namespace.as_deref());
        self.call(
            &key.to_string(),
            api.replace(&key.name, &PostParams::default(), obj),
        )
        .await
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let key = self.key_of(obj);
        let api = self.api_for(key.namespace.as_deref());
        let data = serde_json::to_vec(obj)?;
        self.call(
            &key.to_string(),
            api.replace_status(&key.name, &PostParams::default(), data),
        )
        .await
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, key: &ObjectRef<K>) -> Result<()> {
        let api = self.api_for(key.namespace.as_deref());
        self.call(
            &key.to_string(),
            api.delete(&key.name, &DeleteParams::default()),
        )
        .await?;
        debug!("Deleted {}", key);
        Ok(())
    }

    fn watch(&self) -> WatchStream<K> {
        let api = self.api_listing(None);
        let health = self.health.clone();
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .inspect(move |event| match event {
                Ok(_) => health.record_success(),
                Err(e) => {
                    health.record_failure();
                    warn!("Watch for {} failed: {}", K::plural(&()), e);
                }
            })
            .boxed()
    }
}
