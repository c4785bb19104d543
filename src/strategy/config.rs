// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Scheduler configuration document and its hot-reloading source.

use crate::error::{Result, SchedulerError};
use crate::store::Store;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::watcher::Event;
use kube::runtime::WatchStreamExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Strategy selection as stored in the scheduler ConfigMap. Unrelated keys are ignored.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    #[serde(default, alias = "schedulerType")]
    pub strategy_name: Option<String>,
    #[serde(default, alias = "schedulerParameters")]
    pub strategy_parameters: BTreeMap<String, String>,
}

impl StrategyConfig {
    pub fn named(name: &str) -> Self {
        Self {
            strategy_name: Some(name.to_string()),
            strategy_parameters: BTreeMap::new(),
        }
    }

    pub fn from_yaml(document: &str) -> Result<Self> {
        if document.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(document)
            .map_err(|e| SchedulerError::InvalidConfig(format!("Failed to parse document: {}", e)))
    }
}

/// Latest configuration as seen by the scheduler. A document that fails to parse is kept as an
/// error so that reconciles fail (and retry) instead of silently falling back to a default.
pub type ConfigState = std::result::Result<StrategyConfig, String>;

/// Read side of the configuration source, cloned into every reconciler that needs it
#[derive(Clone)]
pub struct ConfigHandle {
    rx: watch::Receiver<Arc<ConfigState>>,
}

impl ConfigHandle {
    /// Handle that always yields `config`, for callers without a live source
    pub fn fixed(config: StrategyConfig) -> Self {
        let (tx, rx) = watch::channel(Arc::new(Ok(config)));
        // keep the value alive after the sender is gone
        drop(tx);
        Self { rx }
    }

    pub fn current(&self) -> Result<StrategyConfig> {
        match &**self.rx.borrow() {
            Ok(config) => Ok(config.clone()),
            Err(e) => Err(SchedulerError::InvalidConfig(e.clone())),
        }
    }

    /// Resolves when the configuration changes. Returns false once the source has stopped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Follows the scheduler ConfigMap and publishes every change
pub struct ConfigWatcher {
    store: Arc<dyn Store<ConfigMap>>,
    key: ObjectRef<ConfigMap>,
    data_key: String,
    tx: watch::Sender<Arc<ConfigState>>,
}

impl ConfigWatcher {
    pub fn new(
        store: Arc<dyn Store<ConfigMap>>,
        key: ObjectRef<ConfigMap>,
        data_key: impl Into<String>,
    ) -> (Self, ConfigHandle) {
        let (tx, rx) = watch::channel(Arc::new(Ok(StrategyConfig::default())));
        let watcher = Self {
            store,
            key,
            data_key: data_key.into(),
            tx,
        };
        (watcher, ConfigHandle { rx })
    }

    /// Load the current document once. A missing ConfigMap selects the default strategy.
    #[instrument(skip(self), fields(configmap = %self.key))]
    pub async fn load(&self) -> Result<()> {
        let cm = self.store.get(&self.key).await?;
        self.publish(self.parse(cm.as_ref()));
        Ok(())
    }

    /// Follow changes until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let (reader, writer) = reflector::store();
        let events = self.store.watch().reflect(writer);
        tokio::pin!(events);
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.next() => event,
            };
            let Some(event) = event else {
                warn!("Configuration watch ended");
                break;
            };
            match event {
                Ok(Event::Apply(cm)) | Ok(Event::Delete(cm))
                    if ObjectRef::from_obj(&cm) != self.key =>
                {
                    continue
                }
                Ok(Event::Delete(_)) => {
                    info!("Scheduler ConfigMap {} deleted, using default strategy", self.key)
                }
                Ok(Event::Apply(_)) | Ok(Event::InitDone) => {}
                Ok(Event::Init) | Ok(Event::InitApply(_)) => continue,
                Err(e) => {
                    warn!("Configuration watch failed: {}", e);
                    continue;
                }
            }
            self.publish(self.parse(reader.get(&self.key).as_deref()));
        }
        Ok(())
    }

    fn parse(&self, cm: Option<&ConfigMap>) -> ConfigState {
        let document = cm
            .and_then(|cm| cm.data.as_ref())
            .and_then(|data| data.get(&self.data_key));
        match document {
            None => {
                debug!("No scheduler configuration found in {}", self.key);
                Ok(StrategyConfig::default())
            }
            Some(document) => StrategyConfig::from_yaml(document).map_err(|e| e.to_string()),
        }
    }

    fn publish(&self, state: ConfigState) {
        self.tx.send_if_modified(|current| {
            if **current == state {
                return false;
            }
            match &state {
                Ok(config) => info!(
                    strategy = config.strategy_name.as_deref().unwrap_or("default"),
                    "Scheduler configuration updated"
                ),
                Err(e) => warn!("Scheduler configuration is invalid: {}", e),
            }
            *current = Arc::new(state.clone());
            true
        });
    }
}
