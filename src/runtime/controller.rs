// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Drives a kube [`Controller`] with a [`Reconciler`].
//!
//! Reconciles of every controller draw from one pool of slots. Retryable failures come back
//! with per-object exponential backoff. On shutdown, reconciles that already hold a slot get
//! a bounded grace period and everything else is dropped.

use crate::error::{Result, SchedulerError};
use crate::runtime::Backoff;
use async_trait::async_trait;
use futures::{future, StreamExt};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::Resource;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-kind reconcile logic
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Kind: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static;

    /// Implementations re-read the object behind `key` from the store, the copy cached by the
    /// controller may be stale.
    async fn reconcile(&self, key: &ObjectRef<Self::Kind>) -> Result<Action>;
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Reconciles this controller keeps in progress; the shared pool bounds the total
    pub workers: usize,
    pub backoff: Backoff,
    pub shutdown_grace: Duration,
}

struct Context<R: Reconciler> {
    name: &'static str,
    reconciler: Arc<R>,
    pool: Arc<Semaphore>,
    shutdown: CancellationToken,
    backoff: Backoff,
    objects: Store<R::Kind>,
    failures: Mutex<HashMap<ObjectRef<R::Kind>, u32>>,
}

impl<R: Reconciler> Context<R> {
    fn failures(&self) -> MutexGuard<'_, HashMap<ObjectRef<R::Kind>, u32>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forget(&self, key: &ObjectRef<R::Kind>) {
        self.failures().remove(key);
    }

    /// Delay before the next attempt at `key`, doubling with every failure in a row
    fn next_delay(&self, key: &ObjectRef<R::Kind>) -> Duration {
        let mut failures = self.failures();
        // objects deleted while failing are never reconciled again
        failures.retain(|known, _| known == key || self.objects.get(known).is_some());
        let attempt = failures.entry(key.clone()).or_insert(0);
        let delay = self.backoff.delay(*attempt);
        *attempt = attempt.saturating_add(1);
        delay
    }
}

async fn reconcile<R: Reconciler>(obj: Arc<R::Kind>, ctx: Arc<Context<R>>) -> Result<Action> {
    let key = ObjectRef::from_obj(&*obj);

    // waiting for a slot is not started work, shutdown drops it
    let permit = tokio::select! {
        biased;
        _ = ctx.shutdown.cancelled() => None,
        permit = ctx.pool.clone().acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        debug!(controller = ctx.name, object = %key, "Shutting down, reconcile not started");
        return Ok(Action::await_change());
    };

    let action = ctx.reconciler.reconcile(&key).await?;
    ctx.forget(&key);
    Ok(action)
}

fn error_policy<R: Reconciler>(
    obj: Arc<R::Kind>,
    error: &SchedulerError,
    ctx: Arc<Context<R>>,
) -> Action {
    let key = ObjectRef::from_obj(&*obj);
    if !error.is_retryable() {
        ctx.forget(&key);
        error!(controller = ctx.name, object = %key, "Reconcile failed permanently: {}", error);
        return Action::await_change();
    }

    let delay = ctx.next_delay(&key);
    match error {
        SchedulerError::Conflict(_) | SchedulerError::NoEligibleCluster(_) => {
            info!(controller = ctx.name, object = %key, "{}, retrying in {:?}", error, delay)
        }
        _ => warn!(
            controller = ctx.name,
            object = %key,
            "Reconcile failed: {}, retrying in {:?}", error, delay
        ),
    }
    Action::requeue(delay)
}

type Reconciled<K> = std::result::Result<
    (ObjectRef<K>, Action),
    controller::Error<SchedulerError, watcher::Error>,
>;

fn log_reconciled<K: Resource<DynamicType = ()>>(name: &'static str, result: Reconciled<K>) {
    match result {
        Ok((obj, _)) => debug!(controller = name, object = %obj, "Reconciled"),
        Err(controller::Error::ObjectNotFound(obj)) => {
            debug!(controller = name, object = %obj, "Object is not cached, skipping")
        }
        // reported by the error policy
        Err(controller::Error::ReconcilerFailed(..)) => {}
        Err(e) => warn!(controller = name, "Controller error: {}", e),
    }
}

async fn cancelled(token: CancellationToken) {
    token.cancelled().await;
}

/// Run `controller` until `shutdown` is cancelled, then give in-flight reconciles
/// `shutdown_grace` to finish.
pub async fn run<R: Reconciler>(
    name: &'static str,
    controller: Controller<R::Kind>,
    reconciler: Arc<R>,
    pool: Arc<Semaphore>,
    settings: &ControllerSettings,
    shutdown: CancellationToken,
) {
    let context = Arc::new(Context {
        name,
        reconciler,
        pool,
        shutdown: shutdown.clone(),
        backoff: settings.backoff,
        objects: controller.store(),
        failures: Mutex::default(),
    });
    let concurrency = u16::try_from(settings.workers).unwrap_or(u16::MAX);
    info!(controller = name, concurrency, "Starting controller");

    let reconciles = controller
        .with_config(controller::Config::default().concurrency(concurrency))
        .graceful_shutdown_on(cancelled(shutdown.clone()))
        .run(reconcile::<R>, error_policy::<R>, context)
        .for_each(move |result| {
            log_reconciled(name, result);
            future::ready(())
        });
    tokio::pin!(reconciles);

    tokio::select! {
        _ = &mut reconciles => {
            info!(controller = name, "Controller stopped");
            return;
        }
        _ = shutdown.cancelled() => {}
    }

    info!(controller = name, "Shutting down controller");
    if tokio::time::timeout(settings.shutdown_grace, reconciles)
        .await
        .is_err()
    {
        warn!(
            controller = name,
            "In-flight reconciles did not finish within {:?}, dropping them",
            settings.shutdown_grace
        );
    }
}
