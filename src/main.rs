// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Client;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fabrik_scheduler::config::Config;
use fabrik_scheduler::health::{self, Health};
use fabrik_scheduler::kubernetes::{wait_for_crd, KubeStore};
use fabrik_scheduler::operator::{Operator, Stores};
use fabrik_scheduler::types::{SfCluster, SfServiceInstance};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting service fabrik scheduler");

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: namespace={}, configmap={}/{}, workers={}",
        config.namespace, config.configmap_name, config.configmap_key, config.workers
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    let health = Arc::new(Health::new(config.unhealthy_after));

    // health endpoints answer (unready) while the CRDs are still missing
    let health_server = tokio::spawn(health::serve(
        config.health_addr,
        health.clone(),
        shutdown.clone(),
    ));

    wait_for_crd::<SfCluster>(&client).await?;
    wait_for_crd::<SfServiceInstance>(&client).await?;

    let stores = Stores {
        instances: Arc::new(KubeStore::<SfServiceInstance>::new(
            client.clone(),
            config.namespace.clone(),
            config.store_timeout,
            health.clone(),
        )),
        clusters: Arc::new(
            KubeStore::<SfCluster>::new(
                client.clone(),
                config.namespace.clone(),
                config.store_timeout,
                health.clone(),
            )
            .scoped(config.namespace.clone()),
        ),
        config_maps: Arc::new(
            KubeStore::<ConfigMap>::new(
                client,
                config.namespace.clone(),
                config.store_timeout,
                health.clone(),
            )
            .scoped(config.namespace.clone()),
        ),
    };

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested");
        signal.cancel();
    });

    let operator = Operator::new(config, stores, health);
    let result = operator.run(shutdown.clone()).await;

    shutdown.cancel();
    health_server.await??;
    result
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
