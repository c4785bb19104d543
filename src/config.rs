// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{ensure, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{configmap, DEFAULT_NAMESPACE};
use crate::runtime::Backoff;

/// Operator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace holding SFCluster objects and the scheduler ConfigMap
    pub namespace: String,
    pub configmap_name: String,
    pub configmap_key: String,
    /// Upper bound on concurrently running reconciles, shared by both controllers
    pub workers: usize,
    /// Interval of the backstop sweep over all known objects
    pub resync_interval: Duration,
    pub store_timeout: Duration,
    pub backoff: Backoff,
    pub shutdown_grace: Duration,
    /// How long the store may stay unreachable before the process reports unhealthy
    pub unhealthy_after: Duration,
    pub health_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: DEFAULT_NAMESPACE.to_string(),
            configmap_name: configmap::NAME.to_string(),
            configmap_key: configmap::KEY.to_string(),
            workers: 4,
            resync_interval: Duration::from_secs(300),
            store_timeout: Duration::from_secs(10),
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(60)),
            shutdown_grace: Duration::from_secs(30),
            unhealthy_after: Duration::from_secs(120),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup, unset variables fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();

        let namespace = lookup("SCHEDULER_NAMESPACE").unwrap_or(defaults.namespace);
        let configmap_name = lookup("SCHEDULER_CONFIGMAP").unwrap_or(defaults.configmap_name);
        let configmap_key = lookup("SCHEDULER_CONFIGMAP_KEY").unwrap_or(defaults.configmap_key);

        let workers: usize = parse_var(&lookup, "SCHEDULER_WORKERS")?.unwrap_or(defaults.workers);
        ensure!(workers > 0, "SCHEDULER_WORKERS must be at least 1");

        let resync_interval = parse_var(&lookup, "RESYNC_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.resync_interval);
        ensure!(
            !resync_interval.is_zero(),
            "RESYNC_INTERVAL_SECS must be greater than zero"
        );

        let store_timeout = parse_var(&lookup, "STORE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.store_timeout);
        ensure!(
            !store_timeout.is_zero(),
            "STORE_TIMEOUT_SECS must be greater than zero"
        );

        let backoff_base = parse_var(&lookup, "BACKOFF_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff.base);
        let backoff_max = parse_var(&lookup, "BACKOFF_MAX_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.backoff.max);
        ensure!(
            backoff_base <= backoff_max,
            "BACKOFF_BASE_MS must not exceed BACKOFF_MAX_SECS"
        );

        let shutdown_grace = parse_var(&lookup, "SHUTDOWN_GRACE_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_grace);
        let unhealthy_after = parse_var(&lookup, "UNHEALTHY_AFTER_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.unhealthy_after);
        let health_addr = parse_var(&lookup, "HEALTH_ADDR")?.unwrap_or(defaults.health_addr);

        Ok(Config {
            namespace,
            configmap_name,
            configmap_key,
            workers,
            resync_interval,
            store_timeout,
            backoff: Backoff::new(backoff_base, backoff_max),
            shutdown_grace,
            unhealthy_after,
            health_addr,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("{} has an invalid value '{}'", name, raw))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.namespace, "default");
        assert_eq!(config.configmap_name, "interoperator-config");
        assert_eq!(config.configmap_key, "config");
        assert_eq!(config.workers, 4);
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert_eq!(config.backoff.max, Duration::from_secs(60));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("SCHEDULER_NAMESPACE", "sf"),
            ("SCHEDULER_WORKERS", "8"),
            ("RESYNC_INTERVAL_SECS", "30"),
            ("BACKOFF_BASE_MS", "100"),
            ("HEALTH_ADDR", "127.0.0.1:9000"),
        ]))
        .unwrap();

        assert_eq!(config.namespace, "sf");
        assert_eq!(config.workers, 8);
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.backoff.base, Duration::from_millis(100));
        assert_eq!(config.health_addr.port(), 9000);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[("SCHEDULER_WORKERS", "many")])).unwrap_err();
        assert!(err.to_string().contains("SCHEDULER_WORKERS"));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("SCHEDULER_WORKERS", "0")])).is_err());
    }

    #[test]
    fn test_zero_store_timeout_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[("STORE_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(err.to_string().contains("STORE_TIMEOUT_SECS"));

        let config = Config::from_lookup(lookup_from(&[("STORE_TIMEOUT_SECS", "3")])).unwrap();
        assert_eq!(config.store_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_base_above_cap_is_rejected() {
        let result = Config::from_lookup(lookup_from(&[
            ("BACKOFF_BASE_MS", "120000"),
            ("BACKOFF_MAX_SECS", "60"),
        ]));
        assert!(result.is_err());
    }
}
