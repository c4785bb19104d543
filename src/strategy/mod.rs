// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Placement strategies and cluster selection.

pub mod config;

pub use config::{ConfigHandle, ConfigWatcher, StrategyConfig};

use crate::error::{Result, SchedulerError};
use crate::types::{SfCluster, SfServiceInstance};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT: &str = "default";
pub const ROUND_ROBIN: &str = "round-robin";
pub const LABEL_SELECTOR: &str = "label-selector";

/// Where a label-selector requirement takes its expected value from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceField {
    ServiceId,
    PlanId,
    Label(String),
}

impl InstanceField {
    fn parse(source: &str) -> Option<Self> {
        match source.trim() {
            "serviceId" => Some(InstanceField::ServiceId),
            "planId" => Some(InstanceField::PlanId),
            other => other
                .strip_prefix("labels.")
                .filter(|key| !key.is_empty())
                .map(|key| InstanceField::Label(key.to_string())),
        }
    }

    fn value<'a>(&self, instance: &'a SfServiceInstance) -> Option<&'a str> {
        match self {
            InstanceField::ServiceId => Some(instance.spec.service_id.as_str()),
            InstanceField::PlanId => Some(instance.spec.plan_id.as_str()),
            InstanceField::Label(key) => instance.labels().get(key).map(|v| v.as_str()),
        }
    }
}

/// Cluster label requirements derived from an instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    /// cluster label key -> instance field that must equal its value
    requirements: BTreeMap<String, InstanceField>,
}

impl LabelSelector {
    pub fn from_parameters(parameters: &BTreeMap<String, String>) -> Result<Self> {
        let mut requirements = BTreeMap::new();
        for (label, source) in parameters {
            if label.trim().is_empty() {
                return Err(SchedulerError::InvalidConfig(
                    "label-selector parameter with an empty cluster label key".to_string(),
                ));
            }
            let field = InstanceField::parse(source).ok_or_else(|| {
                SchedulerError::InvalidConfig(format!(
                    "label-selector parameter '{}' has unknown source '{}'",
                    label, source
                ))
            })?;
            requirements.insert(label.trim().to_string(), field);
        }
        Ok(Self { requirements })
    }

    pub fn matches(&self, cluster: &SfCluster, instance: &SfServiceInstance) -> bool {
        let labels = cluster.labels();
        self.requirements.iter().all(|(label, field)| {
            match (labels.get(label), field.value(instance)) {
                (Some(have), Some(want)) => have == want,
                _ => false,
            }
        })
    }
}

/// The active placement strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Every cluster is eligible
    Default,
    LabelSelector(LabelSelector),
}

impl Strategy {
    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        match config.strategy_name.as_deref().map(str::trim) {
            None | Some("") | Some(DEFAULT) | Some(ROUND_ROBIN) => Ok(Strategy::Default),
            Some(LABEL_SELECTOR) => Ok(Strategy::LabelSelector(LabelSelector::from_parameters(
                &config.strategy_parameters,
            )?)),
            Some(other) => Err(SchedulerError::InvalidConfig(format!(
                "unknown strategy '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Default => DEFAULT,
            Strategy::LabelSelector(_) => LABEL_SELECTOR,
        }
    }

    pub fn eligible(&self, cluster: &SfCluster, instance: &SfServiceInstance) -> bool {
        match self {
            Strategy::Default => true,
            Strategy::LabelSelector(selector) => selector.matches(cluster, instance),
        }
    }
}

/// Number of live instances bound to each cluster name
pub fn bound_counts(instances: &[SfServiceInstance]) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    for instance in instances.iter().filter(|i| !i.is_terminating()) {
        if let Some(cluster) = instance.bound_cluster() {
            *counts.entry(cluster.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// Pick the cluster for `instance`: eligible under `strategy` and below its capacity hint,
/// then fewest bound instances, then smallest name.
pub fn select_cluster<'a>(
    instance: &SfServiceInstance,
    clusters: &'a [SfCluster],
    load: &HashMap<String, u64>,
    strategy: &Strategy,
) -> Option<&'a SfCluster> {
    clusters
        .iter()
        .filter(|c| strategy.eligible(c, instance))
        .map(|c| (load.get(&c.name_any()).copied().unwrap_or(0), c))
        .filter(|(bound, c)| c.has_capacity_for(*bound))
        .min_by(|(a_load, a), (b_load, b)| {
            a_load
                .cmp(b_load)
                .then_with(|| a.name_any().cmp(&b.name_any()))
        })
        .map(|(_, c)| c)
}
