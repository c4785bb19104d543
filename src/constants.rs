// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// Label keys and values carried by service instances
pub mod labels {
    /// Lifecycle label, used as a coarse "needs scheduling" filter
    pub const STATE: &str = "state";
}

/// Lifecycle states written to the `state` label and `status.state`
pub mod states {
    pub const IN_QUEUE: &str = "in_queue";
    pub const SCHEDULED: &str = "scheduled";
}

/// Scheduler configuration document location
pub mod configmap {
    pub const NAME: &str = "interoperator-config";
    pub const KEY: &str = "config";
}

/// Namespace holding clusters and the scheduler configuration
pub const DEFAULT_NAMESPACE: &str = "default";

/// CRD polling configuration
pub mod crd {
    /// Initial polling interval in seconds when waiting for CRD
    pub const POLL_INTERVAL_SECS: u64 = 10;
    /// Maximum polling interval in seconds (exponential backoff cap)
    pub const POLL_MAX_INTERVAL_SECS: u64 = 60;
}
