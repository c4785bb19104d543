// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Concurrent modification of {0}")]
    Conflict(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("No eligible cluster for instance {0}")]
    NoEligibleCluster(String),

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Whether a reconcile failing with this error should be retried with backoff.
    ///
    /// Configuration errors are retried too, an operator may fix the document at any time.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            SchedulerError::KubeError(_) => true,
            SchedulerError::Conflict(_)
            | SchedulerError::Timeout(_)
            | SchedulerError::NoEligibleCluster(_)
            | SchedulerError::InvalidConfig(_) => true,
            SchedulerError::NotFound(_)
            | SchedulerError::AlreadyExists(_)
            | SchedulerError::SerializationError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
