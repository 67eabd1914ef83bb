// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Platform deployer contract.
//!
//! One method per remote primitive. Implementations hold no per-operation
//! state and may be called concurrently by several operations. Reads are the
//! only calls an implementation may retry on its own; a failed mutating call
//! is always reported to the caller.

use crate::domain::backing::{DeploymentProperties, Environment};
use crate::domain::service_instance::Parameters;
use crate::domain::target::DeploymentTarget;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Application push request at a resolved target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDeployment {
    /// Resolved name, suffix already applied.
    pub name: String,
    pub path: String,
    pub environment: Environment,
    pub properties: DeploymentProperties,
}

/// Service instance request at a resolved target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDeployment {
    /// Resolved name, suffix already applied.
    pub name: String,
    pub service: String,
    pub plan: String,
    pub parameters: Parameters,
}

/// Locates one deployed application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentId {
    pub namespace: String,
    pub name: String,
}

impl DeploymentId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Running,
    Crashed,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub index: u32,
    pub state: InstanceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStatus {
    pub deployment: DeploymentId,
    /// Desired state as last requested on the platform.
    pub state: AppState,
    pub requested_instances: u32,
    pub instances: Vec<InstanceStatus>,
}

impl AppStatus {
    pub fn running_count(&self) -> u32 {
        self.instances
            .iter()
            .filter(|i| i.state == InstanceState::Running)
            .count() as u32
    }

    /// Started with every requested instance running.
    pub fn is_healthy(&self) -> bool {
        self.state == AppState::Started && self.running_count() >= self.requested_instances
    }

    pub fn is_stopped(&self) -> bool {
        self.state == AppState::Stopped && self.running_count() == 0
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflicting platform state: {0}")]
    Conflict(String),

    #[error("Transient platform error: {0}")]
    Transient(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Rejected by platform: {0}")]
    Rejected(String),

    #[error("Staging failed: {0}")]
    Staging(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PlatformError {
    /// Worth retrying for an idempotent read.
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transient(_) | PlatformError::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PlatformError::NotFound(_) => "not_found",
            PlatformError::AlreadyExists(_) => "already_exists",
            PlatformError::Conflict(_) => "conflict",
            PlatformError::Transient(_) => "transient",
            PlatformError::Timeout(_) => "timeout",
            PlatformError::Unauthorized(_) => "unauthorized",
            PlatformError::Rejected(_) => "rejected",
            PlatformError::Staging(_) => "staging",
            PlatformError::Http(_) => "http",
            PlatformError::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for PlatformError {
    fn from(e: serde_json::Error) -> Self {
        PlatformError::Serialization(e.to_string())
    }
}

/// Bounded exponential backoff for status polling.
///
/// The first wait is `initial_fraction * status_timeout`; each following one
/// doubles, never exceeding `max_fraction * status_timeout`. The whole
/// sequence gives up once `status_timeout` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollingPolicy {
    pub status_timeout: Duration,
    pub initial_fraction: f64,
    pub max_fraction: f64,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            status_timeout: Duration::from_secs(300),
            initial_fraction: 0.1,
            max_fraction: 0.5,
        }
    }
}

impl PollingPolicy {
    pub fn with_timeout(status_timeout: Duration) -> Self {
        Self {
            status_timeout,
            ..Self::default()
        }
    }

    pub fn initial_delay(&self) -> Duration {
        self.status_timeout.mul_f64(self.initial_fraction)
    }

    pub fn max_delay(&self) -> Duration {
        self.status_timeout.mul_f64(self.max_fraction)
    }

    /// Wait before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay()
            .saturating_mul(factor)
            .min(self.max_delay())
    }
}

#[async_trait]
pub trait PlatformDeployer: Send + Sync {
    /// Creates and starts the app, or rolls an existing app to the new
    /// build without dropping healthy instances. Returns once the platform
    /// reports the new build healthy.
    async fn push_application(
        &self,
        target: &DeploymentTarget,
        app: &ApplicationDeployment,
    ) -> Result<DeploymentId, PlatformError>;

    async fn application_exists(&self, target: &DeploymentTarget, name: &str) -> Result<bool, PlatformError>;

    /// Stops and removes the app; `NotFound` when absent.
    async fn delete_application(&self, target: &DeploymentTarget, name: &str) -> Result<(), PlatformError>;

    async fn namespace_exists(&self, name: &str) -> Result<bool, PlatformError>;

    /// Idempotent: an existing namespace is success.
    async fn create_namespace(&self, name: &str) -> Result<(), PlatformError>;

    /// Idempotent: a missing namespace is success.
    async fn delete_namespace(&self, name: &str) -> Result<(), PlatformError>;

    /// No apps and no service instances left in the namespace.
    async fn namespace_is_empty(&self, name: &str) -> Result<bool, PlatformError>;

    async fn service_instance_exists(&self, target: &DeploymentTarget, name: &str) -> Result<bool, PlatformError>;

    async fn create_service_instance(
        &self,
        target: &DeploymentTarget,
        service: &ServiceDeployment,
    ) -> Result<(), PlatformError>;

    async fn update_service_instance(
        &self,
        target: &DeploymentTarget,
        service: &ServiceDeployment,
    ) -> Result<(), PlatformError>;

    /// Unbinds every app still bound, then deletes; `NotFound` when absent.
    async fn delete_service_instance(&self, target: &DeploymentTarget, name: &str) -> Result<(), PlatformError>;

    /// Names of the apps currently bound to a service instance.
    async fn bound_applications(&self, target: &DeploymentTarget, service: &str) -> Result<Vec<String>, PlatformError>;

    async fn bind_service(&self, target: &DeploymentTarget, app: &str, service: &str) -> Result<(), PlatformError>;

    async fn unbind_service(&self, target: &DeploymentTarget, app: &str, service: &str) -> Result<(), PlatformError>;

    async fn get_status(&self, deployment: &DeploymentId) -> Result<AppStatus, PlatformError>;

    async fn start_application(&self, deployment: &DeploymentId) -> Result<(), PlatformError>;

    async fn stop_application(&self, deployment: &DeploymentId) -> Result<(), PlatformError>;

    async fn restart_application(&self, deployment: &DeploymentId) -> Result<(), PlatformError>;

    /// Rebuilds the current package and rolls the app onto the new droplet.
    async fn restage_application(&self, deployment: &DeploymentId) -> Result<(), PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = PollingPolicy::with_timeout(Duration::from_secs(100));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(40));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(50));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(50));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(PlatformError::Transient("502".into()).is_transient());
        assert!(PlatformError::Timeout("poll".into()).is_transient());
        assert!(!PlatformError::NotFound("app".into()).is_transient());
        assert!(!PlatformError::Rejected("quota".into()).is_transient());
    }

    #[test]
    fn healthy_requires_every_requested_instance() {
        let mut status = AppStatus {
            deployment: DeploymentId::new("ns", "web"),
            state: AppState::Started,
            requested_instances: 2,
            instances: vec![
                InstanceStatus { index: 0, state: InstanceState::Running },
                InstanceStatus { index: 1, state: InstanceState::Starting },
            ],
        };
        assert_eq!(status.running_count(), 1);
        assert!(!status.is_healthy());
        status.instances[1].state = InstanceState::Running;
        assert!(status.is_healthy());
    }
}
