// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Deployment Targets
//!
//! A target strategy decides where the backing resources of one service
//! instance live and how they are named. Resolution is a pure function of
//! the service instance id, the strategy and the broker's shared namespace;
//! the only side effect it can request is "this namespace must exist", which
//! the workflows act on through the platform deployer.
//!
//! | Strategy | Namespace | Resource name |
//! |----------|-----------|---------------|
//! | `default` | shared | unchanged |
//! | `per-instance-namespace` | service instance id | unchanged |
//! | `identifier-suffix` | shared | `<name>-<service instance id>` |

use crate::domain::broker_config::ConfigError;
use crate::domain::service_instance::ServiceInstanceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetStrategy {
    #[default]
    Default,
    PerInstanceNamespace,
    IdentifierSuffix,
}

impl TargetStrategy {
    pub const ALL: [TargetStrategy; 3] = [
        TargetStrategy::Default,
        TargetStrategy::PerInstanceNamespace,
        TargetStrategy::IdentifierSuffix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStrategy::Default => "default",
            TargetStrategy::PerInstanceNamespace => "per-instance-namespace",
            TargetStrategy::IdentifierSuffix => "identifier-suffix",
        }
    }
}

impl fmt::Display for TargetStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownTargetStrategy(s.to_string()))
    }
}

/// Where and under which names the resources of one operation are deployed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentTarget {
    pub namespace: String,
    /// Appended to every resource name as `-<suffix>` when present.
    pub name_suffix: Option<String>,
    /// The namespace belongs to this service instance alone: it is created
    /// before any resource and removed once empty on teardown.
    pub dedicated_namespace: bool,
}

impl DeploymentTarget {
    pub fn shared(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name_suffix: None,
            dedicated_namespace: false,
        }
    }

    pub fn resource_name(&self, base_name: &str) -> String {
        match &self.name_suffix {
            Some(suffix) => format!("{}-{}", base_name, suffix),
            None => base_name.to_string(),
        }
    }
}

/// A target together with the concrete name of one resource at that target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResource {
    pub target: DeploymentTarget,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct TargetResolver {
    default_namespace: String,
}

impl TargetResolver {
    pub fn new(default_namespace: impl Into<String>) -> Self {
        Self {
            default_namespace: default_namespace.into(),
        }
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    pub fn target(&self, instance_id: &ServiceInstanceId, strategy: TargetStrategy) -> DeploymentTarget {
        match strategy {
            TargetStrategy::Default => DeploymentTarget::shared(&self.default_namespace),
            TargetStrategy::PerInstanceNamespace => DeploymentTarget {
                namespace: instance_id.as_str().to_string(),
                name_suffix: None,
                dedicated_namespace: true,
            },
            TargetStrategy::IdentifierSuffix => DeploymentTarget {
                namespace: self.default_namespace.clone(),
                name_suffix: Some(instance_id.as_str().to_string()),
                dedicated_namespace: false,
            },
        }
    }

    pub fn resolve(
        &self,
        instance_id: &ServiceInstanceId,
        strategy: TargetStrategy,
        base_name: &str,
    ) -> ResolvedResource {
        let target = self.target(instance_id, strategy);
        let name = target.resource_name(base_name);
        ResolvedResource { target, name }
    }
}
