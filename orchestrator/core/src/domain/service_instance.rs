// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service instance aggregate and the normalized marketplace requests that
//! drive its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Caller-supplied parameters attached to a provisioning request.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Opaque, caller-assigned identifier of a logical service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceInstanceId(String);

impl ServiceInstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceInstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingId(String);

impl BindingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the broker remembers about a provisioned service instance.
///
/// Remote resources are the source of truth; this record only carries what
/// the workflows need to decide what changed between two operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: ServiceInstanceId,
    pub service_name: String,
    pub plan_name: String,
    #[serde(default)]
    pub parameters: Parameters,
    /// Isolation namespace created for this instance, if any.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Backing service name -> fingerprint of the plan and parameters it was
    /// last provisioned with.
    #[serde(default)]
    pub service_fingerprints: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(request: &ProvisionRequest) -> Self {
        let now = Utc::now();
        Self {
            id: request.instance_id.clone(),
            service_name: request.service_name.clone(),
            plan_name: request.plan_name.clone(),
            parameters: request.parameters.clone(),
            namespace: None,
            service_fingerprints: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply_update(&mut self, request: &ProvisionRequest) {
        self.plan_name = request.plan_name.clone();
        self.parameters = request.parameters.clone();
        self.updated_at = Utc::now();
    }

    pub fn fingerprint_of(&self, backing_service: &str) -> Option<&str> {
        self.service_fingerprints
            .get(backing_service)
            .map(String::as_str)
    }
}

/// Normalized create/update request delivered by the marketplace adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub instance_id: ServiceInstanceId,
    pub service_name: String,
    pub plan_name: String,
    #[serde(default)]
    pub parameters: Parameters,
}

impl ProvisionRequest {
    pub fn new(
        instance_id: impl Into<ServiceInstanceId>,
        service_name: impl Into<String>,
        plan_name: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            service_name: service_name.into(),
            plan_name: plan_name.into(),
            parameters: Parameters::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeprovisionRequest {
    pub instance_id: ServiceInstanceId,
    pub service_name: String,
    pub plan_name: String,
}

impl DeprovisionRequest {
    pub fn new(
        instance_id: impl Into<ServiceInstanceId>,
        service_name: impl Into<String>,
        plan_name: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            service_name: service_name.into(),
            plan_name: plan_name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindRequest {
    pub instance_id: ServiceInstanceId,
    pub binding_id: BindingId,
    pub service_name: String,
    pub plan_name: String,
    #[serde(default)]
    pub parameters: Parameters,
}

impl From<String> for ServiceInstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
