// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cloud Controller v3 resources, trimmed to the fields the deployer reads.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub href: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub total_results: u64,
    #[serde(default)]
    pub next: Option<Link>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Paginated<T> {
    #[serde(default)]
    pub pagination: Pagination,
    pub resources: Vec<T>,
    #[serde(default)]
    pub included: Option<Included>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Included {
    #[serde(default)]
    pub apps: Vec<App>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipData {
    pub guid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub data: Option<RelationshipData>,
}

impl Relationship {
    pub fn to(guid: impl Into<String>) -> Self {
        Self {
            data: Some(RelationshipData { guid: guid.into() }),
        }
    }

    pub fn guid(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.guid.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Organization {
    pub guid: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Space {
    pub guid: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct App {
    pub guid: String,
    pub name: String,
    /// `STARTED` or `STOPPED`
    pub state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentVariables {
    #[serde(default)]
    pub var: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Package {
    pub guid: String,
    /// `AWAITING_UPLOAD`, `PROCESSING_UPLOAD`, `READY`, `FAILED`, ...
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Build {
    pub guid: String,
    /// `STAGING`, `STAGED` or `FAILED`
    pub state: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub droplet: Option<RelationshipData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentStatus {
    /// `ACTIVE` or `FINALIZED`
    pub value: String,
    /// `DEPLOYING`, `DEPLOYED`, `CANCELED`, `SUPERSEDED`, ...
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub guid: String,
    pub status: DeploymentStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Process {
    pub guid: String,
    #[serde(rename = "type")]
    pub process_type: String,
    pub instances: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessInstanceStats {
    pub index: u32,
    /// `RUNNING`, `STARTING`, `CRASHED`, `DOWN`
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessStats {
    pub resources: Vec<ProcessInstanceStats>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicePlan {
    pub guid: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceInstance {
    pub guid: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceCredentialBindingRelationships {
    #[serde(default)]
    pub app: Option<Relationship>,
    #[serde(default)]
    pub service_instance: Option<Relationship>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceCredentialBinding {
    pub guid: String,
    pub relationships: ServiceCredentialBindingRelationships,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Domain {
    pub guid: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    pub guid: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobError {
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub guid: String,
    /// `PROCESSING`, `POLLING`, `COMPLETE` or `FAILED`
    pub state: String,
    #[serde(default)]
    pub errors: Vec<JobError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CfError {
    #[serde(default)]
    pub code: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CfErrors {
    pub errors: Vec<CfError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}
