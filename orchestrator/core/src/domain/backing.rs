// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Backing application and backing service declarations.
//!
//! These are immutable configuration, read once at the start of every
//! workflow. Transformer and credential provider declarations are tagged by
//! `name`; an unknown name fails deserialization, so it surfaces when the
//! configuration is loaded and never at request time.

use crate::domain::service_instance::Parameters;
use crate::domain::target::TargetStrategy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Environment handed to a backing application. Ordered so that two
/// environments with the same entries always serialize identically.
pub type Environment = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackingApplication {
    pub name: String,

    /// Artifact location: a local path, an `http(s)://` URL or
    /// `docker://<image>`.
    pub path: String,

    #[serde(default)]
    pub environment: Environment,

    #[serde(default)]
    pub properties: DeploymentProperties,

    /// Applied in declared order.
    #[serde(default)]
    pub parameters_transformers: Vec<ParametersTransformerSpec>,

    /// Applied in declared order, after the parameter transformers.
    #[serde(default)]
    pub credential_providers: Vec<CredentialProviderSpec>,

    /// Names of backing services this application binds to.
    #[serde(default)]
    pub services: Vec<String>,

    /// Overrides the target strategy of the service plan for this app only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetStrategy>,
}

impl BackingApplication {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            environment: Environment::new(),
            properties: DeploymentProperties::default(),
            parameters_transformers: Vec::new(),
            credential_providers: Vec::new(),
            services: Vec::new(),
            target: None,
        }
    }

    pub fn binds_to(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    Port,
    Process,
    Http,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buildpacks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_type: Option<HealthCheckType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Fully qualified routes (`host.domain[/path]`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<String>,
    #[serde(default)]
    pub no_route: bool,
    /// Start the application after staging (default: true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<bool>,
}

impl DeploymentProperties {
    pub fn instance_count(&self) -> u32 {
        self.instances.unwrap_or(1)
    }

    pub fn should_start(&self) -> bool {
        self.start.unwrap_or(true)
    }

    /// All routes the app should be reachable on. `host`/`domain` contribute
    /// one route when the domain is known.
    pub fn all_routes(&self) -> Vec<String> {
        if self.no_route {
            return Vec::new();
        }
        let mut routes = self.routes.clone();
        if let Some(domain) = &self.domain {
            let route = match &self.host {
                Some(host) => format!("{}.{}", host, domain),
                None => domain.clone(),
            };
            if !routes.contains(&route) {
                routes.push(route);
            }
        }
        routes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackingService {
    /// Logical name of the service instance to create or reuse.
    pub name: String,
    /// Marketplace offering name on the platform.
    pub service: String,
    pub plan: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub parameters_transformers: Vec<ServiceParametersTransformerSpec>,
    /// Unbind and bind again on every update so apps pick up new credentials.
    #[serde(default)]
    pub rebind_on_update: bool,
}

impl BackingService {
    pub fn new(name: impl Into<String>, service: impl Into<String>, plan: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            plan: plan.into(),
            parameters: Parameters::new(),
            parameters_transformers: Vec::new(),
            rebind_on_update: false,
        }
    }
}

/// Stable digest of what a backing service was provisioned with; compared
/// across operations to detect a changed spec on update.
pub fn service_fingerprint(service: &str, plan: &str, parameters: &Parameters) -> String {
    let mut hasher = Sha256::new();
    hasher.update(service.as_bytes());
    hasher.update([0u8]);
    hasher.update(plan.as_bytes());
    hasher.update([0u8]);
    // serde_json::Map is ordered, so this is deterministic.
    hasher.update(serde_json::Value::Object(parameters.clone()).to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Caller parameters a `property-mapping` transformer may rewrite.
pub const MAPPABLE_PROPERTIES: &[&str] = &[
    "count",
    "instances",
    "memory",
    "disk",
    "host",
    "domain",
    "route",
    "health-check-type",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum ParametersTransformerSpec {
    /// Allow-listed caller parameters become environment entries.
    EnvironmentMapping {
        #[serde(default)]
        include: Vec<String>,
    },
    /// Allow-listed caller parameters rewrite deployment properties.
    PropertyMapping {
        #[serde(default)]
        include: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum ServiceParametersTransformerSpec {
    /// Allow-listed caller parameters are passed to the service broker.
    ParametersMapping {
        #[serde(default)]
        include: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum CredentialProviderSpec {
    #[serde(rename = "basic-auth")]
    BasicAuth(BasicAuthSpec),
    #[serde(rename = "oauth2-client")]
    OAuth2Client(OAuth2ClientSpec),
}

impl CredentialProviderSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            CredentialProviderSpec::BasicAuth(_) => "basic-auth",
            CredentialProviderSpec::OAuth2Client(_) => "oauth2-client",
        }
    }

    pub fn policy(&self) -> &PasswordPolicy {
        match self {
            CredentialProviderSpec::BasicAuth(spec) => &spec.policy,
            CredentialProviderSpec::OAuth2Client(spec) => &spec.policy,
        }
    }
}

/// Character classes and length of a generated secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordPolicy {
    #[serde(default = "default_secret_length")]
    pub length: usize,
    #[serde(default = "default_true")]
    pub include_uppercase: bool,
    #[serde(default = "default_true")]
    pub include_lowercase: bool,
    #[serde(default = "default_true")]
    pub include_numbers: bool,
    #[serde(default)]
    pub include_special: bool,
}

impl PasswordPolicy {
    pub fn character_classes(&self) -> usize {
        [
            self.include_uppercase,
            self.include_lowercase,
            self.include_numbers,
            self.include_special,
        ]
        .into_iter()
        .filter(|enabled| *enabled)
        .count()
    }

    /// A secret can be generated: at least one class is enabled and the
    /// length leaves room for one character of each.
    pub fn check(&self) -> Result<(), String> {
        let classes = self.character_classes();
        if classes == 0 {
            return Err("no character class enabled".into());
        }
        if self.length < classes {
            return Err(format!(
                "length {} is shorter than the {} required character classes",
                self.length, classes
            ));
        }
        Ok(())
    }
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            length: default_secret_length(),
            include_uppercase: true,
            include_lowercase: true,
            include_numbers: true,
            include_special: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuthSpec {
    #[serde(default, flatten)]
    pub policy: PasswordPolicy,
    #[serde(default = "default_username_key")]
    pub username_key: String,
    #[serde(default = "default_password_key")]
    pub password_key: String,
    /// Store the credentials in the secret store and inject references
    /// instead of the raw values.
    #[serde(default)]
    pub secret_reference: bool,
}

impl Default for BasicAuthSpec {
    fn default() -> Self {
        Self {
            policy: PasswordPolicy::default(),
            username_key: default_username_key(),
            password_key: default_password_key(),
            secret_reference: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth2ClientSpec {
    #[serde(default, flatten)]
    pub policy: PasswordPolicy,
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<String>,
    #[serde(default)]
    pub authorities: Vec<String>,
    #[serde(default = "default_client_id_key")]
    pub client_id_key: String,
    #[serde(default = "default_client_secret_key")]
    pub client_secret_key: String,
    #[serde(default)]
    pub secret_reference: bool,
}

impl Default for OAuth2ClientSpec {
    fn default() -> Self {
        Self {
            policy: PasswordPolicy::default(),
            grant_types: default_grant_types(),
            authorities: Vec::new(),
            client_id_key: default_client_id_key(),
            client_secret_key: default_client_secret_key(),
            secret_reference: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_secret_length() -> usize {
    24
}

fn default_username_key() -> String {
    "SECURITY_USER_NAME".to_string()
}

fn default_password_key() -> String {
    "SECURITY_USER_PASSWORD".to_string()
}

fn default_grant_types() -> Vec<String> {
    vec!["client_credentials".to_string()]
}

fn default_client_id_key() -> String {
    "OAUTH2_CLIENT_ID".to_string()
}

fn default_client_secret_key() -> String {
    "OAUTH2_CLIENT_SECRET".to_string()
}
