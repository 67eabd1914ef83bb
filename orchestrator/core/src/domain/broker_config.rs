// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Broker Configuration Types
//
// Defines the configuration schema for a broker process, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Platform connection and timeouts
// - Deployment concurrency and default target strategy
// - Per service/plan backing applications and backing services
// - Operation state backend

use crate::domain::backing::{
    BackingApplication, BackingService, CredentialProviderSpec, ParametersTransformerSpec, MAPPABLE_PROPERTIES,
};
use crate::domain::platform::PollingPolicy;
use crate::domain::target::TargetStrategy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const API_VERSION: &str = "appbroker/v1";
pub const KIND: &str = "BrokerConfig";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid apiVersion: '{0}'. Must be 'appbroker/v1'")]
    InvalidApiVersion(String),

    #[error("Invalid kind: '{0}'. Must be 'BrokerConfig'")]
    InvalidKind(String),

    #[error("Unknown target strategy: '{0}'")]
    UnknownTargetStrategy(String),

    #[error("{0} cannot be empty")]
    EmptyField(String),

    #[error("Duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("App '{app}' binds to undeclared backing service '{service}'")]
    UndeclaredService { app: String, service: String },

    #[error("Invalid polling fractions: initial {initial}, max {max} (need 0 < initial <= max <= 1)")]
    InvalidPolling { initial: f64, max: f64 },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("App '{app}' maps parameter '{property}', which is not a deployment property")]
    UnknownProperty { app: String, property: String },

    #[error("Credential provider '{provider}' of '{owner}' cannot generate secrets: {reason}")]
    InvalidPolicy {
        owner: String,
        provider: &'static str,
        reason: String,
    },

    #[error("Environment variable '{0}' referenced by configuration is not set")]
    MissingEnvVar(String),
}

/// Top-level Kubernetes-style broker configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfigManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: BrokerConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfigSpec {
    #[serde(default)]
    pub platform: PlatformConfig,

    #[serde(default)]
    pub deployment: DeploymentConfig,

    /// Service offerings this broker can provision, one entry per plan.
    #[serde(default)]
    pub services: Vec<ServicePlanConfig>,

    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformType {
    CloudFoundry,
    #[default]
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(rename = "type", default)]
    pub platform_type: PlatformType,

    /// Cloud Controller API root, e.g. `https://api.sys.example.com`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// UAA token endpoint, e.g. `https://uaa.sys.example.com/oauth/token`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Literal secret or `env:VAR_NAME`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Organization that owns every namespace (space) the broker manages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    #[serde(default = "default_namespace")]
    pub default_namespace: String,

    /// Remove an app's routes together with the app
    #[serde(default = "default_true")]
    pub delete_routes: bool,

    #[serde(default = "default_api_timeout", with = "humantime_serde")]
    pub api_timeout: Duration,

    #[serde(default = "default_status_timeout", with = "humantime_serde")]
    pub status_timeout: Duration,

    #[serde(default)]
    pub polling: PollingConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            platform_type: PlatformType::default(),
            api_url: None,
            token_url: None,
            client_id: None,
            client_secret: None,
            organization: None,
            default_namespace: default_namespace(),
            delete_routes: true,
            api_timeout: default_api_timeout(),
            status_timeout: default_status_timeout(),
            polling: PollingConfig::default(),
        }
    }
}

impl PlatformConfig {
    pub fn polling_policy(&self) -> PollingPolicy {
        PollingPolicy {
            status_timeout: self.status_timeout,
            initial_fraction: self.polling.initial_fraction,
            max_fraction: self.polling.max_fraction,
        }
    }

    /// Client secret with `env:` indirection resolved.
    pub fn resolved_client_secret(&self) -> Result<Option<String>, ConfigError> {
        self.client_secret.as_deref().map(resolve_secret).transpose()
    }
}

/// Resolves `env:VAR_NAME` to the variable's value; other values are literal.
pub fn resolve_secret(value: &str) -> Result<String, ConfigError> {
    match value.strip_prefix("env:") {
        Some(var) => {
            std::env::var(var).map_err(|_| ConfigError::MissingEnvVar(var.to_string()))
        }
        None => Ok(value.to_string()),
    }
}

/// Backoff shape of status polling, as fractions of `status_timeout`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_initial_fraction")]
    pub initial_fraction: f64,

    #[serde(default = "default_max_fraction")]
    pub max_fraction: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_fraction: default_initial_fraction(),
            max_fraction: default_max_fraction(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Upper bound on application sub-tasks running at once per operation
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub default_target: TargetStrategy,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_target: TargetStrategy::default(),
        }
    }
}

/// Backing resources provisioned for one service offering plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePlanConfig {
    pub service_name: String,

    pub plan_name: String,

    /// Overrides `deployment.default_target` for this plan
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetStrategy>,

    #[serde(default)]
    pub apps: Vec<BackingApplication>,

    #[serde(default)]
    pub services: Vec<BackingService>,

    /// Minted for every service binding of this plan
    #[serde(default)]
    pub binding_credentials: Vec<CredentialProviderSpec>,
}

impl ServicePlanConfig {
    pub fn new(service_name: impl Into<String>, plan_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            plan_name: plan_name.into(),
            target: None,
            apps: Vec::new(),
            services: Vec::new(),
            binding_credentials: Vec::new(),
        }
    }

    pub fn strategy(&self, default_target: TargetStrategy) -> TargetStrategy {
        self.target.unwrap_or(default_target)
    }

    /// Strategy for one app: the app's own override wins over the plan's.
    pub fn strategy_for_app(&self, app: &BackingApplication, default_target: TargetStrategy) -> TargetStrategy {
        app.target.unwrap_or_else(|| self.strategy(default_target))
    }

    pub fn backing_service(&self, name: &str) -> Option<&BackingService> {
        self.services.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateBackend {
    #[default]
    InMemory,
    Sled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackend,

    /// Database directory for the `sled` backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_namespace() -> String {
    "appbroker".to_string()
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_status_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_initial_fraction() -> f64 {
    0.1
}

fn default_max_fraction() -> f64 {
    0.5
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for BrokerConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "appbroker".to_string()),
                version: None,
                labels: None,
            },
            spec: BrokerConfigSpec::default(),
        }
    }
}

impl BrokerConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. APPBROKER_CONFIG_PATH environment variable
    /// 2. ./appbroker-config.yaml (working directory)
    /// 3. ~/.appbroker/config.yaml (user home)
    /// 4. /etc/appbroker/config.yaml (system, Unix) or C:\ProgramData\AppBroker\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("APPBROKER_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./appbroker-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".appbroker").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/appbroker/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\AppBroker\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path (fail if missing/invalid)
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using empty defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("APPBROKER_DEFAULT_NAMESPACE") {
            if val.is_empty() {
                tracing::warn!("Empty value for APPBROKER_DEFAULT_NAMESPACE. Ignoring.");
            } else {
                tracing::info!("Environment override: APPBROKER_DEFAULT_NAMESPACE={}", val);
                self.spec.platform.default_namespace = val;
            }
        }

        if let Ok(val) = std::env::var("APPBROKER_MAX_CONCURRENCY") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => {
                    tracing::info!("Environment override: APPBROKER_MAX_CONCURRENCY={}", n);
                    self.spec.deployment.max_concurrency = n;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for APPBROKER_MAX_CONCURRENCY: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    pub fn find_plan(&self, service_name: &str, plan_name: &str) -> Option<&ServicePlanConfig> {
        self.spec
            .services
            .iter()
            .find(|p| p.service_name == service_name && p.plan_name == plan_name)
    }

    /// Validate configuration. Everything a request could trip over later is
    /// checked here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_version != API_VERSION {
            return Err(ConfigError::InvalidApiVersion(self.api_version.clone()));
        }

        if self.kind != KIND {
            return Err(ConfigError::InvalidKind(self.kind.clone()));
        }

        if self.metadata.name.is_empty() {
            return Err(ConfigError::EmptyField("metadata.name".into()));
        }

        let platform = &self.spec.platform;
        if platform.default_namespace.is_empty() {
            return Err(ConfigError::EmptyField("spec.platform.default_namespace".into()));
        }

        if platform.status_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "spec.platform.status_timeout".into(),
                reason: "must be greater than zero".into(),
            });
        }

        if platform.api_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "spec.platform.api_timeout".into(),
                reason: "must be greater than zero".into(),
            });
        }

        let polling = platform.polling;
        if !(polling.initial_fraction > 0.0
            && polling.initial_fraction <= polling.max_fraction
            && polling.max_fraction <= 1.0)
        {
            return Err(ConfigError::InvalidPolling {
                initial: polling.initial_fraction,
                max: polling.max_fraction,
            });
        }

        if platform.platform_type == PlatformType::CloudFoundry {
            if platform.api_url.as_deref().unwrap_or_default().is_empty() {
                return Err(ConfigError::EmptyField("spec.platform.api_url".into()));
            }
            if platform.organization.as_deref().unwrap_or_default().is_empty() {
                return Err(ConfigError::EmptyField("spec.platform.organization".into()));
            }
        }

        if self.spec.deployment.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "spec.deployment.max_concurrency".into(),
                reason: "must be at least 1".into(),
            });
        }

        let mut plans = HashSet::new();
        for plan in &self.spec.services {
            if plan.service_name.is_empty() || plan.plan_name.is_empty() {
                return Err(ConfigError::EmptyField("spec.services[].service_name/plan_name".into()));
            }
            if !plans.insert((plan.service_name.as_str(), plan.plan_name.as_str())) {
                return Err(ConfigError::Duplicate {
                    kind: "service plan",
                    name: format!("{}/{}", plan.service_name, plan.plan_name),
                });
            }
            validate_plan(plan)?;
        }

        Ok(())
    }
}

fn validate_plan(plan: &ServicePlanConfig) -> Result<(), ConfigError> {
    let mut services = HashSet::new();
    for service in &plan.services {
        if service.name.is_empty() || service.service.is_empty() || service.plan.is_empty() {
            return Err(ConfigError::EmptyField(format!(
                "backing service name/service/plan in {}/{}",
                plan.service_name, plan.plan_name
            )));
        }
        if !services.insert(service.name.as_str()) {
            return Err(ConfigError::Duplicate { kind: "backing service", name: service.name.clone() });
        }
    }

    let mut apps = HashSet::new();
    for app in &plan.apps {
        if app.name.is_empty() {
            return Err(ConfigError::EmptyField(format!(
                "backing app name in {}/{}",
                plan.service_name, plan.plan_name
            )));
        }
        if app.path.is_empty() {
            return Err(ConfigError::EmptyField(format!("path of app '{}'", app.name)));
        }
        if !apps.insert(app.name.as_str()) {
            return Err(ConfigError::Duplicate { kind: "backing app", name: app.name.clone() });
        }
        for bound in &app.services {
            if !services.contains(bound.as_str()) {
                return Err(ConfigError::UndeclaredService {
                    app: app.name.clone(),
                    service: bound.clone(),
                });
            }
        }
        for spec in &app.parameters_transformers {
            if let ParametersTransformerSpec::PropertyMapping { include } = spec {
                if let Some(property) = include.iter().find(|p| !MAPPABLE_PROPERTIES.contains(&p.as_str())) {
                    return Err(ConfigError::UnknownProperty {
                        app: app.name.clone(),
                        property: property.clone(),
                    });
                }
            }
        }
        validate_providers(&app.name, &app.credential_providers)?;
        if app.properties.instances == Some(0) && app.properties.should_start() {
            tracing::warn!(app = %app.name, "App declares zero instances; it will be staged but serve nothing");
        }
    }

    validate_providers(
        &format!("{}/{} bindings", plan.service_name, plan.plan_name),
        &plan.binding_credentials,
    )
}

/// Every provider can mint a secret, and no kind appears twice for the same
/// owner; two of a kind would share a secret path and a client id.
fn validate_providers(owner: &str, providers: &[CredentialProviderSpec]) -> Result<(), ConfigError> {
    let mut kinds = HashSet::new();
    for provider in providers {
        if !kinds.insert(provider.kind()) {
            return Err(ConfigError::Duplicate {
                kind: "credential provider",
                name: format!("{} of {}", provider.kind(), owner),
            });
        }
        provider.policy().check().map_err(|reason| ConfigError::InvalidPolicy {
            owner: owner.to_string(),
            provider: provider.kind(),
            reason,
        })?;
    }
    Ok(())
}
