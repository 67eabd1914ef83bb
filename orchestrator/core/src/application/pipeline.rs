// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Parameter & Credential Pipeline
//!
//! Turns a declared backing application plus the caller's request
//! parameters into the [`ApplicationDeployment`] handed to the platform.
//! Parameter transformers run first, in declared order, then credential
//! providers. A stage only adds or overwrites the keys it owns; every other
//! declared environment entry passes through unchanged.
//!
//! Transformer names are resolved when the configuration is deserialized,
//! so building a transformer from its declaration cannot fail.

use crate::application::credentials::CredentialProviders;
use crate::domain::backing::{
    BackingApplication, BackingService, HealthCheckType, ParametersTransformerSpec,
    ServiceParametersTransformerSpec, MAPPABLE_PROPERTIES,
};
use crate::domain::credentials::CredentialError;
use crate::domain::operation::SubTaskKind;
use crate::domain::platform::ApplicationDeployment;
use crate::domain::service_instance::{Parameters, ServiceInstanceId};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid value for parameter '{parameter}': {reason}")]
    InvalidParameter { parameter: String, reason: String },

    #[error("Credential provider '{provider}' failed: {source}")]
    Credentials {
        provider: &'static str,
        #[source]
        source: CredentialError,
    },
}

impl PipelineError {
    /// Sub-task a failure of this stage is reported as.
    pub fn stage(&self) -> SubTaskKind {
        match self {
            PipelineError::InvalidParameter { .. } => SubTaskKind::TransformParameters,
            PipelineError::Credentials { .. } => SubTaskKind::GenerateCredentials,
        }
    }
}

/// One stage rewriting the deployment under construction.
pub trait ParametersTransformer: Send + Sync {
    fn name(&self) -> &'static str;

    fn transform(&self, parameters: &Parameters, deployment: &mut ApplicationDeployment) -> Result<(), PipelineError>;
}

/// Allow-listed parameters become environment entries.
pub struct EnvironmentMappingTransformer {
    include: Vec<String>,
}

impl ParametersTransformer for EnvironmentMappingTransformer {
    fn name(&self) -> &'static str {
        "environment-mapping"
    }

    fn transform(&self, parameters: &Parameters, deployment: &mut ApplicationDeployment) -> Result<(), PipelineError> {
        for key in &self.include {
            if let Some(value) = parameters.get(key) {
                deployment.environment.insert(key.clone(), render_value(value));
            }
        }
        Ok(())
    }
}

/// Allow-listed parameters rewrite deployment properties. The allow-list is
/// checked against [`MAPPABLE_PROPERTIES`] when the configuration loads.
pub struct PropertyMappingTransformer {
    include: Vec<String>,
}

impl ParametersTransformer for PropertyMappingTransformer {
    fn name(&self) -> &'static str {
        "property-mapping"
    }

    fn transform(&self, parameters: &Parameters, deployment: &mut ApplicationDeployment) -> Result<(), PipelineError> {
        let props = &mut deployment.properties;
        for key in &self.include {
            let Some(value) = parameters.get(key) else {
                continue;
            };
            match key.as_str() {
                "count" | "instances" => props.instances = Some(parse_count(key, value)?),
                "memory" => props.memory_mb = Some(parse_megabytes(key, value)?),
                "disk" => props.disk_mb = Some(parse_megabytes(key, value)?),
                "host" => props.host = Some(expect_string(key, value)?),
                "domain" => props.domain = Some(expect_string(key, value)?),
                "route" => {
                    let route = expect_string(key, value)?;
                    if !props.routes.contains(&route) {
                        props.routes.push(route);
                    }
                }
                "health-check-type" => {
                    props.health_check_type = Some(parse_health_check(key, value)?);
                }
                other => {
                    return Err(PipelineError::InvalidParameter {
                        parameter: other.to_string(),
                        reason: "not a deployment property".into(),
                    })
                }
            }
        }
        Ok(())
    }
}

/// Builds the transformer a declaration names.
pub fn transformer_for(spec: &ParametersTransformerSpec) -> Box<dyn ParametersTransformer> {
    match spec {
        ParametersTransformerSpec::EnvironmentMapping { include } => Box::new(EnvironmentMappingTransformer {
            include: include.clone(),
        }),
        ParametersTransformerSpec::PropertyMapping { include } => Box::new(PropertyMappingTransformer {
            include: include.clone(),
        }),
    }
}

/// Scalars render bare; objects and arrays as compact JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

fn invalid(parameter: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidParameter {
        parameter: parameter.to_string(),
        reason: reason.into(),
    }
}

fn expect_string(key: &str, value: &Value) -> Result<String, PipelineError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(key, format!("expected a string, got {}", value)))
}

fn parse_count(key: &str, value: &Value) -> Result<u32, PipelineError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| invalid(key, format!("expected an instance count, got {}", value)))
}

/// Accepts a plain number of megabytes or `512M`, `512MB`, `1G`, `1GB`.
fn parse_megabytes(key: &str, value: &Value) -> Result<u32, PipelineError> {
    let bad = || invalid(key, format!("expected a size such as 512M or 1G, got {}", value));
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()).ok_or_else(bad),
        Value::String(s) => {
            let s = s.trim().to_ascii_uppercase();
            let s = s.strip_suffix('B').unwrap_or(s.as_str());
            let (digits, factor) = if let Some(d) = s.strip_suffix('G') {
                (d, 1024)
            } else if let Some(d) = s.strip_suffix('M') {
                (d, 1)
            } else {
                (s, 1)
            };
            digits
                .trim()
                .parse::<u32>()
                .ok()
                .and_then(|n| n.checked_mul(factor))
                .ok_or_else(bad)
        }
        _ => Err(bad()),
    }
}

fn parse_health_check(key: &str, value: &Value) -> Result<HealthCheckType, PipelineError> {
    match expect_string(key, value)?.as_str() {
        "port" => Ok(HealthCheckType::Port),
        "process" | "none" => Ok(HealthCheckType::Process),
        "http" => Ok(HealthCheckType::Http),
        other => Err(invalid(key, format!("unknown health check type '{}'", other))),
    }
}

/// Parameters sent to the platform for a backing service: its declared
/// parameters overlaid with allow-listed caller parameters.
pub fn service_parameters(service: &BackingService, request: &Parameters) -> Parameters {
    let mut parameters = service.parameters.clone();
    for spec in &service.parameters_transformers {
        match spec {
            ServiceParametersTransformerSpec::ParametersMapping { include } => {
                for key in include {
                    if let Some(value) = request.get(key) {
                        parameters.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }
    parameters
}

/// Applies the parameter transformers of `app` only. No secrets are minted
/// and nothing leaves the process.
pub fn transform(
    app: &BackingApplication,
    resolved_name: &str,
    parameters: &Parameters,
) -> Result<ApplicationDeployment, PipelineError> {
    let mut deployment = ApplicationDeployment {
        name: resolved_name.to_string(),
        path: app.path.clone(),
        environment: app.environment.clone(),
        properties: app.properties.clone(),
    };
    for spec in &app.parameters_transformers {
        let transformer = transformer_for(spec);
        transformer.transform(parameters, &mut deployment)?;
        debug!(app = %app.name, transformer = transformer.name(), "Applied parameters transformer");
    }
    Ok(deployment)
}

/// Full pipeline: parameter transformers, then credential providers.
pub struct DeploymentPipeline {
    credentials: Arc<CredentialProviders>,
}

impl DeploymentPipeline {
    pub fn new(credentials: Arc<CredentialProviders>) -> Self {
        Self { credentials }
    }

    pub fn credentials(&self) -> &Arc<CredentialProviders> {
        &self.credentials
    }

    pub async fn prepare(
        &self,
        instance_id: &ServiceInstanceId,
        app: &BackingApplication,
        resolved_name: &str,
        parameters: &Parameters,
    ) -> Result<ApplicationDeployment, PipelineError> {
        let mut deployment = transform(app, resolved_name, parameters)?;
        self.credentials
            .provide(instance_id, &app.name, &app.credential_providers, &mut deployment.environment)
            .await?;
        Ok(deployment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backing::Environment;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap_or_default()
    }

    fn app() -> BackingApplication {
        let mut app = BackingApplication::new("web", "docker://web:1");
        app.environment = Environment::from([
            ("SPRING_PROFILES_ACTIVE".to_string(), "cloud".to_string()),
            ("LOG_LEVEL".to_string(), "info".to_string()),
        ]);
        app
    }

    #[test]
    fn empty_pipeline_passes_environment_through() {
        let app = app();
        let deployment = transform(&app, "web", &params(json!({ "LOG_LEVEL": "debug" }))).unwrap();
        assert_eq!(deployment.environment, app.environment);
        assert_eq!(deployment.properties, app.properties);
    }

    #[test]
    fn environment_mapping_honours_the_allow_list() {
        let mut app = app();
        app.parameters_transformers = vec![ParametersTransformerSpec::EnvironmentMapping {
            include: vec!["LOG_LEVEL".into(), "FEATURES".into()],
        }];
        let deployment = transform(
            &app,
            "web",
            &params(json!({
                "LOG_LEVEL": "debug",
                "FEATURES": { "beta": true },
                "SECRET": "not mapped"
            })),
        )
        .unwrap();

        assert_eq!(deployment.environment["LOG_LEVEL"], "debug");
        assert_eq!(deployment.environment["FEATURES"], r#"{"beta":true}"#);
        assert_eq!(deployment.environment["SPRING_PROFILES_ACTIVE"], "cloud");
        assert!(!deployment.environment.contains_key("SECRET"));
    }

    #[test]
    fn property_mapping_rewrites_properties() {
        let mut app = app();
        app.parameters_transformers = vec![ParametersTransformerSpec::PropertyMapping {
            include: vec!["count".into(), "memory".into(), "host".into(), "domain".into()],
        }];
        let deployment = transform(
            &app,
            "web-si-1",
            &params(json!({ "count": "3", "memory": "1G", "host": "shop", "domain": "apps.example.com", "disk": "2G" })),
        )
        .unwrap();

        assert_eq!(deployment.name, "web-si-1");
        assert_eq!(deployment.properties.instances, Some(3));
        assert_eq!(deployment.properties.memory_mb, Some(1024));
        assert_eq!(deployment.properties.disk_mb, None);
        assert_eq!(deployment.properties.all_routes(), vec!["shop.apps.example.com".to_string()]);
        assert_eq!(deployment.environment, app.environment);
    }

    #[test]
    fn bad_property_values_are_rejected() {
        let mut app = app();
        app.parameters_transformers = vec![ParametersTransformerSpec::PropertyMapping {
            include: vec!["memory".into()],
        }];
        let err = transform(&app, "web", &params(json!({ "memory": "lots" }))).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter { ref parameter, .. } if parameter == "memory"));
    }

    #[test]
    fn failures_name_their_stage() {
        let err = invalid("memory", "bad");
        assert_eq!(err.stage(), SubTaskKind::TransformParameters);
        let err = PipelineError::Credentials {
            provider: "basic-auth",
            source: CredentialError::InvalidPolicy("short".into()),
        };
        assert_eq!(err.stage(), SubTaskKind::GenerateCredentials);
    }

    #[test]
    fn every_mappable_property_is_handled() {
        for key in MAPPABLE_PROPERTIES {
            let mut app = app();
            app.parameters_transformers = vec![ParametersTransformerSpec::PropertyMapping {
                include: vec![key.to_string()],
            }];
            let value = match *key {
                "count" | "instances" | "memory" | "disk" => json!(2),
                "health-check-type" => json!("http"),
                _ => json!("shop"),
            };
            let mut parameters = Parameters::new();
            parameters.insert(key.to_string(), value);
            let result = transform(&app, "web", &parameters);
            assert!(result.is_ok(), "{} was not mapped: {:?}", key, result.err());
        }
    }

    #[test]
    fn sizes_parse_in_megabytes() {
        assert_eq!(parse_megabytes("m", &json!(256)).unwrap(), 256);
        assert_eq!(parse_megabytes("m", &json!("512M")).unwrap(), 512);
        assert_eq!(parse_megabytes("m", &json!("2gb")).unwrap(), 2048);
        assert!(parse_megabytes("m", &json!(-1)).is_err());
    }

    #[test]
    fn service_parameters_overlay_allow_listed_values() {
        let mut service = BackingService::new("db", "postgres", "standard");
        service.parameters.insert("version".into(), json!("16"));
        service.parameters_transformers = vec![ServiceParametersTransformerSpec::ParametersMapping {
            include: vec!["storage_gb".into()],
        }];
        let mapped = service_parameters(&service, &params(json!({ "storage_gb": 20, "count": 3 })));
        assert_eq!(mapped, params(json!({ "version": "16", "storage_gb": 20 })));
    }
}
