// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Creates concrete repositories and the platform deployer from configuration,
//! keeping the domain layer free of infrastructure choices.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Map `spec.state` and `spec.platform` onto implementations

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;

use crate::domain::broker_config::{PlatformConfig, PlatformType, StateBackend, StateConfig};
use crate::domain::platform::PlatformDeployer;
use crate::domain::repository::{OperationStateRepository, ServiceInstanceRepository};
use crate::infrastructure::cloud_foundry::{CloudFoundryClient, CloudFoundryDeployer, Credentials};
use crate::infrastructure::platform::{InMemoryPlatform, StatusPoller};
use crate::infrastructure::repositories::sled_store::{
    open_database, SledOperationStateRepository, SledServiceInstanceRepository,
};
use crate::infrastructure::repositories::{InMemoryOperationStateRepository, InMemoryServiceInstanceRepository};

/// Bearer token used when no UAA client is configured.
pub const ACCESS_TOKEN_ENV: &str = "APPBROKER_ACCESS_TOKEN";

pub struct Repositories {
    pub operations: Arc<dyn OperationStateRepository>,
    pub service_instances: Arc<dyn ServiceInstanceRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            operations: Arc::new(InMemoryOperationStateRepository::new()),
            service_instances: Arc::new(InMemoryServiceInstanceRepository::new()),
        }
    }
}

/// Default sled directory: `<data dir>/appbroker/state`, else `~/.appbroker/state`.
fn default_state_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("appbroker").join("state"))
        .or_else(|| dirs::home_dir().map(|home| home.join(".appbroker").join("state")))
        .unwrap_or_else(|| PathBuf::from(".appbroker/state"))
}

/// Creates the repositories for the configured state backend
pub fn create_repositories(config: &StateConfig) -> anyhow::Result<Repositories> {
    match config.backend {
        StateBackend::InMemory => Ok(Repositories::in_memory()),
        StateBackend::Sled => {
            let path = config.path.clone().unwrap_or_else(default_state_path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create state directory {:?}", parent))?;
            }
            let db = open_database(&path).with_context(|| format!("Failed to open state store at {:?}", path))?;
            info!(path = ?path, "Using sled state store");
            Ok(Repositories {
                operations: Arc::new(SledOperationStateRepository::new(&db)?),
                service_instances: Arc::new(SledServiceInstanceRepository::new(&db)?),
            })
        }
    }
}

/// Creates the platform deployer for the configured platform type
pub fn create_platform(config: &PlatformConfig) -> anyhow::Result<Arc<dyn PlatformDeployer>> {
    match config.platform_type {
        PlatformType::InMemory => {
            info!(namespace = %config.default_namespace, "Using in-memory platform");
            Ok(Arc::new(
                InMemoryPlatform::new()
                    .with_namespace(&config.default_namespace)
                    .with_delete_routes(config.delete_routes),
            ))
        }
        PlatformType::CloudFoundry => {
            let Some(api_url) = config.api_url.as_deref() else {
                bail!("spec.platform.api_url is required for the cloud-foundry platform");
            };
            let Some(organization) = config.organization.as_deref() else {
                bail!("spec.platform.organization is required for the cloud-foundry platform");
            };

            let credentials = match config.client_id.as_deref() {
                Some(client_id) => {
                    let Some(token_url) = config.token_url.as_deref() else {
                        bail!("spec.platform.token_url is required when client_id is set");
                    };
                    Credentials::ClientCredentials {
                        token_url: token_url.to_string(),
                        client_id: client_id.to_string(),
                        client_secret: config.resolved_client_secret()?.unwrap_or_default(),
                    }
                }
                None => Credentials::Bearer(
                    std::env::var(ACCESS_TOKEN_ENV)
                        .with_context(|| format!("Either spec.platform.client_id or {} must be set", ACCESS_TOKEN_ENV))?,
                ),
            };

            let client = CloudFoundryClient::new(api_url, credentials, config.api_timeout)?;
            let poller = StatusPoller::new(config.polling_policy());
            info!(api_url, organization, "Using Cloud Foundry platform");
            Ok(Arc::new(
                CloudFoundryDeployer::new(client, organization, poller).with_delete_routes(config.delete_routes),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::{Operation, OperationKind};
    use crate::domain::service_instance::ServiceInstanceId;

    #[tokio::test]
    async fn sled_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StateConfig {
            backend: StateBackend::Sled,
            path: Some(dir.path().join("state")),
        };
        let id = ServiceInstanceId::new("si-1");
        let operation = Operation::new(OperationKind::Create, id.clone());
        {
            let repositories = create_repositories(&config).unwrap();
            repositories.operations.save(&operation).await.unwrap();
        }

        let reopened = create_repositories(&config).unwrap();
        let found = reopened.operations.find_latest(&id).await.unwrap().unwrap();
        assert_eq!(found.id, operation.id);
    }

    #[test]
    fn cloud_foundry_requires_an_api_url() {
        let config = PlatformConfig {
            platform_type: PlatformType::CloudFoundry,
            organization: Some("org".into()),
            ..PlatformConfig::default()
        };
        let err = create_platform(&config).err().unwrap();
        assert!(err.to_string().contains("api_url"));
    }

    #[test]
    fn client_credentials_need_a_token_url() {
        let config = PlatformConfig {
            platform_type: PlatformType::CloudFoundry,
            api_url: Some("https://api.example.com".into()),
            organization: Some("org".into()),
            client_id: Some("broker".into()),
            ..PlatformConfig::default()
        };
        let err = create_platform(&config).err().unwrap();
        assert!(err.to_string().contains("token_url"));
    }
}
