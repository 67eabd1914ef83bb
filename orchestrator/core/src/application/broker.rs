// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Broker
//!
//! Wires the application services from a validated configuration manifest.
//! Adapters (the marketplace front, the CLI) hold a [`Broker`] and call its
//! services; nothing else needs to know how the pieces fit together.

use crate::application::binding::{ServiceBindingService, StandardServiceBindingService};
use crate::application::credentials::CredentialProviders;
use crate::application::lifecycle::WorkflowContext;
use crate::application::management::{ManagementService, StandardManagementService};
use crate::application::operation_tracker::OperationTracker;
use crate::application::pipeline::DeploymentPipeline;
use crate::application::repository_factory::{create_platform, create_repositories, Repositories};
use crate::application::service_instance::{ServiceInstanceService, StandardServiceInstanceService};
use crate::domain::broker_config::BrokerConfigManifest;
use crate::domain::credentials::{CredentialGenerator, IdentityClient, SecretStore};
use crate::domain::platform::PlatformDeployer;
use crate::infrastructure::credentials::{InMemoryIdentityClient, InMemorySecretStore, RandomCredentialGenerator};
use crate::infrastructure::event_bus::EventBus;
use anyhow::Context;
use std::sync::Arc;
use tracing::info;

/// External collaborators of the credential providers.
pub struct Collaborators {
    pub secret_store: Arc<dyn SecretStore>,
    pub identity: Arc<dyn IdentityClient>,
    pub generator: Arc<dyn CredentialGenerator>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            secret_store: Arc::new(InMemorySecretStore::new()),
            identity: Arc::new(InMemoryIdentityClient::new()),
            generator: Arc::new(RandomCredentialGenerator),
        }
    }
}

pub struct Broker {
    pub config: Arc<BrokerConfigManifest>,
    pub platform: Arc<dyn PlatformDeployer>,
    pub event_bus: EventBus,
    pub tracker: Arc<OperationTracker>,
    pub service_instances: Arc<dyn ServiceInstanceService>,
    pub bindings: Arc<dyn ServiceBindingService>,
    pub management: Arc<dyn ManagementService>,
}

impl Broker {
    pub fn build(
        config: BrokerConfigManifest,
        platform: Arc<dyn PlatformDeployer>,
        repositories: Repositories,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        config.validate().context("Invalid broker configuration")?;
        let config = Arc::new(config);
        let event_bus = EventBus::with_default_capacity();

        let credentials = Arc::new(CredentialProviders::new(
            collaborators.generator,
            collaborators.secret_store,
            collaborators.identity,
        ));
        let pipeline = Arc::new(DeploymentPipeline::new(credentials.clone()));
        let tracker = Arc::new(OperationTracker::new(repositories.operations));
        let ctx = Arc::new(
            WorkflowContext::from_config(&config, platform.clone(), pipeline, event_bus.clone())
                .with_progress(tracker.clone()),
        );

        let service_instances = Arc::new(StandardServiceInstanceService::new(
            ctx.clone(),
            config.clone(),
            tracker.clone(),
            repositories.service_instances.clone(),
        ));
        let bindings = Arc::new(StandardServiceBindingService::new(
            credentials,
            config.clone(),
            repositories.service_instances.clone(),
            event_bus.clone(),
        ));
        let management = Arc::new(StandardManagementService::new(
            ctx,
            config.clone(),
            repositories.service_instances,
        ));

        info!(
            name = %config.metadata.name,
            plans = config.spec.services.len(),
            "Broker ready"
        );
        Ok(Self {
            config,
            platform,
            event_bus,
            tracker,
            service_instances,
            bindings,
            management,
        })
    }

    /// Builds the platform and state store named by the manifest, with
    /// in-memory credential collaborators.
    pub fn from_config(config: BrokerConfigManifest) -> anyhow::Result<Self> {
        config.validate().context("Invalid broker configuration")?;
        let platform = create_platform(&config.spec.platform)?;
        let repositories = create_repositories(&config.spec.state)?;
        Self::build(config, platform, repositories, Collaborators::default())
    }
}
