// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Management Use Cases
//!
//! Start, stop, restart, restage and status for the backing apps of a
//! service instance, at the targets they were deployed to. Not part of the
//! provisioning workflows and not tracked as an operation.
//!
//! # DDD Pattern: Application Service
//!
//! - **Layer:** Application
//! - **Responsibility:** Fan a lifecycle action out to every backing app
//! - **Collaborators:**
//!   - Domain: PlatformDeployer, TargetResolver
//!   - Infrastructure: ServiceInstanceRepository, EventBus

use crate::application::lifecycle::{join_bounded, WorkflowContext, WorkflowError};
use crate::domain::broker_config::BrokerConfigManifest;
use crate::domain::events::ManagementEvent;
use crate::domain::platform::{AppStatus, DeploymentId, PlatformError};
use crate::domain::repository::ServiceInstanceRepository;
use crate::domain::service_instance::ServiceInstanceId;
use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementAction {
    Start,
    Stop,
    Restart,
    Restage,
}

impl ManagementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagementAction::Start => "start",
            ManagementAction::Stop => "stop",
            ManagementAction::Restart => "restart",
            ManagementAction::Restage => "restage",
        }
    }
}

impl fmt::Display for ManagementAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ManagementService: Send + Sync {
    async fn start(&self, id: &ServiceInstanceId) -> Result<Vec<DeploymentId>, WorkflowError>;

    async fn stop(&self, id: &ServiceInstanceId) -> Result<Vec<DeploymentId>, WorkflowError>;

    async fn restart(&self, id: &ServiceInstanceId) -> Result<Vec<DeploymentId>, WorkflowError>;

    async fn restage(&self, id: &ServiceInstanceId) -> Result<Vec<DeploymentId>, WorkflowError>;

    async fn status(&self, id: &ServiceInstanceId) -> Result<Vec<AppStatus>, WorkflowError>;
}

pub struct StandardManagementService {
    ctx: Arc<WorkflowContext>,
    config: Arc<BrokerConfigManifest>,
    instances: Arc<dyn ServiceInstanceRepository>,
}

impl StandardManagementService {
    pub fn new(
        ctx: Arc<WorkflowContext>,
        config: Arc<BrokerConfigManifest>,
        instances: Arc<dyn ServiceInstanceRepository>,
    ) -> Self {
        Self { ctx, config, instances }
    }

    /// Deployment ids of every backing app of the instance.
    async fn deployments(&self, id: &ServiceInstanceId) -> Result<Vec<DeploymentId>, WorkflowError> {
        let instance = self
            .instances
            .find_by_id(id)
            .await?
            .ok_or_else(|| WorkflowError::ServiceInstanceNotFound(id.clone()))?;
        let plan = self
            .config
            .find_plan(&instance.service_name, &instance.plan_name)
            .ok_or_else(|| WorkflowError::UnknownService {
                service: instance.service_name.clone(),
                plan: instance.plan_name.clone(),
            })?;
        Ok(self
            .ctx
            .layout(id, plan)
            .apps
            .into_iter()
            .map(|app| DeploymentId::new(app.resource.target.namespace, app.resource.name))
            .collect())
    }

    async fn apply(&self, id: &ServiceInstanceId, action: ManagementAction) -> Result<Vec<DeploymentId>, WorkflowError> {
        let deployments = self.deployments(id).await?;
        let ctx = &self.ctx;

        let results: Vec<Result<(), PlatformError>> = join_bounded(
            ctx.max_concurrency,
            deployments.iter().map(|deployment| act(ctx, id, deployment, action)).collect::<Vec<_>>(),
        )
        .await;

        // Every app is attempted; the first failure is reported.
        for result in results {
            result?;
        }
        Ok(deployments)
    }
}

/// Applies `action` to one app and reports the outcome on the event bus.
async fn act(
    ctx: &WorkflowContext,
    id: &ServiceInstanceId,
    deployment: &DeploymentId,
    action: ManagementAction,
) -> Result<(), PlatformError> {
    ctx.event_bus.publish_management_event(ManagementEvent::ActionRequested {
        service_instance_id: id.clone(),
        action: action.to_string(),
        app: deployment.to_string(),
        requested_at: Utc::now(),
    });
    let result = match action {
        ManagementAction::Start => ctx.call_polling("start", ctx.platform.start_application(deployment)).await,
        ManagementAction::Stop => ctx.call("stop", ctx.platform.stop_application(deployment)).await,
        ManagementAction::Restart => ctx.call_polling("restart", ctx.platform.restart_application(deployment)).await,
        ManagementAction::Restage => ctx.call_polling("restage", ctx.platform.restage_application(deployment)).await,
    };
    match &result {
        Ok(()) => info!(service_instance_id = %id, app = %deployment, action = %action, "Management action done"),
        Err(e) => {
            error!(service_instance_id = %id, app = %deployment, action = %action, "Management action failed: {}", e);
            ctx.event_bus.publish_management_event(ManagementEvent::ActionFailed {
                service_instance_id: id.clone(),
                action: action.to_string(),
                app: deployment.to_string(),
                error: e.to_string(),
                failed_at: Utc::now(),
            });
        }
    }
    result
}

#[async_trait]
impl ManagementService for StandardManagementService {
    async fn start(&self, id: &ServiceInstanceId) -> Result<Vec<DeploymentId>, WorkflowError> {
        self.apply(id, ManagementAction::Start).await
    }

    async fn stop(&self, id: &ServiceInstanceId) -> Result<Vec<DeploymentId>, WorkflowError> {
        self.apply(id, ManagementAction::Stop).await
    }

    async fn restart(&self, id: &ServiceInstanceId) -> Result<Vec<DeploymentId>, WorkflowError> {
        self.apply(id, ManagementAction::Restart).await
    }

    async fn restage(&self, id: &ServiceInstanceId) -> Result<Vec<DeploymentId>, WorkflowError> {
        self.apply(id, ManagementAction::Restage).await
    }

    async fn status(&self, id: &ServiceInstanceId) -> Result<Vec<AppStatus>, WorkflowError> {
        let mut statuses = Vec::new();
        for deployment in self.deployments(id).await? {
            statuses.push(self.ctx.call("get status", self.ctx.platform.get_status(&deployment)).await?);
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::credentials::CredentialProviders;
    use crate::application::pipeline::DeploymentPipeline;
    use crate::domain::backing::BackingApplication;
    use crate::domain::broker_config::ServicePlanConfig;
    use crate::domain::platform::{AppState, ApplicationDeployment, PlatformDeployer};
    use crate::domain::service_instance::{ProvisionRequest, ServiceInstance};
    use crate::domain::target::{DeploymentTarget, TargetStrategy};
    use crate::infrastructure::credentials::{InMemoryIdentityClient, InMemorySecretStore, RandomCredentialGenerator};
    use crate::infrastructure::event_bus::{BrokerEvent, EventBus};
    use crate::infrastructure::platform::InMemoryPlatform;
    use crate::infrastructure::repositories::InMemoryServiceInstanceRepository;

    async fn service(platform: Arc<InMemoryPlatform>, bus: EventBus) -> StandardManagementService {
        let credentials = CredentialProviders::new(
            Arc::new(RandomCredentialGenerator),
            Arc::new(InMemorySecretStore::new()),
            Arc::new(InMemoryIdentityClient::new()),
        );
        let ctx = Arc::new(WorkflowContext::new(
            platform.clone(),
            Arc::new(DeploymentPipeline::new(Arc::new(credentials))),
            bus,
        ));
        let mut config = BrokerConfigManifest::default();
        let mut plan = ServicePlanConfig::new("shop", "standard");
        plan.target = Some(TargetStrategy::IdentifierSuffix);
        plan.apps = vec![BackingApplication::new("web", "docker://web:1")];
        config.spec.services.push(plan);

        let instances = Arc::new(InMemoryServiceInstanceRepository::new());
        instances
            .save(&ServiceInstance::new(&ProvisionRequest::new("si-1", "shop", "standard")))
            .await
            .unwrap();

        let deployment = ApplicationDeployment {
            name: "web-si-1".into(),
            path: "docker://web:1".into(),
            environment: Default::default(),
            properties: Default::default(),
        };
        platform
            .push_application(&DeploymentTarget::shared("appbroker"), &deployment)
            .await
            .unwrap();

        StandardManagementService::new(ctx, Arc::new(config), instances)
    }

    #[tokio::test]
    async fn stop_and_start_resolve_the_suffixed_app() {
        let platform = Arc::new(InMemoryPlatform::new().with_namespace("appbroker"));
        let management = service(platform.clone(), EventBus::with_default_capacity()).await;
        let id = ServiceInstanceId::new("si-1");

        let stopped = management.stop(&id).await.unwrap();
        assert_eq!(stopped, vec![DeploymentId::new("appbroker", "web-si-1")]);
        assert_eq!(platform.application("appbroker", "web-si-1").unwrap().state, AppState::Stopped);

        management.start(&id).await.unwrap();
        let status = management.status(&id).await.unwrap();
        assert!(status[0].is_healthy());
    }

    #[tokio::test]
    async fn failures_are_reported_and_published() {
        let platform = Arc::new(InMemoryPlatform::new().with_namespace("appbroker"));
        let bus = EventBus::with_default_capacity();
        let management = service(platform.clone(), bus.clone()).await;
        platform.inject_fault("restage_application", None, PlatformError::Staging("no droplet".into()));
        let mut events = bus.subscribe();

        let err = management.restage(&ServiceInstanceId::new("si-1")).await.unwrap_err();

        assert!(matches!(err, WorkflowError::Platform(PlatformError::Staging(_))));
        assert!(matches!(
            events.try_recv().unwrap(),
            BrokerEvent::Management(ManagementEvent::ActionRequested { .. })
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            BrokerEvent::Management(ManagementEvent::ActionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let platform = Arc::new(InMemoryPlatform::new().with_namespace("appbroker"));
        let management = service(platform, EventBus::with_default_capacity()).await;
        let err = management.status(&ServiceInstanceId::new("missing")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ServiceInstanceNotFound(_)));
    }
}
