// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Lifecycle workflow plumbing shared by create, update and delete.
//!
//! # DDD Pattern: Application Service
//!
//! - **Layer:** Application
//! - **Responsibility:** resolve where the resources of a plan live, bound
//!   every remote call by the API timeout, and report each settled sub-task
//! - **Collaborators:**
//!   - Domain: TargetResolver, PlatformDeployer, Operation
//!   - Application: DeploymentPipeline
//!   - Infrastructure: EventBus

use crate::application::operation_tracker::OperationTracker;
use crate::application::pipeline::{DeploymentPipeline, PipelineError};
use crate::domain::backing::{BackingApplication, BackingService};
use crate::domain::broker_config::{BrokerConfigManifest, ServicePlanConfig};
use crate::domain::events::OperationEvent;
use crate::domain::operation::{Operation, OperationId, OperationKind, SubTask, SubTaskKind};
use crate::domain::platform::{ApplicationDeployment, PlatformDeployer, PlatformError};
use crate::domain::repository::RepositoryError;
use crate::domain::service_instance::{Parameters, ServiceInstanceId};
use crate::domain::target::{DeploymentTarget, ResolvedResource, TargetResolver, TargetStrategy};
use crate::infrastructure::event_bus::EventBus;
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Cannot {requested} service instance {service_instance_id}: {active} already in progress")]
    Conflict {
        service_instance_id: ServiceInstanceId,
        active: OperationKind,
        requested: OperationKind,
    },

    #[error("No plan '{plan}' configured for service '{service}'")]
    UnknownService { service: String, plan: String },

    #[error("Service instance {0} not found")]
    ServiceInstanceNotFound(ServiceInstanceId),

    #[error("Operation {operation_id} on service instance {service_instance_id} was replaced by a newer one")]
    OperationSuperseded {
        service_instance_id: ServiceInstanceId,
        operation_id: OperationId,
    },

    #[error("Operation {operation_id} on service instance {service_instance_id} did not settle within {waited:?}")]
    OperationTimeout {
        service_instance_id: ServiceInstanceId,
        operation_id: OperationId,
        waited: Duration,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// A backing application at its resolved target.
#[derive(Debug, Clone)]
pub struct ResolvedApp<'a> {
    pub spec: &'a BackingApplication,
    pub resource: ResolvedResource,
}

/// A backing service at its resolved target.
#[derive(Debug, Clone)]
pub struct ResolvedService<'a> {
    pub spec: &'a BackingService,
    pub resource: ResolvedResource,
}

/// Every resource of a plan, resolved once per operation.
#[derive(Debug, Clone)]
pub struct PlanLayout<'a> {
    pub apps: Vec<ResolvedApp<'a>>,
    pub services: Vec<ResolvedService<'a>>,
}

impl<'a> PlanLayout<'a> {
    pub fn service(&self, name: &str) -> Option<&ResolvedService<'a>> {
        self.services.iter().find(|s| s.spec.name == name)
    }

    /// Namespaces owned by this service instance, in a stable order.
    pub fn dedicated_namespaces(&self) -> Vec<String> {
        self.apps
            .iter()
            .map(|a| &a.resource.target)
            .chain(self.services.iter().map(|s| &s.resource.target))
            .filter(|t| t.dedicated_namespace)
            .map(|t| t.namespace.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Runs `tasks` with at most `limit` in flight; results keep the input order.
///
/// The futures are built eagerly, so the returned future holds no closure
/// and stays `Send` whenever the tasks are.
pub fn join_bounded<I>(limit: usize, tasks: I) -> impl Future<Output = Vec<<I::Item as Future>::Output>>
where
    I: IntoIterator,
    I::Item: Future,
{
    let permits = Arc::new(Semaphore::new(limit.max(1)));
    let tasks: Vec<_> = tasks
        .into_iter()
        .map(|task| {
            let permits = permits.clone();
            async move {
                let _permit = permits.acquire_owned().await;
                task.await
            }
        })
        .collect();
    join_all(tasks)
}

/// Identifies the operation sub-tasks are reported against.
#[derive(Debug, Clone)]
pub struct OperationScope {
    pub operation_id: OperationId,
    pub service_instance_id: ServiceInstanceId,
}

impl From<&Operation> for OperationScope {
    fn from(operation: &Operation) -> Self {
        Self {
            operation_id: operation.id,
            service_instance_id: operation.service_instance_id.clone(),
        }
    }
}

pub struct WorkflowContext {
    pub platform: Arc<dyn PlatformDeployer>,
    pub resolver: TargetResolver,
    pub pipeline: Arc<DeploymentPipeline>,
    pub event_bus: EventBus,
    pub default_target: TargetStrategy,
    pub max_concurrency: usize,
    /// Bound on one plain remote call.
    pub api_timeout: Duration,
    /// Extra allowance for calls that poll until the platform settles.
    pub status_timeout: Duration,
    /// Where workflows save progress between phases, if anywhere.
    pub progress: Option<Arc<OperationTracker>>,
}

impl WorkflowContext {
    pub fn new(platform: Arc<dyn PlatformDeployer>, pipeline: Arc<DeploymentPipeline>, event_bus: EventBus) -> Self {
        Self {
            platform,
            resolver: TargetResolver::new("appbroker"),
            pipeline,
            event_bus,
            default_target: TargetStrategy::Default,
            max_concurrency: 4,
            api_timeout: Duration::from_secs(60),
            status_timeout: Duration::from_secs(300),
            progress: None,
        }
    }

    pub fn from_config(
        config: &BrokerConfigManifest,
        platform: Arc<dyn PlatformDeployer>,
        pipeline: Arc<DeploymentPipeline>,
        event_bus: EventBus,
    ) -> Self {
        let spec = &config.spec;
        Self {
            platform,
            resolver: TargetResolver::new(&spec.platform.default_namespace),
            pipeline,
            event_bus,
            default_target: spec.deployment.default_target,
            max_concurrency: spec.deployment.max_concurrency.max(1),
            api_timeout: spec.platform.api_timeout,
            status_timeout: spec.platform.status_timeout,
            progress: None,
        }
    }

    pub fn with_progress(mut self, tracker: Arc<OperationTracker>) -> Self {
        self.progress = Some(tracker);
        self
    }

    /// Saves the sub-tasks settled so far so status polls can report them.
    pub async fn checkpoint(&self, operation: &Operation) {
        let Some(tracker) = &self.progress else {
            return;
        };
        if let Err(e) = tracker.record(operation).await {
            warn!(
                operation_id = %operation.id,
                steps = operation.sub_tasks().len(),
                "Could not save operation progress: {}",
                e
            );
        }
    }

    pub fn layout<'a>(&self, instance_id: &ServiceInstanceId, plan: &'a ServicePlanConfig) -> PlanLayout<'a> {
        let plan_strategy = plan.strategy(self.default_target);
        PlanLayout {
            apps: plan
                .apps
                .iter()
                .map(|spec| ResolvedApp {
                    spec,
                    resource: self.resolver.resolve(
                        instance_id,
                        plan.strategy_for_app(spec, self.default_target),
                        &spec.name,
                    ),
                })
                .collect(),
            services: plan
                .services
                .iter()
                .map(|spec| ResolvedService {
                    spec,
                    resource: self.resolver.resolve(instance_id, plan_strategy, &spec.name),
                })
                .collect(),
        }
    }

    /// Runs one plain remote call under the API timeout.
    pub async fn call<T>(
        &self,
        what: &str,
        call: impl Future<Output = Result<T, PlatformError>>,
    ) -> Result<T, PlatformError> {
        self.bounded(what, self.api_timeout, call).await
    }

    /// Runs a remote call that also waits for the platform to settle.
    pub async fn call_polling<T>(
        &self,
        what: &str,
        call: impl Future<Output = Result<T, PlatformError>>,
    ) -> Result<T, PlatformError> {
        self.bounded(what, self.api_timeout + self.status_timeout, call).await
    }

    async fn bounded<T>(
        &self,
        what: &str,
        limit: Duration,
        call: impl Future<Output = Result<T, PlatformError>>,
    ) -> Result<T, PlatformError> {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout(format!("{} did not complete within {:?}", what, limit))),
        }
    }

    /// Logs and publishes a settled sub-task, then hands it back for
    /// recording on the operation.
    pub fn settle(&self, scope: &OperationScope, sub_task: SubTask) -> SubTask {
        match sub_task.failure() {
            Some(cause) => warn!(
                service_instance_id = %scope.service_instance_id,
                operation_id = %scope.operation_id,
                step = sub_task.kind.as_str(),
                resource = %sub_task.resource,
                cause,
                "Sub-task failed"
            ),
            None => info!(
                service_instance_id = %scope.service_instance_id,
                operation_id = %scope.operation_id,
                step = sub_task.kind.as_str(),
                resource = %sub_task.resource,
                "Sub-task settled"
            ),
        }
        self.event_bus.publish_operation_event(OperationEvent::SubTaskSettled {
            operation_id: scope.operation_id,
            service_instance_id: scope.service_instance_id.clone(),
            sub_task: sub_task.clone(),
            settled_at: Utc::now(),
        });
        sub_task
    }

    /// Creates the dedicated namespaces that do not exist yet.
    pub async fn ensure_namespaces(&self, scope: &OperationScope, namespaces: &[String]) -> Vec<SubTask> {
        let mut settled = Vec::with_capacity(namespaces.len());
        for namespace in namespaces {
            let sub_task = match self.call("get namespace", self.platform.namespace_exists(namespace)).await {
                Ok(true) => SubTask::already_satisfied(SubTaskKind::CreateNamespace, namespace.as_str()),
                Ok(false) => match self
                    .call("create namespace", self.platform.create_namespace(namespace))
                    .await
                {
                    Ok(()) => SubTask::succeeded(SubTaskKind::CreateNamespace, namespace.as_str()),
                    Err(e) => SubTask::failed(SubTaskKind::CreateNamespace, namespace.as_str(), e.to_string()),
                },
                Err(e) => SubTask::failed(SubTaskKind::CreateNamespace, namespace.as_str(), e.to_string()),
            };
            settled.push(self.settle(scope, sub_task));
        }
        settled
    }

    /// Runs the deployment pipeline for one app, settling a sub-task per
    /// stage it declares. `None` when a stage failed.
    pub async fn prepare(
        &self,
        scope: &OperationScope,
        app: &ResolvedApp<'_>,
        parameters: &Parameters,
        settled: &mut Vec<SubTask>,
    ) -> Option<ApplicationDeployment> {
        let name = app.resource.name.as_str();
        let transforms = !app.spec.parameters_transformers.is_empty();
        let credentials = !app.spec.credential_providers.is_empty();

        match self
            .pipeline
            .prepare(&scope.service_instance_id, app.spec, name, parameters)
            .await
        {
            Ok(deployment) => {
                if transforms {
                    settled.push(self.settle(scope, SubTask::succeeded(SubTaskKind::TransformParameters, name)));
                }
                if credentials {
                    settled.push(self.settle(scope, SubTask::succeeded(SubTaskKind::GenerateCredentials, name)));
                }
                Some(deployment)
            }
            Err(e) => {
                let stage = e.stage();
                if transforms && stage == SubTaskKind::GenerateCredentials {
                    settled.push(self.settle(scope, SubTask::succeeded(SubTaskKind::TransformParameters, name)));
                }
                settled.push(self.settle(scope, SubTask::failed(stage, name, e.to_string())));
                None
            }
        }
    }

    /// Whether `app` is currently bound to `service`. An absent service has
    /// no bindings.
    async fn is_bound(&self, target: &DeploymentTarget, app: &str, service: &str) -> Result<bool, PlatformError> {
        match self
            .call("list bindings", self.platform.bound_applications(target, service))
            .await
        {
            Ok(apps) => Ok(apps.iter().any(|a| a == app)),
            Err(PlatformError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Binds an app to a service; an existing binding is already satisfied.
    pub async fn bind(&self, scope: &OperationScope, target: &DeploymentTarget, app: &str, service: &str) -> SubTask {
        let resource = format!("{}->{}", app, service);
        let sub_task = match self.is_bound(target, app, service).await {
            Ok(true) => SubTask::already_satisfied(SubTaskKind::BindService, resource),
            Ok(false) => match self
                .call("bind service", self.platform.bind_service(target, app, service))
                .await
            {
                Ok(()) => SubTask::succeeded(SubTaskKind::BindService, resource),
                Err(PlatformError::AlreadyExists(_)) => SubTask::already_satisfied(SubTaskKind::BindService, resource),
                Err(e) => SubTask::failed(SubTaskKind::BindService, resource, e.to_string()),
            },
            Err(e) => SubTask::failed(SubTaskKind::BindService, resource, e.to_string()),
        };
        self.settle(scope, sub_task)
    }

    /// Unbinds an app from a service; a missing binding is already satisfied.
    pub async fn unbind(&self, scope: &OperationScope, target: &DeploymentTarget, app: &str, service: &str) -> SubTask {
        let resource = format!("{}->{}", app, service);
        let sub_task = match self.is_bound(target, app, service).await {
            Ok(false) => SubTask::already_satisfied(SubTaskKind::UnbindService, resource),
            Ok(true) => match self
                .call("unbind service", self.platform.unbind_service(target, app, service))
                .await
            {
                Ok(()) => SubTask::succeeded(SubTaskKind::UnbindService, resource),
                Err(PlatformError::NotFound(_)) => SubTask::already_satisfied(SubTaskKind::UnbindService, resource),
                Err(e) => SubTask::failed(SubTaskKind::UnbindService, resource, e.to_string()),
            },
            Err(e) => SubTask::failed(SubTaskKind::UnbindService, resource, e.to_string()),
        };
        self.settle(scope, sub_task)
    }
}
