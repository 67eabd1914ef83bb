// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Create Service Instance Workflow
//!
//! Order of work:
//!
//! 1. dedicated namespaces (a failure here ends the operation)
//! 2. backing services, concurrently
//! 3. backing apps, concurrently: pipeline, push, then bind
//!
//! An app is skipped when one of the services it binds to failed. Nothing
//! already created is rolled back; the caller retries or deletes.

use crate::application::lifecycle::{
    join_bounded, OperationScope, PlanLayout, ResolvedApp, ResolvedService, WorkflowContext,
};
use crate::application::pipeline::service_parameters;
use crate::domain::backing::service_fingerprint;
use crate::domain::broker_config::ServicePlanConfig;
use crate::domain::operation::{Operation, SubTask, SubTaskKind};
use crate::domain::platform::{PlatformError, ServiceDeployment};
use crate::domain::service_instance::{Parameters, ServiceInstance};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::instrument;

/// Outcome of provisioning one backing service.
pub(crate) struct ServiceOutcome {
    pub name: String,
    pub fingerprint: String,
    pub sub_task: SubTask,
    /// The instance did not exist before this operation.
    pub created: bool,
}

pub struct CreateServiceInstanceWorkflow {
    ctx: Arc<WorkflowContext>,
}

impl CreateServiceInstanceWorkflow {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(service_instance_id = %instance.id, operation_id = %operation.id))]
    pub async fn run(&self, plan: &ServicePlanConfig, instance: &mut ServiceInstance, operation: &mut Operation) {
        let ctx = &self.ctx;
        let scope = OperationScope::from(&*operation);
        let layout = ctx.layout(&instance.id, plan);

        let namespaces = layout.dedicated_namespaces();
        let settled = ctx.ensure_namespaces(&scope, &namespaces).await;
        let namespace_failed = settled.iter().any(SubTask::is_failed);
        operation.record_all(settled);
        if namespace_failed {
            return;
        }
        if let Some(namespace) = namespaces.first() {
            instance.namespace = Some(namespace.clone());
        }
        ctx.checkpoint(operation).await;

        let outcomes: Vec<ServiceOutcome> = join_bounded(
            ctx.max_concurrency,
            layout
                .services
                .iter()
                .map(|service| provision_service(ctx, &scope, service, &instance.parameters))
                .collect::<Vec<_>>(),
        )
        .await;

        let mut failed_services = HashSet::new();
        for outcome in outcomes {
            if outcome.sub_task.is_failed() {
                failed_services.insert(outcome.name);
            } else {
                instance.service_fingerprints.insert(outcome.name, outcome.fingerprint);
            }
            operation.record(outcome.sub_task);
        }
        ctx.checkpoint(operation).await;

        let parameters = &instance.parameters;
        let deployed: Vec<Vec<SubTask>> = join_bounded(
            ctx.max_concurrency,
            layout
                .apps
                .iter()
                .map(|app| deploy_app(ctx, &scope, &layout, app, parameters, &failed_services))
                .collect::<Vec<_>>(),
        )
        .await;
        for sub_tasks in deployed {
            operation.record_all(sub_tasks);
        }
    }
}

/// Creates a backing service unless it already exists at its target.
pub(crate) async fn provision_service(
    ctx: &WorkflowContext,
    scope: &OperationScope,
    service: &ResolvedService<'_>,
    request: &Parameters,
) -> ServiceOutcome {
    let spec = service.spec;
    let target = &service.resource.target;
    let name = service.resource.name.as_str();
    let parameters = service_parameters(spec, request);
    let fingerprint = service_fingerprint(&spec.service, &spec.plan, &parameters);

    let mut created = false;
    let sub_task = match ctx
        .call("get service instance", ctx.platform.service_instance_exists(target, name))
        .await
    {
        Ok(true) => SubTask::already_satisfied(SubTaskKind::CreateService, name),
        Ok(false) => {
            let deployment = ServiceDeployment {
                name: name.to_string(),
                service: spec.service.clone(),
                plan: spec.plan.clone(),
                parameters,
            };
            match ctx
                .call_polling("create service instance", ctx.platform.create_service_instance(target, &deployment))
                .await
            {
                Ok(()) => {
                    created = true;
                    SubTask::succeeded(SubTaskKind::CreateService, name)
                }
                Err(PlatformError::AlreadyExists(_)) => SubTask::already_satisfied(SubTaskKind::CreateService, name),
                Err(e) => SubTask::failed(SubTaskKind::CreateService, name, e.to_string()),
            }
        }
        Err(e) => SubTask::failed(SubTaskKind::CreateService, name, e.to_string()),
    };

    ServiceOutcome {
        name: spec.name.clone(),
        fingerprint,
        sub_task: ctx.settle(scope, sub_task),
        created,
    }
}

/// The first service `app` binds to that could not be provisioned.
pub(crate) fn failed_dependency<'a>(app: &'a ResolvedApp<'_>, failed_services: &HashSet<String>) -> Option<&'a str> {
    app.spec
        .services
        .iter()
        .find(|s| failed_services.contains(*s))
        .map(String::as_str)
}

async fn deploy_app(
    ctx: &WorkflowContext,
    scope: &OperationScope,
    layout: &PlanLayout<'_>,
    app: &ResolvedApp<'_>,
    parameters: &Parameters,
    failed_services: &HashSet<String>,
) -> Vec<SubTask> {
    let name = app.resource.name.as_str();
    let target = &app.resource.target;
    let mut settled = Vec::new();

    if let Some(dependency) = failed_dependency(app, failed_services) {
        settled.push(ctx.settle(
            scope,
            SubTask::failed(
                SubTaskKind::PushApplication,
                name,
                format!("skipped, backing service {} was not provisioned", dependency),
            ),
        ));
        return settled;
    }

    let Some(deployment) = ctx.prepare(scope, app, parameters, &mut settled).await else {
        return settled;
    };

    let pushed = match ctx
        .call_polling("push application", ctx.platform.push_application(target, &deployment))
        .await
    {
        Ok(_) => SubTask::succeeded(SubTaskKind::PushApplication, name),
        Err(e) => SubTask::failed(SubTaskKind::PushApplication, name, e.to_string()),
    };
    let push_failed = pushed.is_failed();
    settled.push(ctx.settle(scope, pushed));
    if push_failed {
        return settled;
    }

    for service in &app.spec.services {
        if let Some(resolved) = layout.service(service) {
            settled.push(ctx.bind(scope, target, name, &resolved.resource.name).await);
        }
    }
    settled
}
