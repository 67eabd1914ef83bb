// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Update Service Instance Workflow
//!
//! Backing services are re-provisioned only when their fingerprint changed
//! (or they are missing). Apps are always re-pushed so they pick up new
//! environment and parameters; a running app takes the platform's rolling
//! path. Bindings are refreshed for changed services and for services
//! flagged `rebind_on_update`. Nothing is deleted here.

use crate::application::create_service_instance::{failed_dependency, provision_service, ServiceOutcome};
use crate::application::lifecycle::{
    join_bounded, OperationScope, PlanLayout, ResolvedApp, ResolvedService, WorkflowContext,
};
use crate::application::pipeline::service_parameters;
use crate::domain::backing::service_fingerprint;
use crate::domain::broker_config::ServicePlanConfig;
use crate::domain::operation::{Operation, SubTask, SubTaskKind};
use crate::domain::platform::ServiceDeployment;
use crate::domain::service_instance::{Parameters, ServiceInstance};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct UpdateServiceInstanceWorkflow {
    ctx: Arc<WorkflowContext>,
}

impl UpdateServiceInstanceWorkflow {
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
        if instance.namespace.is_none() {
            instance.namespace = namespaces.first().cloned();
        }
        ctx.checkpoint(operation).await;

        let known = &*instance;
        let outcomes: Vec<(ServiceOutcome, bool)> = join_bounded(
            ctx.max_concurrency,
            layout
                .services
                .iter()
                .map(|service| reconcile_service(ctx, &scope, service, known))
                .collect::<Vec<_>>(),
        )
        .await;

        let mut failed_services = HashSet::new();
        let mut rebind = HashSet::new();
        for (outcome, changed) in outcomes {
            if outcome.sub_task.is_failed() {
                failed_services.insert(outcome.name);
            } else {
                if changed {
                    rebind.insert(outcome.name.clone());
                }
                instance.service_fingerprints.insert(outcome.name, outcome.fingerprint);
            }
            operation.record(outcome.sub_task);
        }
        for service in &layout.services {
            if service.spec.rebind_on_update {
                rebind.insert(service.spec.name.clone());
            }
        }
        debug!(rebind = ?rebind, "Bindings to refresh");
        ctx.checkpoint(operation).await;

        let parameters = &instance.parameters;
        let deployed: Vec<Vec<SubTask>> = join_bounded(
            ctx.max_concurrency,
            layout.apps.iter().map(|app| {
                redeploy_app(ctx, &scope, &layout, app, parameters, &failed_services, &rebind)
            })
            .collect::<Vec<_>>(),
        )
        .await;
        for sub_tasks in deployed {
            operation.record_all(sub_tasks);
        }
    }
}

/// Brings one backing service in line with its declaration. The flag is
/// true when the service was created or updated.
async fn reconcile_service(
    ctx: &WorkflowContext,
    scope: &OperationScope,
    service: &ResolvedService<'_>,
    instance: &ServiceInstance,
) -> (ServiceOutcome, bool) {
    let spec = service.spec;
    let target = &service.resource.target;
    let name = service.resource.name.as_str();
    let parameters = service_parameters(spec, &instance.parameters);
    let fingerprint = service_fingerprint(&spec.service, &spec.plan, &parameters);

    let exists = match ctx
        .call("get service instance", ctx.platform.service_instance_exists(target, name))
        .await
    {
        Ok(exists) => exists,
        Err(e) => {
            let sub_task = SubTask::failed(SubTaskKind::UpdateService, name, e.to_string());
            return (
                ServiceOutcome {
                    name: spec.name.clone(),
                    fingerprint,
                    sub_task: ctx.settle(scope, sub_task),
                    created: false,
                },
                false,
            );
        }
    };

    if !exists {
        let outcome = provision_service(ctx, scope, service, &instance.parameters).await;
        let changed = outcome.created;
        return (outcome, changed);
    }

    let (sub_task, changed) = if instance.fingerprint_of(&spec.name) == Some(fingerprint.as_str()) {
        (SubTask::already_satisfied(SubTaskKind::UpdateService, name), false)
    } else {
        let deployment = ServiceDeployment {
            name: name.to_string(),
            service: spec.service.clone(),
            plan: spec.plan.clone(),
            parameters,
        };
        match ctx
            .call_polling("update service instance", ctx.platform.update_service_instance(target, &deployment))
            .await
        {
            Ok(()) => (SubTask::succeeded(SubTaskKind::UpdateService, name), true),
            Err(e) => (SubTask::failed(SubTaskKind::UpdateService, name, e.to_string()), false),
        }
    };

    (
        ServiceOutcome {
            name: spec.name.clone(),
            fingerprint,
            sub_task: ctx.settle(scope, sub_task),
            created: false,
        },
        changed,
    )
}

async fn redeploy_app(
    ctx: &WorkflowContext,
    scope: &OperationScope,
    layout: &PlanLayout<'_>,
    app: &ResolvedApp<'_>,
    parameters: &Parameters,
    failed_services: &HashSet<String>,
    rebind: &HashSet<String>,
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
                format!("skipped, backing service {} was not updated", dependency),
            ),
        ));
        return settled;
    }

    let Some(deployment) = ctx.prepare(scope, app, parameters, &mut settled).await else {
        return settled;
    };

    let existed = match ctx
        .call("get application", ctx.platform.application_exists(target, name))
        .await
    {
        Ok(existed) => existed,
        Err(e) => {
            settled.push(ctx.settle(scope, SubTask::failed(SubTaskKind::PushApplication, name, e.to_string())));
            return settled;
        }
    };

    // (declared name, resolved name)
    let bound_services: Vec<(&str, &str)> = app
        .spec
        .services
        .iter()
        .filter_map(|s| layout.service(s))
        .map(|s| (s.spec.name.as_str(), s.resource.name.as_str()))
        .collect();

    // Refresh bindings before the rollout so new instances see them.
    if existed {
        for &(declared, service) in &bound_services {
            if rebind.contains(declared) {
                let unbound = ctx.unbind(scope, target, name, service).await;
                let unbind_failed = unbound.is_failed();
                settled.push(unbound);
                if unbind_failed {
                    return settled;
                }
            }
            settled.push(ctx.bind(scope, target, name, service).await);
        }
    }

    let pushed = match ctx
        .call_polling("push application", ctx.platform.push_application(target, &deployment))
        .await
    {
        Ok(_) => SubTask::succeeded(SubTaskKind::PushApplication, name),
        Err(e) => SubTask::failed(SubTaskKind::PushApplication, name, e.to_string()),
    };
    let push_failed = pushed.is_failed();
    settled.push(ctx.settle(scope, pushed));

    if !existed && !push_failed {
        for (_, service) in bound_services {
            settled.push(ctx.bind(scope, target, name, service).await);
        }
    }
    settled
}
