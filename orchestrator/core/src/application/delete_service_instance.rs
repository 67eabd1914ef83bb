// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Delete Service Instance Workflow
//!
//! Teardown order is the reverse of create: apps (unbind, delete, revoke
//! credentials), then backing services, then dedicated namespaces. Every
//! step checks before it mutates, so a repeated delete only issues reads.
//! A service whose dependent app could not be removed is left in place, and
//! namespaces are only removed when everything else went away.

use crate::application::lifecycle::{
    join_bounded, OperationScope, PlanLayout, ResolvedApp, ResolvedService, WorkflowContext,
};
use crate::domain::broker_config::ServicePlanConfig;
use crate::domain::operation::{Operation, SubTask, SubTaskKind};
use crate::domain::platform::PlatformError;
use crate::domain::service_instance::ServiceInstanceId;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct DeleteServiceInstanceWorkflow {
    ctx: Arc<WorkflowContext>,
}

impl DeleteServiceInstanceWorkflow {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(service_instance_id = %instance_id, operation_id = %operation.id))]
    pub async fn run(&self, plan: &ServicePlanConfig, instance_id: &ServiceInstanceId, operation: &mut Operation) {
        let ctx = &self.ctx;
        let scope = OperationScope::from(&*operation);
        let layout = ctx.layout(instance_id, plan);

        let removed: Vec<(String, Vec<SubTask>)> = join_bounded(
            ctx.max_concurrency,
            layout
                .apps
                .iter()
                .map(|app| remove_app(ctx, &scope, &layout, app, instance_id))
                .collect::<Vec<_>>(),
        )
        .await;

        // Backing services still used by an app that is still there.
        let mut pinned = HashSet::new();
        for (app, sub_tasks) in removed {
            if sub_tasks.iter().any(SubTask::is_failed) {
                if let Some(resolved) = layout.apps.iter().find(|a| a.spec.name == app) {
                    pinned.extend(resolved.spec.services.iter().cloned());
                }
            }
            operation.record_all(sub_tasks);
        }
        ctx.checkpoint(operation).await;

        let services: Vec<SubTask> = join_bounded(
            ctx.max_concurrency,
            layout
                .services
                .iter()
                .map(|service| remove_service(ctx, &scope, service, &pinned))
                .collect::<Vec<_>>(),
        )
        .await;
        operation.record_all(services);
        ctx.checkpoint(operation).await;

        if operation.has_failures() {
            debug!("Keeping namespaces, earlier teardown steps failed");
            return;
        }
        for namespace in layout.dedicated_namespaces() {
            let sub_task = remove_namespace(ctx, &namespace).await;
            operation.record(ctx.settle(&scope, sub_task));
        }
    }
}

async fn remove_app(
    ctx: &WorkflowContext,
    scope: &OperationScope,
    layout: &PlanLayout<'_>,
    app: &ResolvedApp<'_>,
    instance_id: &ServiceInstanceId,
) -> (String, Vec<SubTask>) {
    let name = app.resource.name.as_str();
    let target = &app.resource.target;
    let providers = &app.spec.credential_providers;
    let mut settled = Vec::new();

    let exists = match ctx
        .call("get application", ctx.platform.application_exists(target, name))
        .await
    {
        Ok(exists) => exists,
        Err(e) => {
            settled.push(ctx.settle(scope, SubTask::failed(SubTaskKind::DeleteApplication, name, e.to_string())));
            return (app.spec.name.clone(), settled);
        }
    };

    if exists {
        for service in &app.spec.services {
            if let Some(resolved) = layout.service(service) {
                settled.push(ctx.unbind(scope, target, name, &resolved.resource.name).await);
            }
        }
        let deleted = match ctx
            .call_polling("delete application", ctx.platform.delete_application(target, name))
            .await
        {
            Ok(()) => SubTask::succeeded(SubTaskKind::DeleteApplication, name),
            Err(PlatformError::NotFound(_)) => SubTask::already_satisfied(SubTaskKind::DeleteApplication, name),
            Err(e) => SubTask::failed(SubTaskKind::DeleteApplication, name, e.to_string()),
        };
        let delete_failed = deleted.is_failed();
        settled.push(ctx.settle(scope, deleted));
        if delete_failed {
            return (app.spec.name.clone(), settled);
        }
    } else {
        settled.push(ctx.settle(scope, SubTask::already_satisfied(SubTaskKind::DeleteApplication, name)));
    }

    if !providers.is_empty() {
        // Runs even when the app is gone: a failed revoke is retried here.
        let revoked = match ctx.pipeline.credentials().revoke(instance_id, &app.spec.name, providers).await {
            Ok(true) => SubTask::succeeded(SubTaskKind::RevokeCredentials, name),
            Ok(false) => SubTask::already_satisfied(SubTaskKind::RevokeCredentials, name),
            Err(e) => SubTask::failed(SubTaskKind::RevokeCredentials, name, e.to_string()),
        };
        settled.push(ctx.settle(scope, revoked));
    }
    (app.spec.name.clone(), settled)
}

async fn remove_service(
    ctx: &WorkflowContext,
    scope: &OperationScope,
    service: &ResolvedService<'_>,
    pinned: &HashSet<String>,
) -> SubTask {
    let target = &service.resource.target;
    let name = service.resource.name.as_str();

    let sub_task = if pinned.contains(&service.spec.name) {
        SubTask::failed(
            SubTaskKind::DeleteService,
            name,
            "skipped, a bound application could not be removed",
        )
    } else {
        match ctx
            .call("get service instance", ctx.platform.service_instance_exists(target, name))
            .await
        {
            Ok(false) => SubTask::already_satisfied(SubTaskKind::DeleteService, name),
            Ok(true) => match ctx
                .call_polling("delete service instance", ctx.platform.delete_service_instance(target, name))
                .await
            {
                Ok(()) => SubTask::succeeded(SubTaskKind::DeleteService, name),
                Err(PlatformError::NotFound(_)) => SubTask::already_satisfied(SubTaskKind::DeleteService, name),
                Err(e) => SubTask::failed(SubTaskKind::DeleteService, name, e.to_string()),
            },
            Err(e) => SubTask::failed(SubTaskKind::DeleteService, name, e.to_string()),
        }
    };
    ctx.settle(scope, sub_task)
}

async fn remove_namespace(ctx: &WorkflowContext, namespace: &str) -> SubTask {
    match ctx.call("get namespace", ctx.platform.namespace_exists(namespace)).await {
        Ok(false) => return SubTask::already_satisfied(SubTaskKind::DeleteNamespace, namespace),
        Ok(true) => {}
        Err(e) => return SubTask::failed(SubTaskKind::DeleteNamespace, namespace, e.to_string()),
    }
    match ctx.call("list namespace", ctx.platform.namespace_is_empty(namespace)).await {
        Ok(true) => {}
        Ok(false) => {
            return SubTask::failed(
                SubTaskKind::DeleteNamespace,
                namespace,
                "namespace is not empty, resources not managed by this service instance remain",
            )
        }
        Err(e) => return SubTask::failed(SubTaskKind::DeleteNamespace, namespace, e.to_string()),
    }
    match ctx
        .call("delete namespace", ctx.platform.delete_namespace(namespace))
        .await
    {
        Ok(()) => SubTask::succeeded(SubTaskKind::DeleteNamespace, namespace),
        Err(e) => SubTask::failed(SubTaskKind::DeleteNamespace, namespace, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::create_service_instance::CreateServiceInstanceWorkflow;
    use crate::application::credentials::CredentialProviders;
    use crate::application::pipeline::DeploymentPipeline;
    use crate::domain::backing::{
        BackingApplication, BackingService, BasicAuthSpec, CredentialProviderSpec, DeploymentProperties,
    };
    use crate::domain::operation::{OperationKind, OperationState};
    use crate::domain::platform::{ApplicationDeployment, PlatformDeployer};
    use crate::domain::service_instance::{ProvisionRequest, ServiceInstance};
    use crate::domain::target::{DeploymentTarget, TargetStrategy};
    use crate::infrastructure::credentials::{InMemoryIdentityClient, InMemorySecretStore, SeededCredentialGenerator};
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::platform::InMemoryPlatform;

    struct Fixture {
        platform: Arc<InMemoryPlatform>,
        store: Arc<InMemorySecretStore>,
        ctx: Arc<WorkflowContext>,
    }

    fn fixture() -> Fixture {
        let platform = Arc::new(InMemoryPlatform::new().with_namespace("appbroker"));
        let store = Arc::new(InMemorySecretStore::new());
        let credentials = CredentialProviders::new(
            Arc::new(SeededCredentialGenerator::new(3)),
            store.clone(),
            Arc::new(InMemoryIdentityClient::new()),
        );
        let ctx = Arc::new(WorkflowContext::new(
            platform.clone(),
            Arc::new(DeploymentPipeline::new(Arc::new(credentials))),
            EventBus::with_default_capacity(),
        ));
        Fixture { platform, store, ctx }
    }

    fn plan() -> ServicePlanConfig {
        let mut plan = ServicePlanConfig::new("shop", "standard");
        plan.target = Some(TargetStrategy::PerInstanceNamespace);
        let mut web = BackingApplication::new("web", "docker://web:1");
        web.services = vec!["db".into()];
        web.credential_providers = vec![CredentialProviderSpec::BasicAuth(BasicAuthSpec {
            secret_reference: true,
            ..BasicAuthSpec::default()
        })];
        plan.apps = vec![web];
        plan.services = vec![BackingService::new("db", "postgres", "standard")];
        plan
    }

    fn operation(kind: OperationKind) -> Operation {
        let mut op = Operation::new(kind, ServiceInstanceId::new("si-1"));
        op.start().unwrap();
        op
    }

    async fn provision(f: &Fixture, plan: &ServicePlanConfig) {
        let mut instance = ServiceInstance::new(&ProvisionRequest::new("si-1", "shop", "standard"));
        let mut op = operation(OperationKind::Create);
        CreateServiceInstanceWorkflow::new(f.ctx.clone())
            .run(plan, &mut instance, &mut op)
            .await;
        assert_eq!(op.finish().unwrap(), OperationState::Succeeded);
    }

    async fn delete(f: &Fixture, plan: &ServicePlanConfig) -> Operation {
        let mut op = operation(OperationKind::Delete);
        DeleteServiceInstanceWorkflow::new(f.ctx.clone())
            .run(plan, &ServiceInstanceId::new("si-1"), &mut op)
            .await;
        op.finish().unwrap();
        op
    }

    #[tokio::test]
    async fn tears_down_in_reverse_order() {
        let f = fixture();
        let plan = plan();
        provision(&f, &plan).await;
        assert_eq!(f.store.paths().len(), 1);

        let op = delete(&f, &plan).await;

        assert_eq!(op.state, OperationState::Succeeded);
        let unbind = f.platform.position("unbind_service", "si-1/web->db").unwrap();
        let app = f.platform.position("delete_application", "si-1/web").unwrap();
        let service = f.platform.position("delete_service_instance", "si-1/db").unwrap();
        let namespace = f.platform.position("delete_namespace", "si-1").unwrap();
        assert!(unbind < app && app < service && service < namespace);
        assert!(op
            .sub_tasks()
            .iter()
            .any(|t| *t == SubTask::succeeded(SubTaskKind::RevokeCredentials, "web")));
        assert!(!f.platform.namespaces().contains(&"si-1".to_string()));
        assert!(f.store.paths().is_empty());
    }

    #[tokio::test]
    async fn second_delete_only_reads() {
        let f = fixture();
        let plan = plan();
        provision(&f, &plan).await;
        delete(&f, &plan).await;
        f.platform.clear_calls();
        let store_mutations = f.store.mutations();

        let op = delete(&f, &plan).await;

        assert_eq!(op.state, OperationState::Succeeded);
        assert!(f.platform.mutating_calls().is_empty());
        assert_eq!(f.store.mutations(), store_mutations);
        assert!(op
            .sub_tasks()
            .iter()
            .any(|t| *t == SubTask::already_satisfied(SubTaskKind::RevokeCredentials, "web")));
        assert!(op.description().contains("0 changes"));
    }

    #[tokio::test]
    async fn revoke_that_failed_is_retried_after_the_app_is_gone() {
        let f = fixture();
        let plan = plan();
        provision(&f, &plan).await;
        f.store.set_unavailable(true);

        let op = delete(&f, &plan).await;
        assert_eq!(op.state, OperationState::Failed);
        assert!(f.platform.application("si-1", "web").is_none());
        assert_eq!(f.store.paths().len(), 1);

        f.store.set_unavailable(false);
        let op = delete(&f, &plan).await;
        assert_eq!(op.state, OperationState::Succeeded);
        assert!(f.store.paths().is_empty());
        assert!(op
            .sub_tasks()
            .iter()
            .any(|t| *t == SubTask::succeeded(SubTaskKind::RevokeCredentials, "web")));
    }

    #[tokio::test]
    async fn foreign_resources_keep_the_namespace() {
        let f = fixture();
        let plan = plan();
        provision(&f, &plan).await;
        let deployment = ApplicationDeployment {
            name: "intruder".into(),
            path: "docker://other:1".into(),
            environment: Default::default(),
            properties: DeploymentProperties::default(),
        };
        f.platform
            .push_application(&DeploymentTarget::shared("si-1"), &deployment)
            .await
            .unwrap();

        let op = delete(&f, &plan).await;

        assert_eq!(op.state, OperationState::Failed);
        assert!(op.description().contains("not empty"));
        assert!(f.platform.namespaces().contains(&"si-1".to_string()));
        assert!(f.platform.application("si-1", "web").is_none());
    }

    #[tokio::test]
    async fn failed_app_removal_keeps_its_services() {
        let f = fixture();
        let plan = plan();
        provision(&f, &plan).await;
        f.platform
            .inject_fault("delete_application", None, PlatformError::Unauthorized("denied".into()));

        let op = delete(&f, &plan).await;

        assert_eq!(op.state, OperationState::Failed);
        assert!(f.platform.service_instance("si-1", "db").is_some());
        assert!(f.platform.position("delete_service_instance", "si-1/db").is_none());
        assert!(f.platform.position("delete_namespace", "si-1").is_none());
    }
}
