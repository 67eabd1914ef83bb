// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service Instance Use Cases
//!
//! Asynchronous front of the lifecycle workflows: accepts a request, claims
//! the service instance, runs the workflow in the background and answers
//! last-operation polls while it runs.
//!
//! # DDD Pattern: Application Service
//!
//! - **Layer:** Application
//! - **Responsibility:** Select the workflow by operation kind, enforce one
//!   active operation per service instance, persist the outcome
//! - **Collaborators:**
//!   - Domain: ServiceInstance, Operation, BrokerConfigManifest
//!   - Application: OperationTracker, lifecycle workflows
//!   - Infrastructure: ServiceInstanceRepository, EventBus

use crate::application::create_service_instance::CreateServiceInstanceWorkflow;
use crate::application::delete_service_instance::DeleteServiceInstanceWorkflow;
use crate::application::lifecycle::{WorkflowContext, WorkflowError};
use crate::application::operation_tracker::OperationTracker;
use crate::application::update_service_instance::UpdateServiceInstanceWorkflow;
use crate::domain::broker_config::{BrokerConfigManifest, ServicePlanConfig};
use crate::domain::events::OperationEvent;
use crate::domain::operation::{LastOperation, Operation, OperationId, OperationKind};
use crate::domain::repository::{RepositoryError, ServiceInstanceRepository};
use crate::domain::service_instance::{DeprovisionRequest, ProvisionRequest, ServiceInstance, ServiceInstanceId};
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[async_trait]
pub trait ServiceInstanceService: Send + Sync {
    /// Starts provisioning. Returns as soon as the operation is accepted;
    /// poll [`last_operation`](Self::last_operation) for the outcome.
    ///
    /// # Errors
    ///
    /// - UnknownService: no plan configured for the service/plan pair
    /// - Conflict: another operation is active for the instance
    async fn create(&self, request: ProvisionRequest) -> Result<OperationId, WorkflowError>;

    /// # Errors
    ///
    /// Same as [`create`](Self::create), plus ServiceInstanceNotFound when
    /// the instance was never created.
    async fn update(&self, request: ProvisionRequest) -> Result<OperationId, WorkflowError>;

    /// Deprovisioning an unknown instance still runs the teardown, which
    /// then only finds nothing to remove.
    async fn delete(&self, request: DeprovisionRequest) -> Result<OperationId, WorkflowError>;

    async fn last_operation(&self, id: &ServiceInstanceId) -> Result<Option<LastOperation>, WorkflowError>;

    async fn get(&self, id: &ServiceInstanceId) -> Result<Option<ServiceInstance>, WorkflowError>;

    async fn list(&self) -> Result<Vec<ServiceInstance>, WorkflowError>;
}

/// What a background operation works on.
enum Subject {
    Provisioned(ServiceInstance),
    Deprovisioned(ServiceInstanceId),
}

pub struct StandardServiceInstanceService {
    ctx: Arc<WorkflowContext>,
    config: Arc<BrokerConfigManifest>,
    tracker: Arc<OperationTracker>,
    instances: Arc<dyn ServiceInstanceRepository>,
}

impl StandardServiceInstanceService {
    pub fn new(
        ctx: Arc<WorkflowContext>,
        config: Arc<BrokerConfigManifest>,
        tracker: Arc<OperationTracker>,
        instances: Arc<dyn ServiceInstanceRepository>,
    ) -> Self {
        Self {
            ctx,
            config,
            tracker,
            instances,
        }
    }

    fn plan(&self, service: &str, plan: &str) -> Result<ServicePlanConfig, WorkflowError> {
        self.config
            .find_plan(service, plan)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownService {
                service: service.to_string(),
                plan: plan.to_string(),
            })
    }

    async fn begin(&self, kind: OperationKind, id: &ServiceInstanceId) -> Result<Operation, WorkflowError> {
        match self.tracker.begin(kind, id).await {
            Ok(operation) => {
                self.ctx.event_bus.publish_operation_event(OperationEvent::OperationStarted {
                    operation_id: operation.id,
                    service_instance_id: id.clone(),
                    kind,
                    started_at: operation.started_at,
                });
                info!(service_instance_id = %id, operation_id = %operation.id, kind = %kind, "Operation accepted");
                Ok(operation)
            }
            Err(e) => {
                if let WorkflowError::Conflict { .. } = e {
                    warn!(service_instance_id = %id, kind = %kind, "Operation rejected: {}", e);
                    self.ctx.event_bus.publish_operation_event(OperationEvent::OperationRejected {
                        service_instance_id: id.clone(),
                        kind,
                        reason: e.to_string(),
                        rejected_at: Utc::now(),
                    });
                }
                Err(e)
            }
        }
    }

    fn spawn(&self, plan: ServicePlanConfig, mut subject: Subject, mut operation: Operation) -> OperationId {
        let operation_id = operation.id;
        let ctx = self.ctx.clone();
        let tracker = self.tracker.clone();
        let instances = self.instances.clone();

        tokio::spawn(async move {
            match &mut subject {
                Subject::Provisioned(instance) if operation.kind == OperationKind::Update => {
                    UpdateServiceInstanceWorkflow::new(ctx.clone())
                        .run(&plan, instance, &mut operation)
                        .await
                }
                Subject::Provisioned(instance) => {
                    CreateServiceInstanceWorkflow::new(ctx.clone())
                        .run(&plan, instance, &mut operation)
                        .await
                }
                Subject::Deprovisioned(id) => {
                    DeleteServiceInstanceWorkflow::new(ctx.clone())
                        .run(&plan, id, &mut operation)
                        .await
                }
            }

            let persisted = match &mut subject {
                Subject::Provisioned(instance) => {
                    instance.updated_at = Utc::now();
                    instances.save(instance).await
                }
                Subject::Deprovisioned(id) if !operation.has_failures() => instances.delete(id).await,
                Subject::Deprovisioned(_) => Ok(()),
            };
            conclude(&ctx, &tracker, operation, persisted).await;
        });

        operation_id
    }
}

/// Settles the operation and releases the service instance.
async fn conclude(
    ctx: &WorkflowContext,
    tracker: &OperationTracker,
    mut operation: Operation,
    persisted: Result<(), RepositoryError>,
) {
    let settled = match persisted {
        Ok(()) => operation.finish().map(|_| ()),
        Err(e) => {
            error!(operation_id = %operation.id, "Failed to persist service instance: {}", e);
            operation.abort(format!("failed to persist service instance: {}", e))
        }
    };
    if let Err(e) = settled {
        error!(operation_id = %operation.id, "Operation could not be settled: {}", e);
    }

    counter!(
        "appbroker_operations_total",
        "kind" => operation.kind.as_str(),
        "status" => operation.state.as_polling_status()
    )
    .increment(1);

    if let Err(e) = tracker.complete(&operation).await {
        error!(operation_id = %operation.id, "Failed to record operation outcome: {}", e);
    }

    let description = operation.description();
    ctx.event_bus.publish_operation_event(OperationEvent::OperationCompleted {
        operation_id: operation.id,
        service_instance_id: operation.service_instance_id.clone(),
        kind: operation.kind,
        state: operation.state,
        description: description.clone(),
        completed_at: Utc::now(),
    });
    info!(
        service_instance_id = %operation.service_instance_id,
        operation_id = %operation.id,
        status = operation.state.as_polling_status(),
        "{}",
        description
    );
}

#[async_trait]
impl ServiceInstanceService for StandardServiceInstanceService {
    async fn create(&self, request: ProvisionRequest) -> Result<OperationId, WorkflowError> {
        let plan = self.plan(&request.service_name, &request.plan_name)?;
        let operation = self.begin(OperationKind::Create, &request.instance_id).await?;

        // A repeated create picks up where the previous attempt stopped.
        let instance = match self.instances.find_by_id(&request.instance_id).await {
            Ok(Some(mut existing)) => {
                existing.apply_update(&request);
                existing
            }
            Ok(None) => ServiceInstance::new(&request),
            Err(e) => {
                conclude(&self.ctx, &self.tracker, operation, Err(e.clone())).await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.instances.save(&instance).await {
            conclude(&self.ctx, &self.tracker, operation, Err(e.clone())).await;
            return Err(e.into());
        }

        Ok(self.spawn(plan, Subject::Provisioned(instance), operation))
    }

    async fn update(&self, request: ProvisionRequest) -> Result<OperationId, WorkflowError> {
        let plan = self.plan(&request.service_name, &request.plan_name)?;
        let mut instance = self
            .instances
            .find_by_id(&request.instance_id)
            .await?
            .ok_or_else(|| WorkflowError::ServiceInstanceNotFound(request.instance_id.clone()))?;
        let operation = self.begin(OperationKind::Update, &request.instance_id).await?;

        instance.apply_update(&request);
        Ok(self.spawn(plan, Subject::Provisioned(instance), operation))
    }

    async fn delete(&self, request: DeprovisionRequest) -> Result<OperationId, WorkflowError> {
        let plan = self.plan(&request.service_name, &request.plan_name)?;
        let operation = self.begin(OperationKind::Delete, &request.instance_id).await?;
        Ok(self.spawn(plan, Subject::Deprovisioned(request.instance_id), operation))
    }

    async fn last_operation(&self, id: &ServiceInstanceId) -> Result<Option<LastOperation>, WorkflowError> {
        Ok(self.tracker.last_operation(id).await?)
    }

    async fn get(&self, id: &ServiceInstanceId) -> Result<Option<ServiceInstance>, WorkflowError> {
        Ok(self.instances.find_by_id(id).await?)
    }

    async fn list(&self) -> Result<Vec<ServiceInstance>, WorkflowError> {
        Ok(self.instances.list_all().await?)
    }
}

/// Polls until `operation_id` settles and returns its final state. Gives up
/// after `deadline`, or as soon as a newer operation has replaced it.
pub async fn wait_for_operation(
    service: &dyn ServiceInstanceService,
    id: &ServiceInstanceId,
    operation_id: OperationId,
    poll_interval: Duration,
    deadline: Duration,
) -> Result<LastOperation, WorkflowError> {
    let started = tokio::time::Instant::now();
    loop {
        match service.last_operation(id).await? {
            Some(last) if last.operation_id == operation_id => {
                if last.state.is_terminal() {
                    return Ok(last);
                }
            }
            Some(_) => {
                return Err(WorkflowError::OperationSuperseded {
                    service_instance_id: id.clone(),
                    operation_id,
                })
            }
            None => {}
        }
        if started.elapsed() >= deadline {
            return Err(WorkflowError::OperationTimeout {
                service_instance_id: id.clone(),
                operation_id,
                waited: deadline,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}
