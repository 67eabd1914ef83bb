// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::operation::{OperationId, OperationKind, OperationState, SubTask};
use crate::domain::service_instance::ServiceInstanceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operation lifecycle events published while a workflow runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationEvent {
    OperationStarted {
        operation_id: OperationId,
        service_instance_id: ServiceInstanceId,
        kind: OperationKind,
        started_at: DateTime<Utc>,
    },
    SubTaskSettled {
        operation_id: OperationId,
        service_instance_id: ServiceInstanceId,
        sub_task: SubTask,
        settled_at: DateTime<Utc>,
    },
    OperationCompleted {
        operation_id: OperationId,
        service_instance_id: ServiceInstanceId,
        kind: OperationKind,
        state: OperationState,
        description: String,
        completed_at: DateTime<Utc>,
    },
    OperationRejected {
        service_instance_id: ServiceInstanceId,
        kind: OperationKind,
        reason: String,
        rejected_at: DateTime<Utc>,
    },
}

/// Management actions on running backing apps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ManagementEvent {
    ActionRequested {
        service_instance_id: ServiceInstanceId,
        action: String,
        app: String,
        requested_at: DateTime<Utc>,
    },
    ActionFailed {
        service_instance_id: ServiceInstanceId,
        action: String,
        app: String,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

/// Service binding lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BindingEvent {
    BindingCreated {
        service_instance_id: ServiceInstanceId,
        binding_id: String,
        created_at: DateTime<Utc>,
    },
    BindingDeleted {
        service_instance_id: ServiceInstanceId,
        binding_id: String,
        deleted_at: DateTime<Utc>,
    },
}

impl OperationEvent {
    pub fn service_instance_id(&self) -> &ServiceInstanceId {
        match self {
            OperationEvent::OperationStarted { service_instance_id, .. }
            | OperationEvent::SubTaskSettled { service_instance_id, .. }
            | OperationEvent::OperationCompleted { service_instance_id, .. }
            | OperationEvent::OperationRejected { service_instance_id, .. } => service_instance_id,
        }
    }
}
