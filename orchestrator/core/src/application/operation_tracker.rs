// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Operation State Tracker
//!
//! Last operation per service instance, as read by status polling. Only one
//! operation may be active per service instance; a second one is rejected
//! with a conflict instead of interleaving. Recorded state never moves back
//! from terminal to in progress for the same operation; a new operation for
//! the same service instance overwrites the previous record.

use crate::application::lifecycle::WorkflowError;
use crate::domain::operation::{LastOperation, Operation, OperationId, OperationKind};
use crate::domain::repository::{OperationStateRepository, RepositoryError};
use crate::domain::service_instance::ServiceInstanceId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// The operation already active for a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveOperation {
    pub operation_id: OperationId,
    pub kind: OperationKind,
}

pub struct OperationTracker {
    repository: Arc<dyn OperationStateRepository>,
    active: Mutex<HashMap<ServiceInstanceId, ActiveOperation>>,
}

impl OperationTracker {
    pub fn new(repository: Arc<dyn OperationStateRepository>) -> Self {
        Self {
            repository,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Claims the service instance for a new operation and records it as in
    /// progress. Fails with a conflict when another operation is active.
    pub async fn begin(
        &self,
        kind: OperationKind,
        service_instance_id: &ServiceInstanceId,
    ) -> Result<Operation, WorkflowError> {
        let mut operation = Operation::new(kind, service_instance_id.clone());
        {
            let mut active = self.active.lock();
            if let Some(existing) = active.get(service_instance_id) {
                return Err(WorkflowError::Conflict {
                    service_instance_id: service_instance_id.clone(),
                    active: existing.kind,
                    requested: kind,
                });
            }
            active.insert(
                service_instance_id.clone(),
                ActiveOperation {
                    operation_id: operation.id,
                    kind,
                },
            );
        }

        // Pending -> InProgress cannot fail on a fresh operation.
        let _ = operation.start();
        if let Err(e) = self.repository.save(&operation).await {
            self.active.lock().remove(service_instance_id);
            return Err(e.into());
        }
        debug!(service_instance_id = %service_instance_id, operation_id = %operation.id, kind = %kind, "Operation started");
        Ok(operation)
    }

    /// Persists progress of an active operation.
    pub async fn record(&self, operation: &Operation) -> Result<(), RepositoryError> {
        if let Some(latest) = self.repository.find_latest(&operation.service_instance_id).await? {
            if latest.id == operation.id && latest.state.is_terminal() && !operation.state.is_terminal() {
                warn!(
                    operation_id = %operation.id,
                    "Ignoring in-progress update for an operation that already settled"
                );
                return Ok(());
            }
        }
        self.repository.save(operation).await
    }

    /// Persists the terminal state and releases the service instance.
    pub async fn complete(&self, operation: &Operation) -> Result<(), RepositoryError> {
        let result = self.record(operation).await;
        let mut active = self.active.lock();
        if active
            .get(&operation.service_instance_id)
            .is_some_and(|a| a.operation_id == operation.id)
        {
            active.remove(&operation.service_instance_id);
        }
        result
    }

    pub fn active(&self, service_instance_id: &ServiceInstanceId) -> Option<ActiveOperation> {
        self.active.lock().get(service_instance_id).copied()
    }

    pub async fn get(&self, service_instance_id: &ServiceInstanceId) -> Result<Option<Operation>, RepositoryError> {
        self.repository.find_latest(service_instance_id).await
    }

    pub async fn last_operation(
        &self,
        service_instance_id: &ServiceInstanceId,
    ) -> Result<Option<LastOperation>, RepositoryError> {
        Ok(self.get(service_instance_id).await?.map(|op| LastOperation {
            operation_id: op.id,
            kind: op.kind,
            state: op.state,
            description: op.description(),
        }))
    }
}
