// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Operation aggregate: one create/update/delete run against a service
//! instance, its sub-tasks and their aggregated status.
//!
//! State machine: `Pending -> InProgress -> {Succeeded | Failed}`. Terminal
//! states never move again. The aggregate is `Failed` as soon as any
//! required sub-task failed; completed sub-tasks are never rolled back.

use crate::domain::service_instance::ServiceInstanceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed)
    }

    /// The three states a polling client can observe. `Pending` is
    /// reported as in progress.
    pub fn as_polling_status(&self) -> &'static str {
        match self {
            OperationState::Pending | OperationState::InProgress => "in progress",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_polling_status())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskKind {
    CreateNamespace,
    CreateService,
    UpdateService,
    TransformParameters,
    GenerateCredentials,
    PushApplication,
    BindService,
    UnbindService,
    DeleteApplication,
    RevokeCredentials,
    DeleteService,
    DeleteNamespace,
}

impl SubTaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubTaskKind::CreateNamespace => "create namespace",
            SubTaskKind::CreateService => "create service",
            SubTaskKind::UpdateService => "update service",
            SubTaskKind::TransformParameters => "transform parameters",
            SubTaskKind::GenerateCredentials => "generate credentials",
            SubTaskKind::PushApplication => "push application",
            SubTaskKind::BindService => "bind service",
            SubTaskKind::UnbindService => "unbind service",
            SubTaskKind::DeleteApplication => "delete application",
            SubTaskKind::RevokeCredentials => "revoke credentials",
            SubTaskKind::DeleteService => "delete service",
            SubTaskKind::DeleteNamespace => "delete namespace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum SubTaskStatus {
    Succeeded,
    /// The resource was already in the desired state; nothing was mutated.
    AlreadySatisfied,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTask {
    pub kind: SubTaskKind,
    /// Concrete resource name, e.g. `web -> db` for a binding.
    pub resource: String,
    #[serde(flatten)]
    pub status: SubTaskStatus,
}

impl SubTask {
    pub fn succeeded(kind: SubTaskKind, resource: impl Into<String>) -> Self {
        Self { kind, resource: resource.into(), status: SubTaskStatus::Succeeded }
    }

    pub fn already_satisfied(kind: SubTaskKind, resource: impl Into<String>) -> Self {
        Self { kind, resource: resource.into(), status: SubTaskStatus::AlreadySatisfied }
    }

    pub fn failed(kind: SubTaskKind, resource: impl Into<String>, cause: impl Into<String>) -> Self {
        Self { kind, resource: resource.into(), status: SubTaskStatus::Failed(cause.into()) }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, SubTaskStatus::Failed(_))
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.status {
            SubTaskStatus::Failed(cause) => Some(cause),
            _ => None,
        }
    }
}

impl fmt::Display for SubTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            SubTaskStatus::Succeeded => write!(f, "{} {}", self.kind.as_str(), self.resource),
            SubTaskStatus::AlreadySatisfied => {
                write!(f, "{} {} (already satisfied)", self.kind.as_str(), self.resource)
            }
            SubTaskStatus::Failed(cause) => {
                write!(f, "{} {} failed: {}", self.kind.as_str(), self.resource, cause)
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("Invalid operation transition from {from:?} to {to:?}")]
    InvalidTransition { from: OperationState, to: OperationState },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub service_instance_id: ServiceInstanceId,
    pub state: OperationState,
    sub_tasks: Vec<SubTask>,
    /// Failure that is not attributable to a single sub-task (timeout,
    /// configuration lookup, state store).
    cause: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn new(kind: OperationKind, service_instance_id: ServiceInstanceId) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            service_instance_id,
            state: OperationState::Pending,
            sub_tasks: Vec::new(),
            cause: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn start(&mut self) -> Result<(), OperationError> {
        self.transition(OperationState::Pending, OperationState::InProgress)
    }

    pub fn sub_tasks(&self) -> &[SubTask] {
        &self.sub_tasks
    }

    pub fn record(&mut self, sub_task: SubTask) {
        self.sub_tasks.push(sub_task);
    }

    pub fn record_all(&mut self, sub_tasks: impl IntoIterator<Item = SubTask>) {
        self.sub_tasks.extend(sub_tasks);
    }

    pub fn has_failures(&self) -> bool {
        self.cause.is_some() || self.sub_tasks.iter().any(SubTask::is_failed)
    }

    /// Marks the operation failed with a cause outside any sub-task.
    pub fn abort(&mut self, cause: impl Into<String>) -> Result<(), OperationError> {
        if self.state != OperationState::InProgress {
            return Err(OperationError::InvalidTransition {
                from: self.state,
                to: OperationState::Failed,
            });
        }
        self.cause = Some(cause.into());
        self.finish().map(|_| ())
    }

    /// Settles the operation: failed if any sub-task failed, else succeeded.
    pub fn finish(&mut self) -> Result<OperationState, OperationError> {
        let to = if self.has_failures() {
            OperationState::Failed
        } else {
            OperationState::Succeeded
        };
        self.transition(OperationState::InProgress, to)?;
        self.ended_at = Some(Utc::now());
        Ok(to)
    }

    /// Human-readable summary for the polling client.
    pub fn description(&self) -> String {
        match self.state {
            OperationState::Pending => format!("{} queued", self.kind),
            OperationState::InProgress => {
                format!("{} in progress ({} steps done)", self.kind, self.sub_tasks.len())
            }
            OperationState::Succeeded => {
                let changed = self
                    .sub_tasks
                    .iter()
                    .filter(|t| t.status == SubTaskStatus::Succeeded)
                    .count();
                format!("{} completed ({} changes)", self.kind, changed)
            }
            OperationState::Failed => {
                let mut causes: Vec<String> = self
                    .sub_tasks
                    .iter()
                    .filter(|t| t.is_failed())
                    .map(ToString::to_string)
                    .collect();
                if let Some(cause) = &self.cause {
                    causes.insert(0, cause.clone());
                }
                format!("{} failed: {}", self.kind, causes.join("; "))
            }
        }
    }

    fn transition(&mut self, from: OperationState, to: OperationState) -> Result<(), OperationError> {
        if self.state != from {
            return Err(OperationError::InvalidTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }
}

/// What the polling adapter reads for a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperation {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub state: OperationState,
    pub description: String,
}

impl LastOperation {
    pub fn status(&self) -> &'static str {
        self.state.as_polling_status()
    }
}
