// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for each aggregate root: one repository per
//! aggregate, interface defined in the domain layer, implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `OperationStateRepository` | `Operation` (last per instance) | `InMemoryOperationStateRepository`, `SledOperationStateRepository` |
//! | `ServiceInstanceRepository` | `ServiceInstance` | `InMemoryServiceInstanceRepository`, `SledServiceInstanceRepository` |
//!
//! ## Storage Backend Abstraction
//!
//! The backend is chosen at startup from `spec.state.backend`. The in-memory
//! store lives as long as the process; the sled store survives restarts, but
//! an operation interrupted by a restart is left in progress and must be
//! retried by the caller.

use crate::domain::operation::Operation;
use crate::domain::service_instance::{ServiceInstance, ServiceInstanceId};
use async_trait::async_trait;

/// Last operation per service instance.
#[async_trait]
pub trait OperationStateRepository: Send + Sync {
    /// Save the operation as the latest for its service instance (create or
    /// overwrite).
    async fn save(&self, operation: &Operation) -> Result<(), RepositoryError>;

    async fn find_latest(&self, id: &ServiceInstanceId) -> Result<Option<Operation>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<Operation>, RepositoryError>;

    async fn delete(&self, id: &ServiceInstanceId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ServiceInstanceRepository: Send + Sync {
    async fn save(&self, instance: &ServiceInstance) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &ServiceInstanceId) -> Result<Option<ServiceInstance>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<ServiceInstance>, RepositoryError>;

    /// Removing an absent instance is not an error.
    async fn delete(&self, id: &ServiceInstanceId) -> Result<(), RepositoryError>;
}

/// Repository errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<sled::Error> for RepositoryError {
    fn from(err: sled::Error) -> Self {
        RepositoryError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
