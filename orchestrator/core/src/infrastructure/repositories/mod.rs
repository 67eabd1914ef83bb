// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository contracts defined in
//! `crate::domain::repository`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve operation state and service instances
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! ## In-Memory Repositories
//!
//! Process-lifetime storage, the default:
//! - **InMemoryOperationStateRepository** - last operation per instance
//! - **InMemoryServiceInstanceRepository** - provisioned instance records
//!
//! ## Sled Repositories
//!
//! Embedded on-disk storage, see [`sled_store`]:
//! - **SledOperationStateRepository**
//! - **SledServiceInstanceRepository**

pub mod sled_store;

use crate::domain::operation::Operation;
use crate::domain::repository::{OperationStateRepository, RepositoryError, ServiceInstanceRepository};
use crate::domain::service_instance::{ServiceInstance, ServiceInstanceId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub use self::sled_store::{SledOperationStateRepository, SledServiceInstanceRepository};

#[derive(Default)]
pub struct InMemoryOperationStateRepository {
    operations: Arc<RwLock<HashMap<ServiceInstanceId, Operation>>>,
}

impl InMemoryOperationStateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationStateRepository for InMemoryOperationStateRepository {
    async fn save(&self, operation: &Operation) -> Result<(), RepositoryError> {
        let mut operations = self.operations.write().unwrap();
        operations.insert(operation.service_instance_id.clone(), operation.clone());
        Ok(())
    }

    async fn find_latest(&self, id: &ServiceInstanceId) -> Result<Option<Operation>, RepositoryError> {
        let operations = self.operations.read().unwrap();
        Ok(operations.get(id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<Operation>, RepositoryError> {
        let operations = self.operations.read().unwrap();
        Ok(operations.values().cloned().collect())
    }

    async fn delete(&self, id: &ServiceInstanceId) -> Result<(), RepositoryError> {
        let mut operations = self.operations.write().unwrap();
        operations.remove(id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryServiceInstanceRepository {
    instances: Arc<RwLock<HashMap<ServiceInstanceId, ServiceInstance>>>,
}

impl InMemoryServiceInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceInstanceRepository for InMemoryServiceInstanceRepository {
    async fn save(&self, instance: &ServiceInstance) -> Result<(), RepositoryError> {
        let mut instances = self.instances.write().unwrap();
        instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &ServiceInstanceId) -> Result<Option<ServiceInstance>, RepositoryError> {
        let instances = self.instances.read().unwrap();
        Ok(instances.get(id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<ServiceInstance>, RepositoryError> {
        let instances = self.instances.read().unwrap();
        let mut all: Vec<ServiceInstance> = instances.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn delete(&self, id: &ServiceInstanceId) -> Result<(), RepositoryError> {
        let mut instances = self.instances.write().unwrap();
        instances.remove(id);
        Ok(())
    }
}
