// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Sled-backed repositories.
//!
//! One database per broker, one tree per aggregate, keyed by service
//! instance id, values JSON-encoded. Every write is flushed before it
//! returns so a record observed by a poller survives a crash.

use crate::domain::operation::Operation;
use crate::domain::repository::{OperationStateRepository, RepositoryError, ServiceInstanceRepository};
use crate::domain::service_instance::{ServiceInstance, ServiceInstanceId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

const OPERATIONS_TREE: &str = "operations";
const INSTANCES_TREE: &str = "service_instances";

/// Opens (or creates) the broker database at `path`.
pub fn open_database(path: impl AsRef<Path>) -> Result<sled::Db, RepositoryError> {
    Ok(sled::open(path)?)
}

async fn put<T: Serialize>(tree: &sled::Tree, key: &ServiceInstanceId, value: &T) -> Result<(), RepositoryError> {
    let bytes = serde_json::to_vec(value)?;
    tree.insert(key.as_str().as_bytes(), bytes)?;
    tree.flush_async().await?;
    Ok(())
}

fn get<T: DeserializeOwned>(tree: &sled::Tree, key: &ServiceInstanceId) -> Result<Option<T>, RepositoryError> {
    match tree.get(key.as_str().as_bytes())? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn all<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>, RepositoryError> {
    tree.iter()
        .values()
        .map(|value| {
            let bytes = value?;
            Ok(serde_json::from_slice(&bytes)?)
        })
        .collect()
}

async fn remove(tree: &sled::Tree, key: &ServiceInstanceId) -> Result<(), RepositoryError> {
    tree.remove(key.as_str().as_bytes())?;
    tree.flush_async().await?;
    Ok(())
}

pub struct SledOperationStateRepository {
    tree: sled::Tree,
}

impl SledOperationStateRepository {
    pub fn new(db: &sled::Db) -> Result<Self, RepositoryError> {
        Ok(Self {
            tree: db.open_tree(OPERATIONS_TREE)?,
        })
    }
}

#[async_trait]
impl OperationStateRepository for SledOperationStateRepository {
    async fn save(&self, operation: &Operation) -> Result<(), RepositoryError> {
        put(&self.tree, &operation.service_instance_id, operation).await
    }

    async fn find_latest(&self, id: &ServiceInstanceId) -> Result<Option<Operation>, RepositoryError> {
        get(&self.tree, id)
    }

    async fn list_all(&self) -> Result<Vec<Operation>, RepositoryError> {
        all(&self.tree)
    }

    async fn delete(&self, id: &ServiceInstanceId) -> Result<(), RepositoryError> {
        remove(&self.tree, id).await
    }
}

pub struct SledServiceInstanceRepository {
    tree: sled::Tree,
}

impl SledServiceInstanceRepository {
    pub fn new(db: &sled::Db) -> Result<Self, RepositoryError> {
        Ok(Self {
            tree: db.open_tree(INSTANCES_TREE)?,
        })
    }
}

#[async_trait]
impl ServiceInstanceRepository for SledServiceInstanceRepository {
    async fn save(&self, instance: &ServiceInstance) -> Result<(), RepositoryError> {
        put(&self.tree, &instance.id, instance).await
    }

    async fn find_by_id(&self, id: &ServiceInstanceId) -> Result<Option<ServiceInstance>, RepositoryError> {
        get(&self.tree, id)
    }

    async fn list_all(&self) -> Result<Vec<ServiceInstance>, RepositoryError> {
        all(&self.tree)
    }

    async fn delete(&self, id: &ServiceInstanceId) -> Result<(), RepositoryError> {
        remove(&self.tree, id).await
    }
}
