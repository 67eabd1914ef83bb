// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service Binding Use Cases
//!
//! A binding hands the caller a fresh set of credentials minted by the
//! plan's `binding_credentials` providers. Credentials are stored under the
//! binding's secret path and kept for the process lifetime so a repeated
//! bind returns the same values. Concurrent binds of one id mint once.

use crate::application::credentials::CredentialProviders;
use crate::application::lifecycle::WorkflowError;
use crate::domain::backing::CredentialProviderSpec;
use crate::domain::broker_config::BrokerConfigManifest;
use crate::domain::credentials::SecretData;
use crate::domain::events::BindingEvent;
use crate::domain::repository::ServiceInstanceRepository;
use crate::domain::service_instance::{BindRequest, BindingId, ServiceInstanceId};
use crate::infrastructure::event_bus::EventBus;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

type BindingKey = (ServiceInstanceId, BindingId);

#[async_trait]
pub trait ServiceBindingService: Send + Sync {
    /// Mints binding credentials. Binding the same id twice returns the
    /// credentials of the first call.
    async fn bind(&self, request: &BindRequest) -> Result<SecretData, WorkflowError>;

    /// Revokes binding credentials. Unknown bindings are fine.
    async fn unbind(
        &self,
        instance_id: &ServiceInstanceId,
        binding_id: &BindingId,
        service_name: &str,
        plan_name: &str,
    ) -> Result<(), WorkflowError>;
}

pub struct StandardServiceBindingService {
    credentials: Arc<CredentialProviders>,
    config: Arc<BrokerConfigManifest>,
    instances: Arc<dyn ServiceInstanceRepository>,
    event_bus: EventBus,
    bindings: Mutex<HashMap<BindingKey, Arc<OnceCell<SecretData>>>>,
}

impl StandardServiceBindingService {
    pub fn new(
        credentials: Arc<CredentialProviders>,
        config: Arc<BrokerConfigManifest>,
        instances: Arc<dyn ServiceInstanceRepository>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            credentials,
            config,
            instances,
            event_bus,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    fn providers(&self, service_name: &str, plan_name: &str) -> Result<&[CredentialProviderSpec], WorkflowError> {
        self.config
            .find_plan(service_name, plan_name)
            .map(|plan| plan.binding_credentials.as_slice())
            .ok_or_else(|| WorkflowError::UnknownService {
                service: service_name.to_string(),
                plan: plan_name.to_string(),
            })
    }

    async fn mint(&self, request: &BindRequest, providers: &[CredentialProviderSpec]) -> Result<SecretData, WorkflowError> {
        if self.instances.find_by_id(&request.instance_id).await?.is_none() {
            return Err(WorkflowError::ServiceInstanceNotFound(request.instance_id.clone()));
        }

        let credentials = self
            .credentials
            .provide_binding(&request.instance_id, &request.binding_id, providers)
            .await?;

        self.event_bus.publish_binding_event(BindingEvent::BindingCreated {
            service_instance_id: request.instance_id.clone(),
            binding_id: request.binding_id.to_string(),
            created_at: Utc::now(),
        });
        info!(
            service_instance_id = %request.instance_id,
            binding_id = %request.binding_id,
            keys = credentials.len(),
            "Service binding created"
        );
        Ok(credentials)
    }
}

#[async_trait]
impl ServiceBindingService for StandardServiceBindingService {
    async fn bind(&self, request: &BindRequest) -> Result<SecretData, WorkflowError> {
        let providers = self.providers(&request.service_name, &request.plan_name)?;
        let key = (request.instance_id.clone(), request.binding_id.clone());
        let cell = self.bindings.lock().entry(key.clone()).or_default().clone();
        if let Some(existing) = cell.get() {
            debug!(binding_id = %request.binding_id, "Binding already exists");
            return Ok(existing.clone());
        }

        let minted = cell.get_or_try_init(|| self.mint(request, providers)).await.cloned();
        if minted.is_err() {
            let mut bindings = self.bindings.lock();
            if bindings.get(&key).is_some_and(|held| Arc::ptr_eq(held, &cell) && !held.initialized()) {
                bindings.remove(&key);
            }
        }
        minted
    }

    async fn unbind(
        &self,
        instance_id: &ServiceInstanceId,
        binding_id: &BindingId,
        service_name: &str,
        plan_name: &str,
    ) -> Result<(), WorkflowError> {
        let providers = self.providers(service_name, plan_name)?;
        self.credentials
            .revoke_binding(instance_id, binding_id, providers)
            .await?;
        self.bindings
            .lock()
            .remove(&(instance_id.clone(), binding_id.clone()));

        self.event_bus.publish_binding_event(BindingEvent::BindingDeleted {
            service_instance_id: instance_id.clone(),
            binding_id: binding_id.to_string(),
            deleted_at: Utc::now(),
        });
        info!(service_instance_id = %instance_id, binding_id = %binding_id, "Service binding deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backing::BasicAuthSpec;
    use crate::domain::broker_config::ServicePlanConfig;
    use crate::domain::service_instance::{ProvisionRequest, ServiceInstance};
    use crate::infrastructure::credentials::{InMemoryIdentityClient, InMemorySecretStore, SeededCredentialGenerator};
    use crate::infrastructure::event_bus::BrokerEvent;
    use crate::infrastructure::repositories::InMemoryServiceInstanceRepository;

    struct Fixture {
        service: StandardServiceBindingService,
        store: Arc<InMemorySecretStore>,
        instances: Arc<InMemoryServiceInstanceRepository>,
        bus: EventBus,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemorySecretStore::new());
        let credentials = Arc::new(CredentialProviders::new(
            Arc::new(SeededCredentialGenerator::new(11)),
            store.clone(),
            Arc::new(InMemoryIdentityClient::new()),
        ));
        let mut config = BrokerConfigManifest::default();
        let mut plan = ServicePlanConfig::new("shop", "standard");
        plan.binding_credentials = vec![CredentialProviderSpec::BasicAuth(BasicAuthSpec::default())];
        config.spec.services.push(plan);

        let instances = Arc::new(InMemoryServiceInstanceRepository::new());
        instances
            .save(&ServiceInstance::new(&ProvisionRequest::new("si-1", "shop", "standard")))
            .await
            .unwrap();
        let bus = EventBus::with_default_capacity();
        Fixture {
            service: StandardServiceBindingService::new(credentials, Arc::new(config), instances.clone(), bus.clone()),
            store,
            instances,
            bus,
        }
    }

    fn request(instance: &str) -> BindRequest {
        BindRequest {
            instance_id: ServiceInstanceId::new(instance),
            binding_id: BindingId::new("b-1"),
            service_name: "shop".into(),
            plan_name: "standard".into(),
            parameters: Default::default(),
        }
    }

    #[tokio::test]
    async fn bind_is_idempotent() {
        let f = fixture().await;
        let mut events = f.bus.subscribe();

        let first = f.service.bind(&request("si-1")).await.unwrap();
        let second = f.service.bind(&request("si-1")).await.unwrap();

        assert_eq!(first, second);
        assert!(first.contains_key("SECURITY_USER_PASSWORD"));
        assert!(f.store.get("appbroker/si-1/bindings/b-1").is_some());
        assert!(matches!(
            events.try_recv().unwrap(),
            BrokerEvent::Binding(BindingEvent::BindingCreated { .. })
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_binds_mint_once() {
        let f = fixture().await;
        let mut events = f.bus.subscribe();
        let req = request("si-1");

        let minted = futures::future::join_all((0..8).map(|_| f.service.bind(&req))).await;
        let minted: Vec<_> = minted.into_iter().map(Result::unwrap).collect();

        assert!(minted.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(f.store.get("appbroker/si-1/bindings/b-1").as_ref(), Some(&minted[0]));
        assert!(matches!(
            events.try_recv().unwrap(),
            BrokerEvent::Binding(BindingEvent::BindingCreated { .. })
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_bind_can_be_retried() {
        let f = fixture().await;
        let req = request("si-2");
        assert!(f.service.bind(&req).await.is_err());

        f.instances
            .save(&ServiceInstance::new(&ProvisionRequest::new("si-2", "shop", "standard")))
            .await
            .unwrap();
        assert!(f.service.bind(&req).await.unwrap().contains_key("SECURITY_USER_PASSWORD"));
    }

    #[tokio::test]
    async fn unbind_revokes_stored_credentials() {
        let f = fixture().await;
        f.service.bind(&request("si-1")).await.unwrap();

        let id = ServiceInstanceId::new("si-1");
        let binding = BindingId::new("b-1");
        f.service.unbind(&id, &binding, "shop", "standard").await.unwrap();
        f.service.unbind(&id, &binding, "shop", "standard").await.unwrap();

        assert!(f.store.get("appbroker/si-1/bindings/b-1").is_none());
    }

    #[tokio::test]
    async fn unknown_instance_is_rejected() {
        let f = fixture().await;
        let err = f.service.bind(&request("nope")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ServiceInstanceNotFound(_)));
    }
}
