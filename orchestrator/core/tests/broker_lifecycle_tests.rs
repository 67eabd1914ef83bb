// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end lifecycle tests: a broker wired against the in-memory
//! platform, driven only through its public services.

use appbroker_core::application::repository_factory::Repositories;
use appbroker_core::application::{wait_for_operation, WorkflowError};
use appbroker_core::domain::broker_config::BrokerConfigManifest;
use appbroker_core::domain::operation::{LastOperation, OperationId, OperationKind, OperationState};
use appbroker_core::domain::platform::PlatformError;
use appbroker_core::domain::service_instance::{
    BindRequest, BindingId, DeprovisionRequest, ProvisionRequest, ServiceInstanceId,
};
use appbroker_core::infrastructure::platform::InMemoryPlatform;
use appbroker_core::infrastructure::{InMemoryIdentityClient, InMemorySecretStore};
use appbroker_core::{Broker, Collaborators};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
apiVersion: appbroker/v1
kind: BrokerConfig
metadata:
  name: lifecycle-tests
spec:
  platform:
    type: in-memory
  deployment:
    default_target: per-instance-namespace
  services:
    - service_name: shop
      plan_name: standard
      apps:
        - name: web
          path: docker://example/web:1.0
          environment:
            SPRING_PROFILES_ACTIVE: cloud
          properties:
            instances: 3
          services: [db]
          credential_providers:
            - name: basic-auth
              secret_reference: true
            - name: oauth2-client
        - name: api
          path: docker://example/api:1.0
          environment:
            LOG_LEVEL: info
      services:
        - name: db
          service: postgres
          plan: small
          parameters_transformers:
            - name: parameters-mapping
              include: [storage_gb]
      binding_credentials:
        - name: basic-auth
    - service_name: shop
      plan_name: shared
      target: identifier-suffix
      apps:
        - name: web
          path: docker://example/web:1.0
"#;

fn broker(platform: &Arc<InMemoryPlatform>) -> Broker {
    broker_with(platform, Collaborators::default())
}

fn broker_with(platform: &Arc<InMemoryPlatform>, collaborators: Collaborators) -> Broker {
    let config = BrokerConfigManifest::from_yaml_str(CONFIG).unwrap();
    Broker::build(config, platform.clone(), Repositories::in_memory(), collaborators).unwrap()
}

fn platform() -> Arc<InMemoryPlatform> {
    Arc::new(InMemoryPlatform::new().with_namespace("appbroker"))
}

async fn settle(broker: &Broker, id: &str, operation_id: OperationId) -> LastOperation {
    let id = ServiceInstanceId::new(id);
    wait_for_operation(
        broker.service_instances.as_ref(),
        &id,
        operation_id,
        Duration::from_millis(5),
        Duration::from_secs(10),
    )
    .await
    .unwrap()
}

async fn create(broker: &Broker, request: ProvisionRequest) -> LastOperation {
    let id = request.instance_id.clone();
    let operation_id = broker.service_instances.create(request).await.unwrap();
    settle(broker, id.as_str(), operation_id).await
}

async fn delete(broker: &Broker, id: &str, plan: &str) -> LastOperation {
    let operation_id = broker
        .service_instances
        .delete(DeprovisionRequest::new(id, "shop", plan))
        .await
        .unwrap();
    settle(broker, id, operation_id).await
}

#[tokio::test]
async fn per_instance_namespace_round_trip() {
    let platform = platform();
    let broker = broker(&platform);

    let created = create(&broker, ProvisionRequest::new("si-1", "shop", "standard")).await;
    assert_eq!(created.kind, OperationKind::Create);
    assert_eq!(created.state, OperationState::Succeeded);
    assert_eq!(created.status(), "succeeded");

    assert!(platform.namespaces().contains(&"si-1".to_string()));
    assert!(platform.application("si-1", "web").is_some());
    assert!(platform.application("si-1", "api").is_some());
    assert!(platform.service_instance("si-1", "db").is_some());
    assert!(platform.is_bound("si-1", "web", "db"));

    let instance = broker
        .service_instances
        .get(&ServiceInstanceId::new("si-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.namespace.as_deref(), Some("si-1"));

    let deleted = delete(&broker, "si-1", "standard").await;
    assert_eq!(deleted.state, OperationState::Succeeded);
    let unbind = platform.position("unbind_service", "si-1/web->db").unwrap();
    let remove_web = platform.position("delete_application", "si-1/web").unwrap();
    let remove_db = platform.position("delete_service_instance", "si-1/db").unwrap();
    assert!(unbind < remove_web);
    assert!(remove_web < remove_db);
    assert!(!platform.namespaces().contains(&"si-1".to_string()));
    assert!(platform.application("si-1", "web").is_none());
    assert!(platform.service_instance("si-1", "db").is_none());
    assert!(broker
        .service_instances
        .get(&ServiceInstanceId::new("si-1"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn services_exist_before_apps_bind_to_them() {
    let platform = platform();
    let broker = broker(&platform);

    create(&broker, ProvisionRequest::new("si-1", "shop", "standard")).await;

    let service = platform.position("create_service_instance", "si-1/db").unwrap();
    let push = platform.position("push_application", "si-1/web").unwrap();
    let bind = platform.position("bind_service", "si-1/web->db").unwrap();
    assert!(service < push);
    assert!(push < bind);
}

#[tokio::test]
async fn second_delete_makes_no_changes() {
    let platform = platform();
    let secrets = Arc::new(InMemorySecretStore::new());
    let identity = Arc::new(InMemoryIdentityClient::new());
    let broker = broker_with(
        &platform,
        Collaborators {
            secret_store: secrets.clone(),
            identity: identity.clone(),
            ..Collaborators::default()
        },
    );

    create(&broker, ProvisionRequest::new("si-1", "shop", "standard")).await;
    assert!(secrets.get("appbroker/si-1/web/basic-auth").is_some());
    assert_eq!(identity.client_ids().len(), 1);

    delete(&broker, "si-1", "standard").await;
    assert!(secrets.get("appbroker/si-1/web/basic-auth").is_none());
    assert!(identity.client_ids().is_empty());
    let secret_writes = secrets.mutations();
    let identity_writes = identity.mutations();
    platform.clear_calls();

    let again = delete(&broker, "si-1", "standard").await;

    assert_eq!(again.state, OperationState::Succeeded);
    assert!(platform.mutating_calls().is_empty(), "{:?}", platform.mutating_calls());
    assert!(!platform.calls().is_empty());
    assert_eq!(secrets.mutations(), secret_writes);
    assert_eq!(identity.mutations(), identity_writes);
}

#[tokio::test]
async fn update_is_rejected_while_create_runs() {
    let platform = platform();
    let broker = broker(&platform);
    let gate = platform.hold("push_application");

    let create_id = broker
        .service_instances
        .create(ProvisionRequest::new("si-1", "shop", "standard"))
        .await
        .unwrap();

    let err = broker
        .service_instances
        .update(ProvisionRequest::new("si-1", "shop", "standard"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Conflict {
            active: OperationKind::Create,
            requested: OperationKind::Update,
            ..
        }
    ));

    let polled = broker
        .service_instances
        .last_operation(&ServiceInstanceId::new("si-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(polled.operation_id, create_id);
    assert_eq!(polled.status(), "in progress");

    gate.open();
    let created = settle(&broker, "si-1", create_id).await;
    assert_eq!(created.state, OperationState::Succeeded);

    let update_id = broker
        .service_instances
        .update(ProvisionRequest::new("si-1", "shop", "standard"))
        .await
        .unwrap();
    assert_eq!(settle(&broker, "si-1", update_id).await.state, OperationState::Succeeded);
}

#[tokio::test]
async fn progress_is_visible_while_an_operation_runs() {
    let platform = platform();
    let broker = broker(&platform);
    let gate = platform.hold("push_application");
    let id = ServiceInstanceId::new("si-1");

    let create_id = broker
        .service_instances
        .create(ProvisionRequest::new("si-1", "shop", "standard"))
        .await
        .unwrap();

    // Namespace and backing service settle before any push.
    let polled = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let last = broker.service_instances.last_operation(&id).await.unwrap().unwrap();
            if last.description.contains("(2 steps done)") {
                return last;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("progress was never saved");
    assert_eq!(polled.operation_id, create_id);
    assert_eq!(polled.state, OperationState::InProgress);

    gate.open();
    assert_eq!(settle(&broker, "si-1", create_id).await.state, OperationState::Succeeded);
}

#[tokio::test]
async fn waiting_gives_up_on_a_stuck_or_replaced_operation() {
    let platform = platform();
    let broker = broker(&platform);
    let id = ServiceInstanceId::new("si-1");
    let gate = platform.hold("push_application");

    let create_id = broker
        .service_instances
        .create(ProvisionRequest::new("si-1", "shop", "standard"))
        .await
        .unwrap();
    let stuck = wait_for_operation(
        broker.service_instances.as_ref(),
        &id,
        create_id,
        Duration::from_millis(5),
        Duration::from_millis(50),
    )
    .await
    .unwrap_err();
    assert!(matches!(stuck, WorkflowError::OperationTimeout { operation_id, .. } if operation_id == create_id));

    gate.open();
    settle(&broker, "si-1", create_id).await;
    let delete_id = broker
        .service_instances
        .delete(DeprovisionRequest::new("si-1", "shop", "standard"))
        .await
        .unwrap();
    settle(&broker, "si-1", delete_id).await;

    let replaced = wait_for_operation(
        broker.service_instances.as_ref(),
        &id,
        create_id,
        Duration::from_millis(5),
        Duration::from_secs(10),
    )
    .await
    .unwrap_err();
    assert!(matches!(replaced, WorkflowError::OperationSuperseded { .. }));
}

#[tokio::test]
async fn update_keeps_the_app_serving() {
    let platform = platform();
    let broker = broker(&platform);

    create(&broker, ProvisionRequest::new("si-1", "shop", "standard")).await;
    let update_id = broker
        .service_instances
        .update(ProvisionRequest::new("si-1", "shop", "standard").with_parameter("storage_gb", json!(20)))
        .await
        .unwrap();
    let updated = settle(&broker, "si-1", update_id).await;
    assert_eq!(updated.state, OperationState::Succeeded);

    let history = platform.health_history("si-1", "web");
    assert!(history.len() > 1);
    assert!(history.iter().all(|sample| sample.running > 0), "{:?}", history);

    let last = history.last().unwrap();
    assert_eq!(last.build, 2);
    assert_eq!(last.new_build_running, 3);
    assert_eq!(last.running, 3);

    let db = platform.service_instance("si-1", "db").unwrap();
    assert_eq!(db.parameters.get("storage_gb"), Some(&json!(20)));
}

#[tokio::test]
async fn partial_failure_keeps_what_was_created() {
    let platform = platform();
    let broker = broker(&platform);
    platform.inject_fault("push_application", Some("si-1/api"), PlatformError::Staging("no droplet".into()));

    let created = create(&broker, ProvisionRequest::new("si-1", "shop", "standard")).await;

    assert_eq!(created.state, OperationState::Failed);
    assert!(created.description.contains("no droplet"), "{}", created.description);
    assert!(platform.application("si-1", "web").is_some());
    assert!(platform.service_instance("si-1", "db").is_some());
    assert!(platform
        .mutating_calls()
        .iter()
        .all(|call| !call.call.starts_with("delete")));

    // A retry picks up where the failed attempt stopped.
    platform.clear_fault("push_application");
    let retried = create(&broker, ProvisionRequest::new("si-1", "shop", "standard")).await;
    assert_eq!(retried.state, OperationState::Succeeded);
    assert!(platform.application("si-1", "api").is_some());
}

#[tokio::test]
async fn declared_environment_passes_through_untouched() {
    let platform = platform();
    let broker = broker(&platform);

    create(
        &broker,
        ProvisionRequest::new("si-1", "shop", "standard").with_parameter("LOG_LEVEL", json!("debug")),
    )
    .await;

    let api = platform.application("si-1", "api").unwrap();
    assert_eq!(api.environment.len(), 1);
    assert_eq!(api.environment.get("LOG_LEVEL").map(String::as_str), Some("info"));
}

#[tokio::test]
async fn targets_resolve_the_same_on_every_broker() {
    let first = platform();
    let second = platform();

    create(&broker(&first), ProvisionRequest::new("si-1", "shop", "shared")).await;
    create(&broker(&second), ProvisionRequest::new("si-1", "shop", "shared")).await;

    assert_eq!(first.calls(), second.calls());
    assert!(first.application("appbroker", "web-si-1").is_some());
    assert!(first.application("appbroker", "web").is_none());
}

#[tokio::test]
async fn bindings_and_management_act_on_the_instance() {
    let platform = platform();
    let broker = broker(&platform);
    create(&broker, ProvisionRequest::new("si-1", "shop", "standard")).await;

    let request = BindRequest {
        instance_id: ServiceInstanceId::new("si-1"),
        binding_id: BindingId::new("b-1"),
        service_name: "shop".into(),
        plan_name: "standard".into(),
        parameters: Default::default(),
    };
    let credentials = broker.bindings.bind(&request).await.unwrap();
    assert!(credentials.contains_key("SECURITY_USER_PASSWORD"));

    let id = ServiceInstanceId::new("si-1");
    let stopped = broker.management.stop(&id).await.unwrap();
    assert_eq!(stopped.len(), 2);
    assert!(broker
        .management
        .status(&id)
        .await
        .unwrap()
        .iter()
        .all(|status| status.is_stopped()));

    broker.management.start(&id).await.unwrap();
    assert!(broker
        .management
        .status(&id)
        .await
        .unwrap()
        .iter()
        .all(|status| status.is_healthy()));
}

#[tokio::test]
async fn unknown_plan_is_rejected_up_front() {
    let platform = platform();
    let broker = broker(&platform);

    let err = broker
        .service_instances
        .create(ProvisionRequest::new("si-1", "shop", "premium"))
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::UnknownService { .. }));
    assert!(platform.calls().is_empty());
}
