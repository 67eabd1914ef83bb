// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cloud Foundry implementation of [`PlatformDeployer`].
//!
//! Namespaces map to spaces inside one organization. Every call resolves
//! the guids it needs from names, so the deployer keeps no state between
//! calls and can serve concurrent operations.
//!
//! Pushing an app that is already running stages the new package and then
//! hands the droplet to a rolling deployment, which replaces instances one
//! at a time. A first push sets the droplet and starts the app directly.

use crate::domain::backing::{DeploymentProperties, Environment, HealthCheckType};
use crate::domain::platform::{
    AppState, AppStatus, ApplicationDeployment, DeploymentId, InstanceState, InstanceStatus, PlatformDeployer,
    PlatformError, ServiceDeployment,
};
use crate::domain::target::DeploymentTarget;
use crate::infrastructure::cloud_foundry::client::CloudFoundryClient;
use crate::infrastructure::cloud_foundry::models::{
    App, Build, Deployment, Domain, EnvironmentVariables, Organization, Package, Paginated, Process, ProcessStats,
    Relationship, Route, ServiceCredentialBinding, ServiceInstance, ServicePlan, Space,
};
use crate::infrastructure::platform::poller::{PollOutcome, StatusPoller};
use async_trait::async_trait;
use metrics::counter;
use serde_json::{json, Map, Value};
use std::future::Future;
use tracing::{debug, info, warn};

const DOCKER_SCHEME: &str = "docker://";

pub struct CloudFoundryDeployer {
    client: CloudFoundryClient,
    organization: String,
    poller: StatusPoller,
    delete_routes: bool,
}

impl CloudFoundryDeployer {
    pub fn new(client: CloudFoundryClient, organization: impl Into<String>, poller: StatusPoller) -> Self {
        Self {
            client,
            organization: organization.into(),
            poller,
            delete_routes: true,
        }
    }

    pub fn with_delete_routes(mut self, delete_routes: bool) -> Self {
        self.delete_routes = delete_routes;
        self
    }

    async fn observe<T>(
        &self,
        call: &'static str,
        fut: impl Future<Output = Result<T, PlatformError>>,
    ) -> Result<T, PlatformError> {
        let result = fut.await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        counter!("appbroker_platform_calls_total", "call" => call, "outcome" => outcome).increment(1);
        result
    }

    // ---- lookups ----

    async fn org_guid(&self) -> Result<String, PlatformError> {
        let org: Option<Organization> = self
            .client
            .first("/v3/organizations", &[("names", self.organization.as_str())])
            .await?;
        org.map(|o| o.guid)
            .ok_or_else(|| PlatformError::NotFound(format!("organization {}", self.organization)))
    }

    async fn find_space(&self, name: &str) -> Result<Option<Space>, PlatformError> {
        let org_guid = self.org_guid().await?;
        self.client
            .first("/v3/spaces", &[("names", name), ("organization_guids", org_guid.as_str())])
            .await
    }

    async fn space_guid(&self, name: &str) -> Result<String, PlatformError> {
        self.find_space(name)
            .await?
            .map(|s| s.guid)
            .ok_or_else(|| PlatformError::NotFound(format!("space {}", name)))
    }

    async fn find_app(&self, space_guid: &str, name: &str) -> Result<Option<App>, PlatformError> {
        self.client
            .first("/v3/apps", &[("names", name), ("space_guids", space_guid)])
            .await
    }

    async fn app_for(&self, deployment: &DeploymentId) -> Result<App, PlatformError> {
        let space_guid = self.space_guid(&deployment.namespace).await?;
        self.find_app(&space_guid, &deployment.name)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("application {}", deployment)))
    }

    async fn find_service_instance(&self, space_guid: &str, name: &str) -> Result<Option<ServiceInstance>, PlatformError> {
        self.client
            .first("/v3/service_instances", &[("names", name), ("space_guids", space_guid)])
            .await
    }

    async fn service_instance_for(&self, target: &DeploymentTarget, name: &str) -> Result<ServiceInstance, PlatformError> {
        let space_guid = self.space_guid(&target.namespace).await?;
        self.find_service_instance(&space_guid, name)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("service instance {}/{}", target.namespace, name)))
    }

    async fn plan_guid(&self, service: &str, plan: &str) -> Result<String, PlatformError> {
        let found: Option<ServicePlan> = self
            .client
            .first("/v3/service_plans", &[("names", plan), ("service_offering_names", service)])
            .await?;
        found
            .map(|p| p.guid)
            .ok_or_else(|| PlatformError::Rejected(format!("plan {} of service {} is not in the marketplace", plan, service)))
    }

    async fn web_process(&self, app_guid: &str) -> Result<Process, PlatformError> {
        self.client
            .get(&format!("/v3/apps/{}/processes/web", app_guid), &[])
            .await
    }

    // ---- push steps ----

    async fn create_app(&self, space_guid: &str, app: &ApplicationDeployment) -> Result<App, PlatformError> {
        let lifecycle = if app.path.starts_with(DOCKER_SCHEME) {
            json!({ "type": "docker", "data": {} })
        } else {
            json!({ "type": "buildpack", "data": { "buildpacks": app.properties.buildpacks } })
        };
        let body = json!({
            "name": app.name,
            "lifecycle": lifecycle,
            "relationships": { "space": Relationship::to(space_guid) },
        });
        info!(app = %app.name, "Creating application");
        self.client.post("/v3/apps", &body).await
    }

    /// Replaces the user-provided environment; keys no longer present are
    /// removed.
    async fn set_environment(&self, app_guid: &str, environment: &Environment) -> Result<(), PlatformError> {
        let path = format!("/v3/apps/{}/environment_variables", app_guid);
        let current: EnvironmentVariables = self.client.get(&path, &[]).await?;

        let mut var = Map::new();
        for key in current.var.keys() {
            if !environment.contains_key(key) {
                var.insert(key.clone(), Value::Null);
            }
        }
        for (key, value) in environment {
            var.insert(key.clone(), Value::String(value.clone()));
        }
        let _: EnvironmentVariables = self.client.patch(&path, &json!({ "var": var })).await?;
        Ok(())
    }

    async fn create_package(&self, app_guid: &str, artifact: &str) -> Result<Package, PlatformError> {
        if let Some(image) = artifact.strip_prefix(DOCKER_SCHEME) {
            let body = json!({
                "type": "docker",
                "data": { "image": image },
                "relationships": { "app": Relationship::to(app_guid) },
            });
            return self.client.post("/v3/packages", &body).await;
        }

        let body = json!({
            "type": "bits",
            "relationships": { "app": Relationship::to(app_guid) },
        });
        let package: Package = self.client.post("/v3/packages", &body).await?;
        let bits = self.read_artifact(artifact).await?;
        self.client
            .upload(&format!("/v3/packages/{}/upload", package.guid), bits)
            .await
    }

    async fn read_artifact(&self, artifact: &str) -> Result<Vec<u8>, PlatformError> {
        if artifact.starts_with("http://") || artifact.starts_with("https://") {
            return self.client.download(artifact).await;
        }
        let path = artifact.strip_prefix("file://").unwrap_or(artifact);
        tokio::fs::read(path)
            .await
            .map_err(|e| PlatformError::Rejected(format!("cannot read artifact {}: {}", path, e)))
    }

    async fn wait_for_package(&self, package_guid: &str) -> Result<(), PlatformError> {
        let path = format!("/v3/packages/{}", package_guid);
        let path = path.as_str();
        self.poller
            .poll("package", move || async move {
                let package: Package = self.client.get(path, &[]).await?;
                match package.state.as_str() {
                    "READY" => Ok(PollOutcome::Ready(())),
                    "FAILED" | "EXPIRED" => Err(PlatformError::Staging(format!(
                        "package {} is {}",
                        package.guid, package.state
                    ))),
                    other => Ok(PollOutcome::Pending(other.to_string())),
                }
            })
            .await
    }

    /// Builds a package and returns the droplet guid.
    async fn stage(&self, package_guid: &str) -> Result<String, PlatformError> {
        let build: Build = self
            .client
            .post("/v3/builds", &json!({ "package": { "guid": package_guid } }))
            .await?;
        let path = format!("/v3/builds/{}", build.guid);
        let path = path.as_str();
        self.poller
            .poll("build", move || async move {
                let build: Build = self.client.get(path, &[]).await?;
                match build.state.as_str() {
                    "STAGED" => build
                        .droplet
                        .map(|d| PollOutcome::Ready(d.guid))
                        .ok_or_else(|| PlatformError::Staging(format!("build {} produced no droplet", build.guid))),
                    "FAILED" => Err(PlatformError::Staging(
                        build.error.unwrap_or_else(|| format!("build {} failed", build.guid)),
                    )),
                    other => Ok(PollOutcome::Pending(other.to_string())),
                }
            })
            .await
    }

    /// Instance count, memory and disk as the CF API names them.
    fn scale_of(properties: &DeploymentProperties, instances_key: &str) -> Map<String, Value> {
        let mut scale = Map::new();
        scale.insert(instances_key.into(), json!(properties.instance_count()));
        if let Some(memory) = properties.memory_mb {
            scale.insert("memory_in_mb".into(), json!(memory));
        }
        if let Some(disk) = properties.disk_mb {
            scale.insert("disk_in_mb".into(), json!(disk));
        }
        scale
    }

    async fn scale_process(&self, app_guid: &str, properties: &DeploymentProperties) -> Result<(), PlatformError> {
        let _: Process = self
            .client
            .post(
                &format!("/v3/apps/{}/processes/web/actions/scale", app_guid),
                &Value::Object(Self::scale_of(properties, "instances")),
            )
            .await?;
        Ok(())
    }

    /// A new health check only applies to instances started after it is set.
    async fn configure_health_check(&self, app_guid: &str, properties: &DeploymentProperties) -> Result<(), PlatformError> {
        let Some(check) = properties.health_check_type else {
            return Ok(());
        };
        let check_type = match check {
            HealthCheckType::Port => "port",
            HealthCheckType::Process => "process",
            HealthCheckType::Http => "http",
        };
        let mut health_check = json!({ "type": check_type, "data": {} });
        if let Some(endpoint) = &properties.health_check_endpoint {
            health_check["data"]["endpoint"] = json!(endpoint);
        }
        let process = self.web_process(app_guid).await?;
        let _: Process = self
            .client
            .patch(&format!("/v3/processes/{}", process.guid), &json!({ "health_check": health_check }))
            .await?;
        Ok(())
    }

    /// Replaces running instances with the new droplet one batch at a time.
    /// A new scale, if any, only applies to the replacement instances.
    async fn rolling_deploy(
        &self,
        app_guid: &str,
        droplet_guid: &str,
        scale: Option<&DeploymentProperties>,
    ) -> Result<(), PlatformError> {
        let mut body = json!({
            "droplet": { "guid": droplet_guid },
            "strategy": "rolling",
            "relationships": { "app": Relationship::to(app_guid) },
        });
        if let Some(properties) = scale {
            body["options"] = Value::Object(Self::scale_of(properties, "web_instances"));
        }
        let deployment: Deployment = self.client.post("/v3/deployments", &body).await?;
        info!(app_guid, deployment = %deployment.guid, "Rolling deployment started");

        let path = format!("/v3/deployments/{}", deployment.guid);
        let path = path.as_str();
        self.poller
            .poll("deployment", move || async move {
                let deployment: Deployment = self.client.get(path, &[]).await?;
                let reason = deployment.status.reason.unwrap_or_default();
                match deployment.status.value.as_str() {
                    "FINALIZED" if reason == "DEPLOYED" => Ok(PollOutcome::Ready(())),
                    "FINALIZED" => Err(PlatformError::Rejected(format!(
                        "deployment {} finished as {}",
                        deployment.guid, reason
                    ))),
                    value => Ok(PollOutcome::Pending(format!("{} {}", value, reason))),
                }
            })
            .await
    }

    async fn set_droplet_and_start(&self, app_guid: &str, droplet_guid: &str, start: bool) -> Result<(), PlatformError> {
        let _: Relationship = self
            .client
            .patch(
                &format!("/v3/apps/{}/relationships/current_droplet", app_guid),
                &json!({ "data": { "guid": droplet_guid } }),
            )
            .await?;
        if start {
            let _: App = self
                .client
                .post(&format!("/v3/apps/{}/actions/start", app_guid), &json!({}))
                .await?;
        }
        Ok(())
    }

    /// Splits `host.domain[/path]` against the domains visible to the org.
    async fn map_routes(&self, space_guid: &str, app_guid: &str, routes: &[String]) -> Result<(), PlatformError> {
        if routes.is_empty() {
            return Ok(());
        }
        let domains: Vec<Domain> = self.client.list("/v3/domains", &[]).await?;

        for route in routes {
            let (host_and_domain, path) = match route.find('/') {
                Some(i) => (&route[..i], &route[i..]),
                None => (route.as_str(), ""),
            };
            let domain = domains
                .iter()
                .filter(|d| host_and_domain == d.name || host_and_domain.ends_with(&format!(".{}", d.name)))
                .max_by_key(|d| d.name.len())
                .ok_or_else(|| PlatformError::Rejected(format!("no domain matches route {}", route)))?;
            let host = host_and_domain
                .strip_suffix(&domain.name)
                .map(|h| h.trim_end_matches('.'))
                .unwrap_or_default();

            let existing: Option<Route> = self
                .client
                .first(
                    "/v3/routes",
                    &[
                        ("space_guids", space_guid),
                        ("domain_guids", domain.guid.as_str()),
                        ("hosts", host),
                        ("paths", path),
                    ],
                )
                .await?;
            let route_guid = match existing {
                Some(r) => r.guid,
                None => {
                    let body = json!({
                        "host": host,
                        "path": path,
                        "relationships": {
                            "space": Relationship::to(space_guid),
                            "domain": Relationship::to(&domain.guid),
                        },
                    });
                    let created: Route = self.client.post("/v3/routes", &body).await?;
                    created.guid
                }
            };
            let _: Value = self
                .client
                .post(
                    &format!("/v3/routes/{}/destinations", route_guid),
                    &json!({ "destinations": [{ "app": { "guid": app_guid } }] }),
                )
                .await?;
            debug!(route = %route, "Route mapped");
        }
        Ok(())
    }

    async fn status_of(&self, deployment: &DeploymentId, app: &App) -> Result<AppStatus, PlatformError> {
        let process = self.web_process(&app.guid).await?;
        let stats: ProcessStats = self
            .client
            .get(&format!("/v3/processes/{}/stats", process.guid), &[])
            .await?;
        let instances = stats
            .resources
            .into_iter()
            .map(|s| InstanceStatus {
                index: s.index,
                state: match s.state.as_str() {
                    "RUNNING" => InstanceState::Running,
                    "STARTING" => InstanceState::Starting,
                    "CRASHED" => InstanceState::Crashed,
                    _ => InstanceState::Down,
                },
            })
            .collect();
        Ok(AppStatus {
            deployment: deployment.clone(),
            state: if app.state == "STARTED" { AppState::Started } else { AppState::Stopped },
            requested_instances: process.instances,
            instances,
        })
    }

    async fn wait_until_healthy(&self, deployment: &DeploymentId) -> Result<(), PlatformError> {
        let what = deployment.to_string();
        self.poller
            .poll(&what, move || async move {
                let app = self.app_for(deployment).await?;
                let status = self.status_of(deployment, &app).await?;
                if status.is_healthy() {
                    Ok(PollOutcome::Ready(()))
                } else {
                    Ok(PollOutcome::Pending(format!(
                        "{}/{} instances running",
                        status.running_count(),
                        status.requested_instances
                    )))
                }
            })
            .await
    }

    async fn app_action(&self, deployment: &DeploymentId, action: &str) -> Result<(), PlatformError> {
        let app = self.app_for(deployment).await?;
        info!(app = %deployment, action, "Application action");
        let _: App = self
            .client
            .post(&format!("/v3/apps/{}/actions/{}", app.guid, action), &json!({}))
            .await?;
        Ok(())
    }

    async fn push(&self, target: &DeploymentTarget, app: &ApplicationDeployment) -> Result<DeploymentId, PlatformError> {
        let space_guid = self.space_guid(&target.namespace).await?;
        let id = DeploymentId::new(&target.namespace, &app.name);

        let (existing, running) = match self.find_app(&space_guid, &app.name).await? {
            Some(found) => {
                let running = found.state == "STARTED";
                (found, running)
            }
            None => (self.create_app(&space_guid, app).await?, false),
        };

        self.set_environment(&existing.guid, &app.environment).await?;
        let package = self.create_package(&existing.guid, &app.path).await?;
        self.wait_for_package(&package.guid).await?;
        let droplet = self.stage(&package.guid).await?;
        self.configure_health_check(&existing.guid, &app.properties).await?;

        if running {
            self.rolling_deploy(&existing.guid, &droplet, Some(&app.properties)).await?;
        } else {
            self.scale_process(&existing.guid, &app.properties).await?;
            self.set_droplet_and_start(&existing.guid, &droplet, app.properties.should_start())
                .await?;
        }
        self.map_routes(&space_guid, &existing.guid, &app.properties.all_routes())
            .await?;

        if app.properties.should_start() {
            self.wait_until_healthy(&id).await?;
        }
        info!(app = %id, "Application pushed");
        Ok(id)
    }

    async fn remove_app(&self, target: &DeploymentTarget, name: &str) -> Result<(), PlatformError> {
        let space_guid = self.space_guid(&target.namespace).await?;
        let app = self
            .find_app(&space_guid, name)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("application {}/{}", target.namespace, name)))?;

        let routes: Vec<Route> = if self.delete_routes {
            self.client.list(&format!("/v3/apps/{}/routes", app.guid), &[]).await?
        } else {
            Vec::new()
        };

        let job = self.client.delete(&format!("/v3/apps/{}", app.guid)).await?;
        self.client.settle(&self.poller, job).await?;

        for route in routes {
            match self.client.delete(&format!("/v3/routes/{}", route.guid)).await {
                Ok(job) => self.client.settle(&self.poller, job).await?,
                Err(PlatformError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(app = %name, namespace = %target.namespace, "Application deleted");
        Ok(())
    }

    async fn remove_service_instance(&self, target: &DeploymentTarget, name: &str) -> Result<(), PlatformError> {
        let instance = self.service_instance_for(target, name).await?;
        let bindings: Vec<ServiceCredentialBinding> = self
            .client
            .list(
                "/v3/service_credential_bindings",
                &[("service_instance_guids", instance.guid.as_str())],
            )
            .await?;
        for binding in bindings {
            let job = self
                .client
                .delete(&format!("/v3/service_credential_bindings/{}", binding.guid))
                .await?;
            self.client.settle(&self.poller, job).await?;
        }
        let job = self
            .client
            .delete(&format!("/v3/service_instances/{}", instance.guid))
            .await?;
        self.client.settle(&self.poller, job).await
    }

    async fn restage(&self, deployment: &DeploymentId) -> Result<(), PlatformError> {
        let app = self.app_for(deployment).await?;
        let package: Option<Package> = self
            .client
            .first(
                &format!("/v3/apps/{}/packages", app.guid),
                &[("order_by", "-created_at"), ("states", "READY")],
            )
            .await?;
        let package = package.ok_or_else(|| PlatformError::Rejected(format!("{} has no package to restage", deployment)))?;
        let droplet = self.stage(&package.guid).await?;
        self.rolling_deploy(&app.guid, &droplet, None).await?;
        self.wait_until_healthy(deployment).await
    }
}

#[async_trait]
impl PlatformDeployer for CloudFoundryDeployer {
    async fn push_application(
        &self,
        target: &DeploymentTarget,
        app: &ApplicationDeployment,
    ) -> Result<DeploymentId, PlatformError> {
        self.observe("push_application", self.push(target, app)).await
    }

    async fn application_exists(&self, target: &DeploymentTarget, name: &str) -> Result<bool, PlatformError> {
        self.observe("application_exists", async {
            match self.find_space(&target.namespace).await? {
                Some(space) => Ok(self.find_app(&space.guid, name).await?.is_some()),
                None => Ok(false),
            }
        })
        .await
    }

    async fn delete_application(&self, target: &DeploymentTarget, name: &str) -> Result<(), PlatformError> {
        self.observe("delete_application", self.remove_app(target, name)).await
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, PlatformError> {
        self.observe("namespace_exists", async { Ok(self.find_space(name).await?.is_some()) })
            .await
    }

    async fn create_namespace(&self, name: &str) -> Result<(), PlatformError> {
        self.observe("create_namespace", async {
            if self.find_space(name).await?.is_some() {
                return Ok(());
            }
            let org_guid = self.org_guid().await?;
            let body = json!({
                "name": name,
                "relationships": { "organization": Relationship::to(org_guid) },
            });
            match self.client.post::<_, Space>("/v3/spaces", &body).await {
                Ok(space) => {
                    info!(space = %space.name, "Space created");
                    Ok(())
                }
                Err(PlatformError::AlreadyExists(_)) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), PlatformError> {
        self.observe("delete_namespace", async {
            let Some(space) = self.find_space(name).await? else {
                return Ok(());
            };
            match self.client.delete(&format!("/v3/spaces/{}", space.guid)).await {
                Ok(job) => self.client.settle(&self.poller, job).await,
                Err(PlatformError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn namespace_is_empty(&self, name: &str) -> Result<bool, PlatformError> {
        self.observe("namespace_is_empty", async {
            let Some(space) = self.find_space(name).await? else {
                return Ok(true);
            };
            let query = [("space_guids", space.guid.as_str()), ("per_page", "1")];
            let apps: Paginated<App> = self.client.get("/v3/apps", &query).await?;
            let services: Paginated<ServiceInstance> = self.client.get("/v3/service_instances", &query).await?;
            Ok(apps.pagination.total_results == 0 && services.pagination.total_results == 0)
        })
        .await
    }

    async fn service_instance_exists(&self, target: &DeploymentTarget, name: &str) -> Result<bool, PlatformError> {
        self.observe("service_instance_exists", async {
            match self.find_space(&target.namespace).await? {
                Some(space) => Ok(self.find_service_instance(&space.guid, name).await?.is_some()),
                None => Ok(false),
            }
        })
        .await
    }

    async fn create_service_instance(
        &self,
        target: &DeploymentTarget,
        service: &ServiceDeployment,
    ) -> Result<(), PlatformError> {
        self.observe("create_service_instance", async {
            let space_guid = self.space_guid(&target.namespace).await?;
            let plan_guid = self.plan_guid(&service.service, &service.plan).await?;
            let body = json!({
                "type": "managed",
                "name": service.name,
                "parameters": service.parameters,
                "relationships": {
                    "space": Relationship::to(space_guid),
                    "service_plan": Relationship::to(plan_guid),
                },
            });
            let job = self.client.post_async("/v3/service_instances", &body).await?;
            self.client.settle(&self.poller, job).await?;
            info!(service_instance = %service.name, namespace = %target.namespace, "Service instance created");
            Ok(())
        })
        .await
    }

    async fn update_service_instance(
        &self,
        target: &DeploymentTarget,
        service: &ServiceDeployment,
    ) -> Result<(), PlatformError> {
        self.observe("update_service_instance", async {
            let instance = self.service_instance_for(target, &service.name).await?;
            let plan_guid = self.plan_guid(&service.service, &service.plan).await?;
            let body = json!({
                "parameters": service.parameters,
                "relationships": { "service_plan": Relationship::to(plan_guid) },
            });
            let job = self
                .client
                .patch_async(&format!("/v3/service_instances/{}", instance.guid), &body)
                .await?;
            self.client.settle(&self.poller, job).await
        })
        .await
    }

    async fn delete_service_instance(&self, target: &DeploymentTarget, name: &str) -> Result<(), PlatformError> {
        self.observe("delete_service_instance", self.remove_service_instance(target, name))
            .await
    }

    async fn bound_applications(&self, target: &DeploymentTarget, service: &str) -> Result<Vec<String>, PlatformError> {
        self.observe("bound_applications", async {
            let instance = self.service_instance_for(target, service).await?;
            let page: Paginated<ServiceCredentialBinding> = self
                .client
                .get(
                    "/v3/service_credential_bindings",
                    &[
                        ("service_instance_guids", instance.guid.as_str()),
                        ("type", "app"),
                        ("include", "app"),
                        ("per_page", "5000"),
                    ],
                )
                .await?;
            let mut names: Vec<String> = page
                .included
                .map(|included| included.apps.into_iter().map(|a| a.name).collect())
                .unwrap_or_default();
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn bind_service(&self, target: &DeploymentTarget, app: &str, service: &str) -> Result<(), PlatformError> {
        self.observe("bind_service", async {
            let space_guid = self.space_guid(&target.namespace).await?;
            let app_guid = self
                .find_app(&space_guid, app)
                .await?
                .ok_or_else(|| PlatformError::NotFound(format!("application {}/{}", target.namespace, app)))?
                .guid;
            let instance = self.service_instance_for(target, service).await?;
            let body = json!({
                "type": "app",
                "relationships": {
                    "app": Relationship::to(app_guid),
                    "service_instance": Relationship::to(instance.guid),
                },
            });
            match self.client.post_async("/v3/service_credential_bindings", &body).await {
                Ok(job) => self.client.settle(&self.poller, job).await,
                Err(PlatformError::AlreadyExists(_)) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn unbind_service(&self, target: &DeploymentTarget, app: &str, service: &str) -> Result<(), PlatformError> {
        self.observe("unbind_service", async {
            let space_guid = self.space_guid(&target.namespace).await?;
            let Some(app) = self.find_app(&space_guid, app).await? else {
                return Ok(());
            };
            let Some(instance) = self.find_service_instance(&space_guid, service).await? else {
                return Ok(());
            };
            let binding: Option<ServiceCredentialBinding> = self
                .client
                .first(
                    "/v3/service_credential_bindings",
                    &[
                        ("app_guids", app.guid.as_str()),
                        ("service_instance_guids", instance.guid.as_str()),
                    ],
                )
                .await?;
            let Some(binding) = binding else {
                return Ok(());
            };
            let job = self
                .client
                .delete(&format!("/v3/service_credential_bindings/{}", binding.guid))
                .await?;
            self.client.settle(&self.poller, job).await
        })
        .await
    }

    async fn get_status(&self, deployment: &DeploymentId) -> Result<AppStatus, PlatformError> {
        self.observe("get_status", async {
            let app = self.app_for(deployment).await?;
            self.status_of(deployment, &app).await
        })
        .await
    }

    async fn start_application(&self, deployment: &DeploymentId) -> Result<(), PlatformError> {
        self.observe("start_application", async {
            self.app_action(deployment, "start").await?;
            self.wait_until_healthy(deployment).await
        })
        .await
    }

    async fn stop_application(&self, deployment: &DeploymentId) -> Result<(), PlatformError> {
        self.observe("stop_application", self.app_action(deployment, "stop")).await
    }

    async fn restart_application(&self, deployment: &DeploymentId) -> Result<(), PlatformError> {
        self.observe("restart_application", async {
            self.app_action(deployment, "restart").await?;
            self.wait_until_healthy(deployment).await
        })
        .await
    }

    async fn restage_application(&self, deployment: &DeploymentId) -> Result<(), PlatformError> {
        let result = self.observe("restage_application", self.restage(deployment)).await;
        if let Err(e) = &result {
            warn!(app = %deployment, error = %e, "Restage failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::platform::PollingPolicy;
    use crate::infrastructure::cloud_foundry::client::Credentials;
    use mockito::{Matcher, Server, ServerGuard};
    use std::time::Duration;

    fn page(resources: Value) -> String {
        let total = resources.as_array().map(|a| a.len()).unwrap_or(0);
        json!({ "pagination": { "total_results": total, "next": null }, "resources": resources }).to_string()
    }

    async fn org_and_space(server: &mut ServerGuard, space: Option<&str>) {
        server
            .mock("GET", "/v3/organizations")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(page(json!([{ "guid": "org-1", "name": "broker-org" }])))
            .create_async()
            .await;
        let spaces = match space {
            Some(name) => json!([{ "guid": "space-1", "name": name }]),
            None => json!([]),
        };
        server
            .mock("GET", "/v3/spaces")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(page(spaces))
            .create_async()
            .await;
    }

    fn deployer(server: &ServerGuard) -> CloudFoundryDeployer {
        let client = CloudFoundryClient::new(server.url(), Credentials::Bearer("t".into()), Duration::from_secs(5))
            .unwrap();
        let poller = StatusPoller::new(PollingPolicy::with_timeout(Duration::from_millis(200)));
        CloudFoundryDeployer::new(client, "broker-org", poller)
    }

    #[tokio::test]
    async fn create_namespace_is_idempotent() {
        let mut server = Server::new_async().await;
        org_and_space(&mut server, Some("si-1")).await;
        let create = server.mock("POST", "/v3/spaces").expect(0).create_async().await;

        deployer(&server).create_namespace("si-1").await.unwrap();
        create.assert_async().await;
    }

    #[tokio::test]
    async fn create_namespace_posts_space_in_org() {
        let mut server = Server::new_async().await;
        org_and_space(&mut server, None).await;
        let create = server
            .mock("POST", "/v3/spaces")
            .match_body(Matcher::PartialJson(json!({
                "name": "si-1",
                "relationships": { "organization": { "data": { "guid": "org-1" } } }
            })))
            .with_status(201)
            .with_body(json!({ "guid": "space-1", "name": "si-1" }).to_string())
            .create_async()
            .await;

        deployer(&server).create_namespace("si-1").await.unwrap();
        create.assert_async().await;
    }

    #[tokio::test]
    async fn deleting_a_missing_app_is_not_found() {
        let mut server = Server::new_async().await;
        org_and_space(&mut server, Some("appbroker")).await;
        server
            .mock("GET", "/v3/apps")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(page(json!([])))
            .create_async()
            .await;

        let result = deployer(&server)
            .delete_application(&DeploymentTarget::shared("appbroker"), "web")
            .await;
        assert!(matches!(result, Err(PlatformError::NotFound(_))));
    }

    #[tokio::test]
    async fn status_reports_instances() {
        let mut server = Server::new_async().await;
        org_and_space(&mut server, Some("appbroker")).await;
        server
            .mock("GET", "/v3/apps")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(page(json!([{ "guid": "app-1", "name": "web", "state": "STARTED" }])))
            .create_async()
            .await;
        server
            .mock("GET", "/v3/apps/app-1/processes/web")
            .with_status(200)
            .with_body(json!({ "guid": "proc-1", "type": "web", "instances": 2 }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v3/processes/proc-1/stats")
            .with_status(200)
            .with_body(
                json!({ "resources": [
                    { "index": 0, "state": "RUNNING" },
                    { "index": 1, "state": "CRASHED" }
                ] })
                .to_string(),
            )
            .create_async()
            .await;

        let status = deployer(&server)
            .get_status(&DeploymentId::new("appbroker", "web"))
            .await
            .unwrap();
        assert_eq!(status.state, AppState::Started);
        assert_eq!(status.requested_instances, 2);
        assert_eq!(status.running_count(), 1);
        assert!(!status.is_healthy());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v3/organizations")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let err = deployer(&server).namespace_exists("si-1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn pushes_a_docker_image_to_a_new_app() {
        let mut server = Server::new_async().await;
        org_and_space(&mut server, Some("appbroker")).await;
        server
            .mock("GET", "/v3/apps")
            .match_query(Matcher::UrlEncoded("names".into(), "web".into()))
            .with_status(200)
            .with_body(page(json!([])))
            .expect_at_least(1)
            .create_async()
            .await;
        let create_app = server
            .mock("POST", "/v3/apps")
            .match_body(Matcher::PartialJson(json!({ "name": "web", "lifecycle": { "type": "docker" } })))
            .with_status(201)
            .with_body(json!({ "guid": "app-1", "name": "web", "state": "STOPPED" }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v3/apps/app-1/environment_variables")
            .with_status(200)
            .with_body(json!({ "var": { "STALE": "x" } }).to_string())
            .create_async()
            .await;
        let env = server
            .mock("PATCH", "/v3/apps/app-1/environment_variables")
            .match_body(Matcher::Json(json!({ "var": { "STALE": null, "LOG_LEVEL": "debug" } })))
            .with_status(200)
            .with_body(json!({ "var": { "LOG_LEVEL": "debug" } }).to_string())
            .create_async()
            .await;
        server
            .mock("POST", "/v3/packages")
            .match_body(Matcher::PartialJson(json!({ "type": "docker", "data": { "image": "nginx:1.27" } })))
            .with_status(201)
            .with_body(json!({ "guid": "pkg-1", "state": "READY" }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v3/packages/pkg-1")
            .with_status(200)
            .with_body(json!({ "guid": "pkg-1", "state": "READY" }).to_string())
            .create_async()
            .await;
        server
            .mock("POST", "/v3/builds")
            .with_status(201)
            .with_body(json!({ "guid": "build-1", "state": "STAGING" }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v3/builds/build-1")
            .with_status(200)
            .with_body(json!({ "guid": "build-1", "state": "STAGED", "droplet": { "guid": "drop-1" } }).to_string())
            .create_async()
            .await;
        server
            .mock("POST", "/v3/apps/app-1/processes/web/actions/scale")
            .with_status(202)
            .with_body(json!({ "guid": "proc-1", "type": "web", "instances": 1 }).to_string())
            .create_async()
            .await;
        let droplet = server
            .mock("PATCH", "/v3/apps/app-1/relationships/current_droplet")
            .match_body(Matcher::Json(json!({ "data": { "guid": "drop-1" } })))
            .with_status(200)
            .with_body(json!({ "data": { "guid": "drop-1" } }).to_string())
            .create_async()
            .await;
        server
            .mock("POST", "/v3/apps/app-1/actions/start")
            .with_status(200)
            .with_body(json!({ "guid": "app-1", "name": "web", "state": "STARTED" }).to_string())
            .create_async()
            .await;

        let app = ApplicationDeployment {
            name: "web".into(),
            path: "docker://nginx:1.27".into(),
            environment: Environment::from([("LOG_LEVEL".to_string(), "debug".to_string())]),
            properties: DeploymentProperties {
                start: Some(false),
                ..Default::default()
            },
        };
        let id = deployer(&server)
            .push_application(&DeploymentTarget::shared("appbroker"), &app)
            .await
            .unwrap();

        assert_eq!(id, DeploymentId::new("appbroker", "web"));
        create_app.assert_async().await;
        env.assert_async().await;
        droplet.assert_async().await;
    }

    #[tokio::test]
    async fn running_app_is_rescaled_by_the_rolling_deployment() {
        let mut server = Server::new_async().await;
        org_and_space(&mut server, Some("appbroker")).await;
        server
            .mock("GET", "/v3/apps")
            .match_query(Matcher::UrlEncoded("names".into(), "web".into()))
            .with_status(200)
            .with_body(page(json!([{ "guid": "app-1", "name": "web", "state": "STARTED" }])))
            .create_async()
            .await;
        server
            .mock("GET", "/v3/apps/app-1/environment_variables")
            .with_status(200)
            .with_body(json!({ "var": {} }).to_string())
            .create_async()
            .await;
        server
            .mock("PATCH", "/v3/apps/app-1/environment_variables")
            .with_status(200)
            .with_body(json!({ "var": {} }).to_string())
            .create_async()
            .await;
        server
            .mock("POST", "/v3/packages")
            .with_status(201)
            .with_body(json!({ "guid": "pkg-1", "state": "READY" }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v3/packages/pkg-1")
            .with_status(200)
            .with_body(json!({ "guid": "pkg-1", "state": "READY" }).to_string())
            .create_async()
            .await;
        server
            .mock("POST", "/v3/builds")
            .with_status(201)
            .with_body(json!({ "guid": "build-1", "state": "STAGING" }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v3/builds/build-1")
            .with_status(200)
            .with_body(json!({ "guid": "build-1", "state": "STAGED", "droplet": { "guid": "drop-1" } }).to_string())
            .create_async()
            .await;
        let scale = server
            .mock("POST", "/v3/apps/app-1/processes/web/actions/scale")
            .expect(0)
            .create_async()
            .await;
        let rolling = server
            .mock("POST", "/v3/deployments")
            .match_body(Matcher::PartialJson(json!({
                "droplet": { "guid": "drop-1" },
                "strategy": "rolling",
                "options": { "web_instances": 2, "memory_in_mb": 2048, "disk_in_mb": 4096 },
            })))
            .with_status(201)
            .with_body(json!({ "guid": "dep-1", "status": { "value": "ACTIVE", "reason": "DEPLOYING" } }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/v3/deployments/dep-1")
            .with_status(200)
            .with_body(json!({ "guid": "dep-1", "status": { "value": "FINALIZED", "reason": "DEPLOYED" } }).to_string())
            .create_async()
            .await;

        let app = ApplicationDeployment {
            name: "web".into(),
            path: "docker://nginx:1.28".into(),
            environment: Environment::new(),
            properties: DeploymentProperties {
                instances: Some(2),
                memory_mb: Some(2048),
                disk_mb: Some(4096),
                start: Some(false),
                ..Default::default()
            },
        };
        deployer(&server)
            .push_application(&DeploymentTarget::shared("appbroker"), &app)
            .await
            .unwrap();

        rolling.assert_async().await;
        scale.assert_async().await;
    }
}
