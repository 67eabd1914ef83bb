// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory platform.
//!
//! A complete [`PlatformDeployer`] that keeps namespaces, apps, service
//! instances and bindings in process memory. Every call is appended to a
//! call log; app instances are simulated, including the rolling replacement
//! performed when an already running app is pushed again. Faults can be
//! injected per call, and calls can be held at a gate until released.
//!
//! Used by the integration tests and by `type: in-memory` dry runs.

use crate::domain::backing::Environment;
use crate::domain::platform::{
    AppState, AppStatus, ApplicationDeployment, DeploymentId, InstanceState, InstanceStatus,
    PlatformDeployer, PlatformError, ServiceDeployment,
};
use crate::domain::service_instance::Parameters;
use crate::domain::target::DeploymentTarget;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// One recorded platform call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformCall {
    pub call: &'static str,
    /// `namespace/name`, `namespace/app->service` for bindings, or the
    /// namespace itself for namespace calls.
    pub resource: String,
    pub mutating: bool,
}

/// Running-instance count sampled at every step of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSample {
    pub build: u32,
    /// Healthy instances across old and new builds.
    pub running: u32,
    /// Healthy instances of `build`.
    pub new_build_running: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedApp {
    pub path: String,
    pub environment: Environment,
    pub routes: Vec<String>,
    pub state: AppState,
    pub requested_instances: u32,
    pub build: u32,
    /// (build, state) per instance slot.
    instances: Vec<(u32, InstanceState)>,
}

impl SimulatedApp {
    fn running(&self) -> u32 {
        self.instances
            .iter()
            .filter(|(_, s)| *s == InstanceState::Running)
            .count() as u32
    }

    fn running_of(&self, build: u32) -> u32 {
        self.instances
            .iter()
            .filter(|(b, s)| *b == build && *s == InstanceState::Running)
            .count() as u32
    }

    fn sample(&self) -> HealthSample {
        HealthSample {
            build: self.build,
            running: self.running(),
            new_build_running: self.running_of(self.build),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedService {
    pub service: String,
    pub plan: String,
    pub parameters: Parameters,
}

#[derive(Default)]
struct PlatformState {
    namespaces: BTreeSet<String>,
    apps: HashMap<Key, SimulatedApp>,
    services: HashMap<Key, SimulatedService>,
    /// (namespace, app, service)
    bindings: BTreeSet<(String, String, String)>,
    routes: BTreeSet<String>,
    health: HashMap<Key, Vec<HealthSample>>,
    calls: Vec<PlatformCall>,
    faults: HashMap<&'static str, (Option<String>, PlatformError)>,
}

pub struct InMemoryPlatform {
    state: Mutex<PlatformState>,
    gates: Mutex<HashMap<&'static str, Arc<Semaphore>>>,
    delete_routes: bool,
    step_delay: Duration,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PlatformState::default()),
            gates: Mutex::new(HashMap::new()),
            delete_routes: true,
            step_delay: Duration::ZERO,
        }
    }

    /// Pre-creates a namespace, e.g. the broker's shared one.
    pub fn with_namespace(self, name: impl Into<String>) -> Self {
        self.state.lock().namespaces.insert(name.into());
        self
    }

    pub fn with_delete_routes(mut self, delete_routes: bool) -> Self {
        self.delete_routes = delete_routes;
        self
    }

    /// Pause between rollout steps; zero only yields to the scheduler.
    pub fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state.lock().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<PlatformCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.mutating)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Index of the first call matching `call` and `resource` in the log.
    pub fn position(&self, call: &str, resource: &str) -> Option<usize> {
        self.state
            .lock()
            .calls
            .iter()
            .position(|c| c.call == call && c.resource == resource)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().namespaces.iter().cloned().collect()
    }

    pub fn application(&self, namespace: &str, name: &str) -> Option<SimulatedApp> {
        self.state.lock().apps.get(&key(namespace, name)).cloned()
    }

    pub fn service_instance(&self, namespace: &str, name: &str) -> Option<SimulatedService> {
        self.state.lock().services.get(&key(namespace, name)).cloned()
    }

    pub fn is_bound(&self, namespace: &str, app: &str, service: &str) -> bool {
        self.state
            .lock()
            .bindings
            .contains(&(namespace.to_string(), app.to_string(), service.to_string()))
    }

    pub fn routes(&self) -> Vec<String> {
        self.state.lock().routes.iter().cloned().collect()
    }

    pub fn health_history(&self, namespace: &str, name: &str) -> Vec<HealthSample> {
        self.state
            .lock()
            .health
            .get(&key(namespace, name))
            .cloned()
            .unwrap_or_default()
    }

    /// Every `call` (optionally only for `resource`) fails with `error` until
    /// [`clear_fault`](Self::clear_fault).
    pub fn inject_fault(&self, call: &'static str, resource: Option<&str>, error: PlatformError) {
        self.state
            .lock()
            .faults
            .insert(call, (resource.map(str::to_string), error));
    }

    pub fn clear_fault(&self, call: &'static str) {
        self.state.lock().faults.remove(call);
    }

    /// Holds every `call` until the returned gate is opened.
    pub fn hold(&self, call: &'static str) -> CallGate {
        let semaphore = Arc::new(Semaphore::new(0));
        self.gates.lock().insert(call, semaphore.clone());
        CallGate { semaphore }
    }

    async fn enter(&self, call: &'static str, resource: String, mutating: bool) -> Result<(), PlatformError> {
        let gate = self.gates.lock().get(call).cloned();
        if let Some(gate) = gate {
            // A closed gate is an open door.
            let _ = gate.acquire().await;
        }

        let mut state = self.state.lock();
        debug!(call, resource = %resource, "In-memory platform call");
        if let Some((only, error)) = state.faults.get(call) {
            if only.as_deref().is_none_or(|r| r == resource) {
                let error = error.clone();
                state.calls.push(PlatformCall { call, resource, mutating });
                return Err(error);
            }
        }
        state.calls.push(PlatformCall { call, resource, mutating });
        Ok(())
    }

    async fn pause(&self) {
        if self.step_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.step_delay).await;
        }
    }

    fn require_namespace(state: &PlatformState, namespace: &str) -> Result<(), PlatformError> {
        if state.namespaces.contains(namespace) {
            Ok(())
        } else {
            Err(PlatformError::NotFound(format!("namespace {}", namespace)))
        }
    }

    fn record_sample(state: &mut PlatformState, app_key: &Key) {
        if let Some(app) = state.apps.get(app_key) {
            let sample = app.sample();
            state.health.entry(app_key.clone()).or_default().push(sample);
        }
    }

    /// Replaces every instance with one of a new build, one at a time: a new
    /// instance is running before an old one is stopped.
    async fn roll(&self, app_key: &Key, update: Option<&ApplicationDeployment>) -> Result<(), PlatformError> {
        let (build, target_count) = {
            let mut state = self.state.lock();
            let app = state
                .apps
                .get_mut(app_key)
                .ok_or_else(|| PlatformError::NotFound(format!("app {}/{}", app_key.0, app_key.1)))?;
            if let Some(update) = update {
                app.path = update.path.clone();
                app.environment = update.environment.clone();
                app.requested_instances = update.properties.instance_count();
            }
            app.build += 1;
            app.state = AppState::Started;
            (app.build, app.requested_instances)
        };

        for _ in 0..target_count {
            self.pause().await;
            {
                let mut state = self.state.lock();
                if let Some(app) = state.apps.get_mut(app_key) {
                    app.instances.push((build, InstanceState::Running));
                }
                Self::record_sample(&mut state, app_key);
            }

            self.pause().await;
            {
                let mut state = self.state.lock();
                if let Some(app) = state.apps.get_mut(app_key) {
                    if let Some(pos) = app.instances.iter().position(|(b, _)| *b != build) {
                        app.instances.remove(pos);
                    }
                }
                Self::record_sample(&mut state, app_key);
            }
        }

        // Leftover old instances when scaling down.
        let mut state = self.state.lock();
        if let Some(app) = state.apps.get_mut(app_key) {
            app.instances.retain(|(b, _)| *b == build);
        }
        Self::record_sample(&mut state, app_key);
        Ok(())
    }
}

/// Releases calls held by [`InMemoryPlatform::hold`].
pub struct CallGate {
    semaphore: Arc<Semaphore>,
}

impl CallGate {
    pub fn open(&self) {
        self.semaphore.close();
    }
}

impl Drop for CallGate {
    fn drop(&mut self) {
        self.semaphore.close();
    }
}

#[async_trait]
impl PlatformDeployer for InMemoryPlatform {
    async fn push_application(
        &self,
        target: &DeploymentTarget,
        app: &ApplicationDeployment,
    ) -> Result<DeploymentId, PlatformError> {
        let app_key = key(&target.namespace, &app.name);
        self.enter("push_application", format!("{}/{}", target.namespace, app.name), true)
            .await?;

        let rolling = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            Self::require_namespace(state, &target.namespace)?;
            for route in app.properties.all_routes() {
                state.routes.insert(route);
            }
            match state.apps.get_mut(&app_key) {
                Some(existing) if existing.state == AppState::Started && existing.running() > 0 => true,
                Some(existing) => {
                    // Stopped app: replace in place, nothing to keep serving.
                    existing.path = app.path.clone();
                    existing.environment = app.environment.clone();
                    existing.routes = app.properties.all_routes();
                    existing.requested_instances = app.properties.instance_count();
                    existing.build += 1;
                    existing.instances.clear();
                    if app.properties.should_start() {
                        let build = existing.build;
                        existing.state = AppState::Started;
                        existing.instances = (0..existing.requested_instances)
                            .map(|_| (build, InstanceState::Running))
                            .collect();
                    }
                    false
                }
                None => {
                    let started = app.properties.should_start();
                    let count = app.properties.instance_count();
                    state.apps.insert(
                        app_key.clone(),
                        SimulatedApp {
                            path: app.path.clone(),
                            environment: app.environment.clone(),
                            routes: app.properties.all_routes(),
                            state: if started { AppState::Started } else { AppState::Stopped },
                            requested_instances: count,
                            build: 1,
                            instances: if started {
                                (0..count).map(|_| (1, InstanceState::Running)).collect()
                            } else {
                                Vec::new()
                            },
                        },
                    );
                    false
                }
            }
        };

        if rolling {
            self.roll(&app_key, Some(app)).await?;
            if let Some(existing) = self.state.lock().apps.get_mut(&app_key) {
                existing.routes = app.properties.all_routes();
            }
        } else {
            Self::record_sample(&mut self.state.lock(), &app_key);
        }

        Ok(DeploymentId::new(&target.namespace, &app.name))
    }

    async fn application_exists(&self, target: &DeploymentTarget, name: &str) -> Result<bool, PlatformError> {
        self.enter("get_application", format!("{}/{}", target.namespace, name), false)
            .await?;
        Ok(self.state.lock().apps.contains_key(&key(&target.namespace, name)))
    }

    async fn delete_application(&self, target: &DeploymentTarget, name: &str) -> Result<(), PlatformError> {
        self.enter("delete_application", format!("{}/{}", target.namespace, name), true)
            .await?;
        let mut state = self.state.lock();
        let app = state
            .apps
            .remove(&key(&target.namespace, name))
            .ok_or_else(|| PlatformError::NotFound(format!("app {}/{}", target.namespace, name)))?;
        state
            .bindings
            .retain(|(ns, a, _)| !(ns == &target.namespace && a == name));
        if self.delete_routes {
            for route in &app.routes {
                state.routes.remove(route);
            }
        }
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, PlatformError> {
        self.enter("get_namespace", name.to_string(), false).await?;
        Ok(self.state.lock().namespaces.contains(name))
    }

    async fn create_namespace(&self, name: &str) -> Result<(), PlatformError> {
        self.enter("create_namespace", name.to_string(), true).await?;
        self.state.lock().namespaces.insert(name.to_string());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), PlatformError> {
        self.enter("delete_namespace", name.to_string(), true).await?;
        let mut state = self.state.lock();
        let occupied = state.apps.keys().any(|(ns, _)| ns == name)
            || state.services.keys().any(|(ns, _)| ns == name);
        if occupied {
            return Err(PlatformError::Conflict(format!("namespace {} is not empty", name)));
        }
        state.namespaces.remove(name);
        Ok(())
    }

    async fn namespace_is_empty(&self, name: &str) -> Result<bool, PlatformError> {
        self.enter("list_namespace", name.to_string(), false).await?;
        let state = self.state.lock();
        Ok(!state.apps.keys().any(|(ns, _)| ns == name)
            && !state.services.keys().any(|(ns, _)| ns == name))
    }

    async fn service_instance_exists(&self, target: &DeploymentTarget, name: &str) -> Result<bool, PlatformError> {
        self.enter("get_service_instance", format!("{}/{}", target.namespace, name), false)
            .await?;
        Ok(self.state.lock().services.contains_key(&key(&target.namespace, name)))
    }

    async fn create_service_instance(
        &self,
        target: &DeploymentTarget,
        service: &ServiceDeployment,
    ) -> Result<(), PlatformError> {
        self.enter(
            "create_service_instance",
            format!("{}/{}", target.namespace, service.name),
            true,
        )
        .await?;
        let mut state = self.state.lock();
        Self::require_namespace(&state, &target.namespace)?;
        let service_key = key(&target.namespace, &service.name);
        if state.services.contains_key(&service_key) {
            return Err(PlatformError::AlreadyExists(format!(
                "service instance {}/{}",
                target.namespace, service.name
            )));
        }
        state.services.insert(
            service_key,
            SimulatedService {
                service: service.service.clone(),
                plan: service.plan.clone(),
                parameters: service.parameters.clone(),
            },
        );
        Ok(())
    }

    async fn update_service_instance(
        &self,
        target: &DeploymentTarget,
        service: &ServiceDeployment,
    ) -> Result<(), PlatformError> {
        self.enter(
            "update_service_instance",
            format!("{}/{}", target.namespace, service.name),
            true,
        )
        .await?;
        let mut state = self.state.lock();
        let existing = state
            .services
            .get_mut(&key(&target.namespace, &service.name))
            .ok_or_else(|| {
                PlatformError::NotFound(format!("service instance {}/{}", target.namespace, service.name))
            })?;
        if existing.service != service.service {
            return Err(PlatformError::Rejected(format!(
                "cannot change offering of {} from {} to {}",
                service.name, existing.service, service.service
            )));
        }
        existing.plan = service.plan.clone();
        existing.parameters = service.parameters.clone();
        Ok(())
    }

    async fn delete_service_instance(&self, target: &DeploymentTarget, name: &str) -> Result<(), PlatformError> {
        let bound: Vec<String> = {
            let state = self.state.lock();
            state
                .bindings
                .iter()
                .filter(|(ns, _, s)| ns == &target.namespace && s == name)
                .map(|(_, app, _)| app.clone())
                .collect()
        };
        for app in bound {
            self.unbind_service(target, &app, name).await?;
        }

        self.enter("delete_service_instance", format!("{}/{}", target.namespace, name), true)
            .await?;
        self.state
            .lock()
            .services
            .remove(&key(&target.namespace, name))
            .map(|_| ())
            .ok_or_else(|| PlatformError::NotFound(format!("service instance {}/{}", target.namespace, name)))
    }

    async fn bound_applications(&self, target: &DeploymentTarget, service: &str) -> Result<Vec<String>, PlatformError> {
        self.enter("list_bindings", format!("{}/{}", target.namespace, service), false)
            .await?;
        let state = self.state.lock();
        Ok(state
            .bindings
            .iter()
            .filter(|(ns, _, s)| ns == &target.namespace && s == service)
            .map(|(_, app, _)| app.clone())
            .collect())
    }

    async fn bind_service(&self, target: &DeploymentTarget, app: &str, service: &str) -> Result<(), PlatformError> {
        self.enter("bind_service", format!("{}/{}->{}", target.namespace, app, service), true)
            .await?;
        let mut state = self.state.lock();
        if !state.apps.contains_key(&key(&target.namespace, app)) {
            return Err(PlatformError::NotFound(format!("app {}/{}", target.namespace, app)));
        }
        if !state.services.contains_key(&key(&target.namespace, service)) {
            return Err(PlatformError::NotFound(format!(
                "service instance {}/{}",
                target.namespace, service
            )));
        }
        let binding = (target.namespace.clone(), app.to_string(), service.to_string());
        if !state.bindings.insert(binding) {
            return Err(PlatformError::AlreadyExists(format!("binding {}->{}", app, service)));
        }
        Ok(())
    }

    async fn unbind_service(&self, target: &DeploymentTarget, app: &str, service: &str) -> Result<(), PlatformError> {
        self.enter("unbind_service", format!("{}/{}->{}", target.namespace, app, service), true)
            .await?;
        let removed = self.state.lock().bindings.remove(&(
            target.namespace.clone(),
            app.to_string(),
            service.to_string(),
        ));
        if removed {
            Ok(())
        } else {
            Err(PlatformError::NotFound(format!("binding {}->{}", app, service)))
        }
    }

    async fn get_status(&self, deployment: &DeploymentId) -> Result<AppStatus, PlatformError> {
        self.enter("get_status", deployment.to_string(), false).await?;
        let state = self.state.lock();
        let app = state
            .apps
            .get(&key(&deployment.namespace, &deployment.name))
            .ok_or_else(|| PlatformError::NotFound(format!("app {}", deployment)))?;
        Ok(AppStatus {
            deployment: deployment.clone(),
            state: app.state,
            requested_instances: app.requested_instances,
            instances: app
                .instances
                .iter()
                .enumerate()
                .map(|(index, (_, state))| InstanceStatus {
                    index: index as u32,
                    state: *state,
                })
                .collect(),
        })
    }

    async fn start_application(&self, deployment: &DeploymentId) -> Result<(), PlatformError> {
        self.enter("start_application", deployment.to_string(), true).await?;
        let mut state = self.state.lock();
        let app_key = key(&deployment.namespace, &deployment.name);
        let app = state
            .apps
            .get_mut(&app_key)
            .ok_or_else(|| PlatformError::NotFound(format!("app {}", deployment)))?;
        app.state = AppState::Started;
        let build = app.build;
        while (app.instances.len() as u32) < app.requested_instances {
            app.instances.push((build, InstanceState::Running));
        }
        Self::record_sample(&mut state, &app_key);
        Ok(())
    }

    async fn stop_application(&self, deployment: &DeploymentId) -> Result<(), PlatformError> {
        self.enter("stop_application", deployment.to_string(), true).await?;
        let mut state = self.state.lock();
        let app_key = key(&deployment.namespace, &deployment.name);
        let app = state
            .apps
            .get_mut(&app_key)
            .ok_or_else(|| PlatformError::NotFound(format!("app {}", deployment)))?;
        app.state = AppState::Stopped;
        app.instances.clear();
        Self::record_sample(&mut state, &app_key);
        Ok(())
    }

    async fn restart_application(&self, deployment: &DeploymentId) -> Result<(), PlatformError> {
        self.enter("restart_application", deployment.to_string(), true).await?;
        let mut state = self.state.lock();
        let app_key = key(&deployment.namespace, &deployment.name);
        let app = state
            .apps
            .get_mut(&app_key)
            .ok_or_else(|| PlatformError::NotFound(format!("app {}", deployment)))?;
        app.state = AppState::Started;
        let build = app.build;
        app.instances = (0..app.requested_instances)
            .map(|_| (build, InstanceState::Running))
            .collect();
        Self::record_sample(&mut state, &app_key);
        Ok(())
    }

    async fn restage_application(&self, deployment: &DeploymentId) -> Result<(), PlatformError> {
        self.enter("restage_application", deployment.to_string(), true).await?;
        let app_key = key(&deployment.namespace, &deployment.name);
        self.roll(&app_key, None).await
    }
}

/// Environments of every app, keyed by `namespace/name`. Handy in tests.
pub fn environments(platform: &InMemoryPlatform) -> BTreeMap<String, Environment> {
    platform
        .state
        .lock()
        .apps
        .iter()
        .map(|((ns, name), app)| (format!("{}/{}", ns, name), app.environment.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backing::DeploymentProperties;

    fn target(ns: &str) -> DeploymentTarget {
        DeploymentTarget::shared(ns)
    }

    fn web(instances: u32, version: &str) -> ApplicationDeployment {
        ApplicationDeployment {
            name: "web".into(),
            path: format!("docker://example/web:{}", version),
            environment: Environment::from([("VERSION".to_string(), version.to_string())]),
            properties: DeploymentProperties {
                instances: Some(instances),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn push_requires_namespace() {
        let platform = InMemoryPlatform::new();
        let err = platform.push_application(&target("nope"), &web(1, "1")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn second_push_rolls_without_dropping_to_zero() {
        let platform = InMemoryPlatform::new().with_namespace("ns");
        let id = platform.push_application(&target("ns"), &web(3, "1")).await.unwrap();
        platform.push_application(&target("ns"), &web(3, "2")).await.unwrap();

        let history = platform.health_history("ns", "web");
        let rollout: Vec<_> = history.iter().filter(|s| s.build == 2).collect();
        assert!(!rollout.is_empty());
        for sample in &rollout {
            assert!(sample.running >= 3, "healthy count dipped: {:?}", sample);
        }
        assert_eq!(rollout.last().unwrap().new_build_running, 3);

        let status = platform.get_status(&id).await.unwrap();
        assert!(status.is_healthy());
        assert_eq!(platform.application("ns", "web").unwrap().environment["VERSION"], "2");
    }

    #[tokio::test]
    async fn delete_service_unbinds_first() {
        let platform = InMemoryPlatform::new().with_namespace("ns");
        platform.push_application(&target("ns"), &web(1, "1")).await.unwrap();
        let db = ServiceDeployment {
            name: "db".into(),
            service: "postgres".into(),
            plan: "standard".into(),
            parameters: Parameters::new(),
        };
        platform.create_service_instance(&target("ns"), &db).await.unwrap();
        platform.bind_service(&target("ns"), "web", "db").await.unwrap();

        platform.delete_service_instance(&target("ns"), "db").await.unwrap();

        let unbind = platform.position("unbind_service", "ns/web->db").unwrap();
        let delete = platform.position("delete_service_instance", "ns/db").unwrap();
        assert!(unbind < delete);
        assert!(!platform.is_bound("ns", "web", "db"));
    }

    #[tokio::test]
    async fn namespace_calls_are_idempotent() {
        let platform = InMemoryPlatform::new();
        platform.create_namespace("si-1").await.unwrap();
        platform.create_namespace("si-1").await.unwrap();
        platform.delete_namespace("si-1").await.unwrap();
        platform.delete_namespace("si-1").await.unwrap();
        assert!(platform.namespaces().is_empty());
    }

    #[tokio::test]
    async fn injected_faults_are_reported() {
        let platform = InMemoryPlatform::new().with_namespace("ns");
        platform.inject_fault("push_application", Some("ns/web"), PlatformError::Staging("boom".into()));
        let err = platform.push_application(&target("ns"), &web(1, "1")).await.unwrap_err();
        assert_eq!(err, PlatformError::Staging("boom".into()));

        platform.clear_fault("push_application");
        assert!(platform.push_application(&target("ns"), &web(1, "1")).await.is_ok());
    }

    #[tokio::test]
    async fn stop_and_start() {
        let platform = InMemoryPlatform::new().with_namespace("ns");
        let id = platform.push_application(&target("ns"), &web(2, "1")).await.unwrap();
        platform.stop_application(&id).await.unwrap();
        assert!(platform.get_status(&id).await.unwrap().is_stopped());
        platform.start_application(&id).await.unwrap();
        assert_eq!(platform.get_status(&id).await.unwrap().running_count(), 2);
    }
}
