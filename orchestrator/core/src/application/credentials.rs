// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Credential providers: mint secrets for backing apps and service bindings,
//! and revoke them on teardown.
//!
//! A provider either injects raw values into the app environment or, with
//! `secret_reference`, stores them in the secret store, grants the app read
//! access and injects `((path/key))` references. Any collaborator failure
//! aborts the caller; credentials are never optional.

use crate::application::pipeline::PipelineError;
use crate::domain::backing::{BasicAuthSpec, CredentialProviderSpec, Environment, OAuth2ClientSpec};
use crate::domain::credentials::{
    app_secret_path, binding_secret_path, secret_reference, CredentialGenerator, IdentityClient, OAuth2Client,
    SecretData, SecretStore,
};
use crate::domain::service_instance::{BindingId, ServiceInstanceId};
use std::sync::Arc;
use tracing::{debug, info};

pub struct CredentialProviders {
    generator: Arc<dyn CredentialGenerator>,
    secret_store: Arc<dyn SecretStore>,
    identity: Arc<dyn IdentityClient>,
}

/// Client id registered for an app of a service instance.
pub fn oauth2_client_id(owner: &str, instance_id: &ServiceInstanceId) -> String {
    format!("{}-{}", owner, instance_id)
}

impl CredentialProviders {
    pub fn new(
        generator: Arc<dyn CredentialGenerator>,
        secret_store: Arc<dyn SecretStore>,
        identity: Arc<dyn IdentityClient>,
    ) -> Self {
        Self {
            generator,
            secret_store,
            identity,
        }
    }

    /// Runs every provider in order, writing into `environment`.
    pub async fn provide(
        &self,
        instance_id: &ServiceInstanceId,
        app: &str,
        providers: &[CredentialProviderSpec],
        environment: &mut Environment,
    ) -> Result<(), PipelineError> {
        for provider in providers {
            let secrets = self.mint(instance_id, app, provider).await?;
            let reference_path = match provider {
                CredentialProviderSpec::BasicAuth(BasicAuthSpec { secret_reference: true, .. })
                | CredentialProviderSpec::OAuth2Client(OAuth2ClientSpec { secret_reference: true, .. }) => {
                    Some(app_secret_path(instance_id.as_str(), app, provider.kind()))
                }
                _ => None,
            };

            match reference_path {
                Some(path) => {
                    self.secret_store
                        .store(&path, &secrets)
                        .await
                        .map_err(|source| PipelineError::Credentials { provider: provider.kind(), source })?;
                    self.secret_store
                        .grant_read(&path, app)
                        .await
                        .map_err(|source| PipelineError::Credentials { provider: provider.kind(), source })?;
                    for key in secrets.keys() {
                        environment.insert(key.clone(), secret_reference(&path, key));
                    }
                    debug!(app, provider = provider.kind(), path = %path, "Credentials stored as secret references");
                }
                None => {
                    environment.extend(secrets);
                    debug!(app, provider = provider.kind(), "Credentials injected into environment");
                }
            }
        }
        Ok(())
    }

    /// Undoes [`provide`](Self::provide). Only secrets and clients that still
    /// exist are deleted, so a repeated revoke only reads. Returns whether
    /// anything was removed.
    pub async fn revoke(
        &self,
        instance_id: &ServiceInstanceId,
        app: &str,
        providers: &[CredentialProviderSpec],
    ) -> Result<bool, PipelineError> {
        let mut revoked = false;
        for provider in providers {
            let failed = |source| PipelineError::Credentials { provider: provider.kind(), source };
            let secret_reference = match provider {
                CredentialProviderSpec::BasicAuth(spec) => spec.secret_reference,
                CredentialProviderSpec::OAuth2Client(spec) => {
                    let client_id = oauth2_client_id(app, instance_id);
                    if self.identity.client_exists(&client_id).await.map_err(failed)? {
                        self.identity.delete_client(&client_id).await.map_err(failed)?;
                        revoked = true;
                    }
                    spec.secret_reference
                }
            };
            if secret_reference {
                let path = app_secret_path(instance_id.as_str(), app, provider.kind());
                if self.secret_store.exists(&path).await.map_err(failed)? {
                    self.secret_store.delete(&path).await.map_err(failed)?;
                    revoked = true;
                }
            }
        }
        Ok(revoked)
    }

    /// Mints the credentials of one service binding and stores them at the
    /// binding's secret path.
    pub async fn provide_binding(
        &self,
        instance_id: &ServiceInstanceId,
        binding_id: &BindingId,
        providers: &[CredentialProviderSpec],
    ) -> Result<SecretData, PipelineError> {
        let mut credentials = SecretData::new();
        for provider in providers {
            credentials.extend(self.mint(instance_id, binding_id.as_str(), provider).await?);
        }
        if !credentials.is_empty() {
            let path = binding_secret_path(instance_id.as_str(), binding_id.as_str());
            self.secret_store
                .store(&path, &credentials)
                .await
                .map_err(|source| PipelineError::Credentials { provider: "binding", source })?;
            info!(service_instance_id = %instance_id, binding_id = %binding_id, "Binding credentials stored");
        }
        Ok(credentials)
    }

    pub async fn revoke_binding(
        &self,
        instance_id: &ServiceInstanceId,
        binding_id: &BindingId,
        providers: &[CredentialProviderSpec],
    ) -> Result<(), PipelineError> {
        for provider in providers {
            if let CredentialProviderSpec::OAuth2Client(_) = provider {
                let client_id = oauth2_client_id(binding_id.as_str(), instance_id);
                self.identity
                    .delete_client(&client_id)
                    .await
                    .map_err(|source| PipelineError::Credentials { provider: provider.kind(), source })?;
            }
        }
        let path = binding_secret_path(instance_id.as_str(), binding_id.as_str());
        self.secret_store
            .delete(&path)
            .await
            .map_err(|source| PipelineError::Credentials { provider: "binding", source })
    }

    /// Generates the key/value pairs of one provider. OAuth2 clients are
    /// registered with the identity provider here.
    async fn mint(
        &self,
        instance_id: &ServiceInstanceId,
        owner: &str,
        provider: &CredentialProviderSpec,
    ) -> Result<SecretData, PipelineError> {
        let failed = |source| PipelineError::Credentials { provider: provider.kind(), source };

        match provider {
            CredentialProviderSpec::BasicAuth(spec) => {
                let username = self.generator.generate(&spec.policy).map_err(failed)?;
                let password = self.generator.generate(&spec.policy).map_err(failed)?;
                Ok(SecretData::from([
                    (spec.username_key.clone(), username),
                    (spec.password_key.clone(), password),
                ]))
            }
            CredentialProviderSpec::OAuth2Client(spec) => {
                let client = OAuth2Client {
                    client_id: oauth2_client_id(owner, instance_id),
                    client_secret: self.generator.generate(&spec.policy).map_err(failed)?,
                    grant_types: spec.grant_types.clone(),
                    authorities: spec.authorities.clone(),
                };
                let client_id = self.identity.create_client(&client).await.map_err(failed)?;
                info!(client_id = %client_id, "OAuth2 client registered");
                Ok(SecretData::from([
                    (spec.client_id_key.clone(), client_id),
                    (spec.client_secret_key.clone(), client.client_secret),
                ]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::credentials::{InMemoryIdentityClient, InMemorySecretStore, SeededCredentialGenerator};

    struct Fixture {
        providers: CredentialProviders,
        store: Arc<InMemorySecretStore>,
        identity: Arc<InMemoryIdentityClient>,
    }

    fn fixture(seed: u64) -> Fixture {
        let store = Arc::new(InMemorySecretStore::new());
        let identity = Arc::new(InMemoryIdentityClient::new());
        let providers = CredentialProviders::new(
            Arc::new(SeededCredentialGenerator::new(seed)),
            store.clone(),
            identity.clone(),
        );
        Fixture {
            providers,
            store,
            identity,
        }
    }

    fn si() -> ServiceInstanceId {
        ServiceInstanceId::new("si-1")
    }

    #[tokio::test]
    async fn basic_auth_injects_raw_credentials() {
        let f = fixture(1);
        let mut env = Environment::from([("KEEP".to_string(), "me".to_string())]);
        let providers = vec![CredentialProviderSpec::BasicAuth(BasicAuthSpec::default())];

        f.providers.provide(&si(), "web", &providers, &mut env).await.unwrap();

        assert_eq!(env["KEEP"], "me");
        assert_eq!(env["SECURITY_USER_NAME"].len(), 24);
        assert_eq!(env["SECURITY_USER_PASSWORD"].len(), 24);
        assert!(f.store.paths().is_empty());
    }

    #[tokio::test]
    async fn same_seed_same_environment() {
        let providers = vec![CredentialProviderSpec::BasicAuth(BasicAuthSpec::default())];
        let mut a = Environment::new();
        let mut b = Environment::new();
        fixture(9).providers.provide(&si(), "web", &providers, &mut a).await.unwrap();
        fixture(9).providers.provide(&si(), "web", &providers, &mut b).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn secret_references_go_through_the_store() {
        let f = fixture(2);
        let mut env = Environment::new();
        let providers = vec![CredentialProviderSpec::BasicAuth(BasicAuthSpec {
            secret_reference: true,
            ..BasicAuthSpec::default()
        })];

        f.providers.provide(&si(), "web", &providers, &mut env).await.unwrap();

        let path = "appbroker/si-1/web/basic-auth";
        assert_eq!(env["SECURITY_USER_NAME"], format!("(({}/SECURITY_USER_NAME))", path));
        assert!(f.store.get(path).is_some());
        assert!(f.store.readers(path).contains("web"));

        assert!(f.providers.revoke(&si(), "web", &providers).await.unwrap());
        assert!(f.store.get(path).is_none());

        let before = f.store.mutations();
        assert!(!f.providers.revoke(&si(), "web", &providers).await.unwrap());
        assert_eq!(f.store.mutations(), before);
    }

    #[tokio::test]
    async fn oauth2_client_is_registered_and_revoked() {
        let f = fixture(3);
        let mut env = Environment::new();
        let providers = vec![CredentialProviderSpec::OAuth2Client(OAuth2ClientSpec {
            authorities: vec!["uaa.resource".into()],
            ..OAuth2ClientSpec::default()
        })];

        f.providers.provide(&si(), "web", &providers, &mut env).await.unwrap();
        assert_eq!(env["OAUTH2_CLIENT_ID"], "web-si-1");
        let client = f.identity.client("web-si-1").unwrap();
        assert_eq!(client.client_secret, env["OAUTH2_CLIENT_SECRET"]);
        assert_eq!(client.grant_types, vec!["client_credentials".to_string()]);

        assert!(f.providers.revoke(&si(), "web", &providers).await.unwrap());
        assert!(f.identity.was_deleted("web-si-1"));

        let before = f.identity.mutations();
        assert!(!f.providers.revoke(&si(), "web", &providers).await.unwrap());
        assert_eq!(f.identity.mutations(), before);
    }

    #[tokio::test]
    async fn unreachable_store_aborts() {
        let f = fixture(4);
        f.store.set_unavailable(true);
        let providers = vec![CredentialProviderSpec::BasicAuth(BasicAuthSpec {
            secret_reference: true,
            ..BasicAuthSpec::default()
        })];
        let err = f
            .providers
            .provide(&si(), "web", &providers, &mut Environment::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Credentials { provider: "basic-auth", .. }));
    }

    #[tokio::test]
    async fn binding_credentials_are_stored_per_binding() {
        let f = fixture(5);
        let binding = BindingId::new("b-1");
        let providers = vec![CredentialProviderSpec::BasicAuth(BasicAuthSpec::default())];

        let creds = f.providers.provide_binding(&si(), &binding, &providers).await.unwrap();
        assert_eq!(f.store.get("appbroker/si-1/bindings/b-1"), Some(creds));

        f.providers.revoke_binding(&si(), &binding, &providers).await.unwrap();
        assert!(f.store.get("appbroker/si-1/bindings/b-1").is_none());
    }
}
