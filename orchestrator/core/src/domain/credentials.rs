// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Collaborator contracts used by credential providers: where minted secrets
//! are kept, who registers OAuth2 clients, and where randomness comes from.

use crate::domain::backing::PasswordPolicy;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Secret store error at '{path}': {message}")]
    SecretStore { path: String, message: String },

    #[error("Identity provider error for client '{client_id}': {message}")]
    Identity { client_id: String, message: String },

    #[error("Invalid password policy: {0}")]
    InvalidPolicy(String),
}

/// Key/value secrets stored at a path.
pub type SecretData = BTreeMap<String, String>;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn store(&self, path: &str, data: &SecretData) -> Result<(), CredentialError>;

    async fn exists(&self, path: &str) -> Result<bool, CredentialError>;

    /// Deleting an absent path succeeds.
    async fn delete(&self, path: &str) -> Result<(), CredentialError>;

    async fn grant_read(&self, path: &str, principal: &str) -> Result<(), CredentialError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuth2Client {
    pub client_id: String,
    pub client_secret: String,
    pub grant_types: Vec<String>,
    pub authorities: Vec<String>,
}

#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Registers (or replaces) a client and returns its id.
    async fn create_client(&self, client: &OAuth2Client) -> Result<String, CredentialError>;

    async fn client_exists(&self, client_id: &str) -> Result<bool, CredentialError>;

    /// Deleting an absent client succeeds.
    async fn delete_client(&self, client_id: &str) -> Result<(), CredentialError>;
}

/// Source of generated secrets. Seeded implementations make pipeline
/// output reproducible.
pub trait CredentialGenerator: Send + Sync {
    fn generate(&self, policy: &PasswordPolicy) -> Result<String, CredentialError>;
}

/// Secret store path for credentials minted for one app of an instance.
pub fn app_secret_path(instance_id: &str, app: &str, provider: &str) -> String {
    format!("appbroker/{}/{}/{}", instance_id, app, provider)
}

/// Secret store path for credentials minted for a service binding.
pub fn binding_secret_path(instance_id: &str, binding_id: &str) -> String {
    format!("appbroker/{}/bindings/{}", instance_id, binding_id)
}

/// Placeholder the platform resolves against the secret store at runtime.
pub fn secret_reference(path: &str, key: &str) -> String {
    format!("(({}/{}))", path, key)
}
