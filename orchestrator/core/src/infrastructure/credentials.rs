// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Credential collaborators: secret generators and in-memory stand-ins for
//! the secret store and the identity provider.
//!
//! The in-memory store and identity client are what the broker runs with
//! when no external adapter is wired in; they also record enough for tests
//! to assert on what was stored, granted and revoked.

use crate::domain::backing::PasswordPolicy;
use crate::domain::credentials::{
    CredentialError, CredentialGenerator, IdentityClient, OAuth2Client, SecretData, SecretStore,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const NUMBERS: &[u8] = b"0123456789";
const SPECIAL: &[u8] = b"!#$%&*+-=?@^_~";

/// Draws one character from every enabled class, fills up to `length` from
/// the union, then shuffles.
fn generate_with<R: Rng + ?Sized>(rng: &mut R, policy: &PasswordPolicy) -> Result<String, CredentialError> {
    let classes: Vec<&[u8]> = [
        (policy.include_uppercase, UPPERCASE),
        (policy.include_lowercase, LOWERCASE),
        (policy.include_numbers, NUMBERS),
        (policy.include_special, SPECIAL),
    ]
    .into_iter()
    .filter_map(|(enabled, class)| enabled.then_some(class))
    .collect();

    policy.check().map_err(CredentialError::InvalidPolicy)?;

    let alphabet: Vec<u8> = classes.iter().flat_map(|c| c.iter().copied()).collect();
    let mut chars: Vec<u8> = classes
        .iter()
        .map(|class| class[rng.random_range(0..class.len())])
        .collect();
    while chars.len() < policy.length {
        chars.push(alphabet[rng.random_range(0..alphabet.len())]);
    }
    chars.shuffle(rng);

    Ok(chars.into_iter().map(char::from).collect())
}

/// Secrets from the thread-local OS-seeded RNG.
#[derive(Debug, Default)]
pub struct RandomCredentialGenerator;

impl CredentialGenerator for RandomCredentialGenerator {
    fn generate(&self, policy: &PasswordPolicy) -> Result<String, CredentialError> {
        generate_with(&mut rand::rng(), policy)
    }
}

/// Reproducible secrets for tests and dry runs.
pub struct SeededCredentialGenerator {
    rng: Mutex<StdRng>,
}

impl SeededCredentialGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl CredentialGenerator for SeededCredentialGenerator {
    fn generate(&self, policy: &PasswordPolicy) -> Result<String, CredentialError> {
        let mut rng = self.rng.lock();
        generate_with(&mut *rng, policy)
    }
}

#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<BTreeMap<String, SecretData>>,
    grants: RwLock<BTreeMap<String, BTreeSet<String>>>,
    unavailable: RwLock<bool>,
    mutations: AtomicUsize,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<SecretData> {
        self.secrets.read().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.secrets.read().keys().cloned().collect()
    }

    pub fn readers(&self, path: &str) -> BTreeSet<String> {
        self.grants.read().get(path).cloned().unwrap_or_default()
    }

    /// Store, grant and delete calls so far.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Makes every call fail, as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write() = unavailable;
    }

    fn check_available(&self, path: &str) -> Result<(), CredentialError> {
        if *self.unavailable.read() {
            return Err(CredentialError::SecretStore {
                path: path.to_string(),
                message: "secret store unreachable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn store(&self, path: &str, data: &SecretData) -> Result<(), CredentialError> {
        self.check_available(path)?;
        self.mutations.fetch_add(1, Ordering::Relaxed);
        self.secrets.write().insert(path.to_string(), data.clone());
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, CredentialError> {
        self.check_available(path)?;
        Ok(self.secrets.read().contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<(), CredentialError> {
        self.check_available(path)?;
        self.mutations.fetch_add(1, Ordering::Relaxed);
        self.secrets.write().remove(path);
        self.grants.write().remove(path);
        Ok(())
    }

    async fn grant_read(&self, path: &str, principal: &str) -> Result<(), CredentialError> {
        self.check_available(path)?;
        self.mutations.fetch_add(1, Ordering::Relaxed);
        self.grants
            .write()
            .entry(path.to_string())
            .or_default()
            .insert(principal.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryIdentityClient {
    clients: RwLock<BTreeMap<String, OAuth2Client>>,
    deleted: Mutex<HashSet<String>>,
    mutations: AtomicUsize,
}

impl InMemoryIdentityClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, client_id: &str) -> Option<OAuth2Client> {
        self.clients.read().get(client_id).cloned()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    pub fn was_deleted(&self, client_id: &str) -> bool {
        self.deleted.lock().contains(client_id)
    }

    /// Create and delete calls so far.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl IdentityClient for InMemoryIdentityClient {
    async fn create_client(&self, client: &OAuth2Client) -> Result<String, CredentialError> {
        if client.client_id.is_empty() {
            return Err(CredentialError::Identity {
                client_id: String::new(),
                message: "client id cannot be empty".into(),
            });
        }
        self.mutations.fetch_add(1, Ordering::Relaxed);
        self.clients
            .write()
            .insert(client.client_id.clone(), client.clone());
        Ok(client.client_id.clone())
    }

    async fn client_exists(&self, client_id: &str) -> Result<bool, CredentialError> {
        Ok(self.clients.read().contains_key(client_id))
    }

    async fn delete_client(&self, client_id: &str) -> Result<(), CredentialError> {
        self.mutations.fetch_add(1, Ordering::Relaxed);
        if self.clients.write().remove(client_id).is_some() {
            self.deleted.lock().insert(client_id.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_honours_policy() {
        let generator = RandomCredentialGenerator;
        let policy = PasswordPolicy {
            length: 32,
            include_special: true,
            ..PasswordPolicy::default()
        };
        let secret = generator.generate(&policy).unwrap();
        assert_eq!(secret.len(), 32);
        assert!(secret.bytes().any(|b| UPPERCASE.contains(&b)));
        assert!(secret.bytes().any(|b| LOWERCASE.contains(&b)));
        assert!(secret.bytes().any(|b| NUMBERS.contains(&b)));
        assert!(secret.bytes().any(|b| SPECIAL.contains(&b)));
    }

    #[test]
    fn numbers_only_policy() {
        let policy = PasswordPolicy {
            length: 8,
            include_uppercase: false,
            include_lowercase: false,
            include_numbers: true,
            include_special: false,
        };
        let secret = RandomCredentialGenerator.generate(&policy).unwrap();
        assert!(secret.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn seeded_generator_is_reproducible() {
        let policy = PasswordPolicy::default();
        let a = SeededCredentialGenerator::new(7);
        let b = SeededCredentialGenerator::new(7);
        assert_eq!(a.generate(&policy).unwrap(), b.generate(&policy).unwrap());
        assert_eq!(a.generate(&policy).unwrap(), b.generate(&policy).unwrap());
    }

    #[test]
    fn impossible_policies_are_rejected() {
        let none = PasswordPolicy {
            include_uppercase: false,
            include_lowercase: false,
            include_numbers: false,
            include_special: false,
            ..PasswordPolicy::default()
        };
        assert!(RandomCredentialGenerator.generate(&none).is_err());

        let short = PasswordPolicy { length: 2, ..PasswordPolicy::default() };
        assert!(RandomCredentialGenerator.generate(&short).is_err());
    }

    #[tokio::test]
    async fn secret_store_records_grants_and_deletes() {
        let store = InMemorySecretStore::new();
        let data = SecretData::from([("password".to_string(), "x".to_string())]);
        store.store("appbroker/si-1/web/basic-auth", &data).await.unwrap();
        store.grant_read("appbroker/si-1/web/basic-auth", "web").await.unwrap();
        assert!(store.readers("appbroker/si-1/web/basic-auth").contains("web"));

        store.delete("appbroker/si-1/web/basic-auth").await.unwrap();
        assert!(store.get("appbroker/si-1/web/basic-auth").is_none());
        assert!(store.readers("appbroker/si-1/web/basic-auth").is_empty());

        store.set_unavailable(true);
        assert!(store.store("p", &data).await.is_err());
    }
}
