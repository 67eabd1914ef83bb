// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod cloud_foundry;
pub mod credentials;
pub mod event_bus;
pub mod platform;
pub mod repositories;

pub use credentials::{InMemoryIdentityClient, InMemorySecretStore, RandomCredentialGenerator};
pub use event_bus::EventBus;
