// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cloud Foundry adapter (Cloud Controller v3 API).

pub mod client;
pub mod deployer;
pub mod models;

pub use client::{CloudFoundryClient, Credentials};
pub use deployer::CloudFoundryDeployer;
