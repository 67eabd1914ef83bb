// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Value types, aggregates and the contracts the application layer drives.
//! Nothing here performs I/O.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Service instances, backing resource declarations,
//!   targeting, operations and collaborator traits

pub mod backing;
pub mod broker_config;
pub mod credentials;
pub mod events;
pub mod operation;
pub mod platform;
pub mod repository;
pub mod service_instance;
pub mod target;
