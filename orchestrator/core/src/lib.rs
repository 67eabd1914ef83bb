// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lib
//!
//! Broker control plane: provisions, updates and deprovisions the backing
//! apps and backing services of a service instance on a remote platform.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, lifecycle workflows and platform adapters

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use application::broker::{Broker, Collaborators};
pub use domain::*;
