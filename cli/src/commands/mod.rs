// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the appbroker CLI

pub mod config;
pub mod instance;

pub use self::config::ConfigCommand;
pub use self::instance::InstanceCommand;
