// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # appbroker
//!
//! Operator CLI for the broker control plane.
//!
//! ## Commands
//!
//! - `appbroker config show|validate|generate` - Configuration management
//! - `appbroker instance create|update|delete|status|list` - Run a lifecycle
//!   operation in-process and print its last-operation status
//! - `appbroker instance start|stop|restart|restage` - Management actions on
//!   the backing apps of a service instance

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use appbroker::commands::{self, ConfigCommand, InstanceCommand};

/// appbroker - provision backing apps and services for a marketplace
#[derive(Parser)]
#[command(name = "appbroker")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "APPBROKER_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "APPBROKER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Service instance lifecycle and management
    #[command(name = "instance")]
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Config { command } => commands::config::handle_command(command, cli.config).await,
        Commands::Instance { command } => commands::instance::handle_command(command, cli.config).await,
    }
}

/// Initialize tracing subscriber for logging. `RUST_LOG` wins over the flag.
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
