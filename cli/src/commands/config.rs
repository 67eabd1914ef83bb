// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use appbroker_core::domain::broker_config::{BrokerConfigManifest, PlatformType};

pub const MINIMAL_TEMPLATE: &str = include_str!("../../templates/config-minimal.yaml");
pub const EXAMPLES_TEMPLATE: &str = include_str!("../../templates/config-with-examples.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the resolved manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./appbroker-config.yaml)
        #[arg(short, long, default_value = "./appbroker-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = BrokerConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. APPBROKER_CONFIG_PATH: {}",
            std::env::var("APPBROKER_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./appbroker-config.yaml");
        println!("  4. ~/.appbroker/config.yaml");
        println!("  5. /etc/appbroker/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Broker:".bold());
    println!("  Name: {}", config.metadata.name);
    if let Some(version) = &config.metadata.version {
        println!("  Version: {}", version);
    }
    println!();

    let platform = &config.spec.platform;
    println!("{}", "Platform:".bold());
    match platform.platform_type {
        PlatformType::InMemory => println!("  Type: in-memory"),
        PlatformType::CloudFoundry => {
            println!("  Type: cloud-foundry");
            println!("  API: {}", platform.api_url.as_deref().unwrap_or("(none)"));
            println!("  Organization: {}", platform.organization.as_deref().unwrap_or("(none)"));
        }
    }
    println!("  Default namespace: {}", platform.default_namespace);
    println!("  API timeout: {:?}", platform.api_timeout);
    println!("  Status timeout: {:?}", platform.status_timeout);
    println!();

    println!("{}", "Deployment:".bold());
    println!("  Default target: {}", config.spec.deployment.default_target);
    println!("  Max concurrency: {}", config.spec.deployment.max_concurrency);
    println!();

    println!("{}", "Service plans:".bold());
    if config.spec.services.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for plan in &config.spec.services {
        println!(
            "  {}/{} ({})",
            plan.service_name.bold(),
            plan.plan_name,
            plan.strategy(config.spec.deployment.default_target)
        );
        for app in &plan.apps {
            println!("    app {} → {}", app.name, app.path);
        }
        for service in &plan.services {
            println!("    service {} → {} {}", service.name, service.service, service.plan);
        }
    }

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = BrokerConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        EXAMPLES_TEMPLATE
    } else {
        MINIMAL_TEMPLATE
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_are_valid_manifests() {
        for template in [MINIMAL_TEMPLATE, EXAMPLES_TEMPLATE] {
            let config = BrokerConfigManifest::from_yaml_str(template).unwrap();
            config.validate().unwrap();
        }
    }

    #[tokio::test]
    async fn generate_writes_a_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("appbroker-config.yaml");

        generate(output.clone(), true).await.unwrap();

        let config = BrokerConfigManifest::from_yaml_file(&output).unwrap();
        assert!(config.find_plan("shop", "standard").is_some());
    }
}
