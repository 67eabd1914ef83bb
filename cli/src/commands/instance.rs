// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service instance commands
//!
//! Commands: create, update, delete, status, list, start, stop, restart,
//! restage. Lifecycle commands run the workflow in this process against the
//! configured platform and block until the operation settles.

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use appbroker_core::application::{wait_for_operation, ManagementAction};
use appbroker_core::domain::broker_config::BrokerConfigManifest;
use appbroker_core::domain::events::OperationEvent;
use appbroker_core::domain::operation::{LastOperation, OperationId, OperationState, SubTaskStatus};
use appbroker_core::domain::service_instance::{
    DeprovisionRequest, Parameters, ProvisionRequest, ServiceInstanceId,
};
use appbroker_core::infrastructure::event_bus::{EventBusError, OperationEventReceiver};
use appbroker_core::Broker;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const WAIT_DEADLINE: Duration = Duration::from_secs(30 * 60);

#[derive(Subcommand)]
pub enum InstanceCommand {
    /// Provision a service instance
    Create {
        /// Service instance ID
        #[arg(value_name = "INSTANCE_ID")]
        id: String,

        /// Service offering name
        #[arg(short, long)]
        service: String,

        /// Plan name
        #[arg(short, long)]
        plan: String,

        /// Request parameter as KEY=VALUE (VALUE parsed as JSON when possible)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Request parameters as a JSON object, or @file.json
        #[arg(long, value_name = "JSON")]
        parameters: Option<String>,
    },

    /// Update a provisioned service instance
    Update {
        #[arg(value_name = "INSTANCE_ID")]
        id: String,

        #[arg(short, long)]
        service: String,

        #[arg(short, long)]
        plan: String,

        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        #[arg(long, value_name = "JSON")]
        parameters: Option<String>,
    },

    /// Deprovision a service instance
    Delete {
        #[arg(value_name = "INSTANCE_ID")]
        id: String,

        #[arg(short, long)]
        service: String,

        #[arg(short, long)]
        plan: String,
    },

    /// Show the last operation and app health of a service instance
    Status {
        #[arg(value_name = "INSTANCE_ID")]
        id: String,
    },

    /// List known service instances
    List,

    /// Start every backing app
    Start {
        #[arg(value_name = "INSTANCE_ID")]
        id: String,
    },

    /// Stop every backing app
    Stop {
        #[arg(value_name = "INSTANCE_ID")]
        id: String,
    },

    /// Restart every backing app
    Restart {
        #[arg(value_name = "INSTANCE_ID")]
        id: String,
    },

    /// Restage every backing app
    Restage {
        #[arg(value_name = "INSTANCE_ID")]
        id: String,
    },
}

pub async fn handle_command(command: InstanceCommand, config_path: Option<PathBuf>) -> Result<()> {
    let config = BrokerConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    let broker = Broker::from_config(config)?;

    match command {
        InstanceCommand::Create {
            id,
            service,
            plan,
            params,
            parameters,
        } => {
            let request = provision_request(&id, &service, &plan, &params, parameters.as_deref())?;
            println!("Creating service instance {} ({}/{})", id.bold(), service, plan);
            let instance_id = request.instance_id.clone();
            let mut events = broker.event_bus.subscribe_instance(instance_id.clone());
            let operation_id = broker.service_instances.create(request).await?;
            follow(&broker, &instance_id, operation_id, &mut events).await
        }
        InstanceCommand::Update {
            id,
            service,
            plan,
            params,
            parameters,
        } => {
            let request = provision_request(&id, &service, &plan, &params, parameters.as_deref())?;
            println!("Updating service instance {} ({}/{})", id.bold(), service, plan);
            let instance_id = request.instance_id.clone();
            let mut events = broker.event_bus.subscribe_instance(instance_id.clone());
            let operation_id = broker.service_instances.update(request).await?;
            follow(&broker, &instance_id, operation_id, &mut events).await
        }
        InstanceCommand::Delete { id, service, plan } => {
            println!("Deleting service instance {} ({}/{})", id.bold(), service, plan);
            let request = DeprovisionRequest::new(id.as_str(), service, plan);
            let instance_id = request.instance_id.clone();
            let mut events = broker.event_bus.subscribe_instance(instance_id.clone());
            let operation_id = broker.service_instances.delete(request).await?;
            follow(&broker, &instance_id, operation_id, &mut events).await
        }
        InstanceCommand::Status { id } => status(&broker, &ServiceInstanceId::new(id)).await,
        InstanceCommand::List => list(&broker).await,
        InstanceCommand::Start { id } => manage(&broker, &id, ManagementAction::Start).await,
        InstanceCommand::Stop { id } => manage(&broker, &id, ManagementAction::Stop).await,
        InstanceCommand::Restart { id } => manage(&broker, &id, ManagementAction::Restart).await,
        InstanceCommand::Restage { id } => manage(&broker, &id, ManagementAction::Restage).await,
    }
}

/// Prints sub-task outcomes as they settle, then the final status.
async fn follow(
    broker: &Broker,
    id: &ServiceInstanceId,
    operation_id: OperationId,
    events: &mut OperationEventReceiver,
) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(OperationEvent::SubTaskSettled {
                operation_id: settled_for,
                sub_task,
                ..
            }) if settled_for == operation_id => {
                let line = format!("  {}", sub_task);
                match sub_task.status {
                    SubTaskStatus::Succeeded => println!("{}", line.green()),
                    SubTaskStatus::AlreadySatisfied => println!("{}", line.dimmed()),
                    SubTaskStatus::Failed(_) => println!("{}", line.red()),
                }
            }
            Ok(OperationEvent::OperationCompleted {
                operation_id: completed, ..
            }) if completed == operation_id => break,
            Ok(_) => {}
            Err(EventBusError::Lagged(n)) => warn!("Missed {} progress events", n),
            Err(e) => {
                debug!("Progress stream ended: {}", e);
                break;
            }
        }
    }

    let last = wait_for_operation(
        broker.service_instances.as_ref(),
        id,
        operation_id,
        POLL_INTERVAL,
        WAIT_DEADLINE,
    )
    .await?;
    report(&last)
}

fn report(last: &LastOperation) -> Result<()> {
    match last.state {
        OperationState::Succeeded => {
            println!("{}", format!("✓ {}", last.description).green());
            Ok(())
        }
        OperationState::Failed => bail!("{}", last.description),
        _ => {
            println!("{}", last.description.yellow());
            Ok(())
        }
    }
}

async fn status(broker: &Broker, id: &ServiceInstanceId) -> Result<()> {
    let Some(instance) = broker.service_instances.get(id).await? else {
        bail!("Service instance {} not found", id);
    };

    println!("{}", format!("Service instance {}", id).bold());
    println!("  Plan: {}/{}", instance.service_name, instance.plan_name);
    if let Some(namespace) = &instance.namespace {
        println!("  Namespace: {}", namespace);
    }
    println!("  Updated: {}", instance.updated_at.to_rfc3339());

    if let Some(last) = broker.service_instances.last_operation(id).await? {
        let status = match last.state {
            OperationState::Succeeded => last.status().green(),
            OperationState::Failed => last.status().red(),
            _ => last.status().yellow(),
        };
        println!("  Last operation: {} {} ({})", last.kind, status, last.operation_id);
        println!("    {}", last.description);
    }

    println!();
    println!("{}", "Apps:".bold());
    match broker.management.status(id).await {
        Ok(statuses) => {
            for app in statuses {
                let health = if app.is_healthy() {
                    "healthy".green()
                } else if app.is_stopped() {
                    "stopped".dimmed()
                } else {
                    "degraded".yellow()
                };
                println!(
                    "  {} {} ({}/{} running)",
                    app.deployment,
                    health,
                    app.running_count(),
                    app.requested_instances
                );
            }
        }
        Err(e) => println!("  {}", format!("unavailable: {}", e).yellow()),
    }

    Ok(())
}

async fn list(broker: &Broker) -> Result<()> {
    let mut instances = broker.service_instances.list().await?;
    if instances.is_empty() {
        println!("{}", "No service instances".dimmed());
        return Ok(());
    }
    instances.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
    for instance in instances {
        println!(
            "{}  {}/{}  {}",
            instance.id.to_string().bold(),
            instance.service_name,
            instance.plan_name,
            instance.namespace.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn manage(broker: &Broker, id: &str, action: ManagementAction) -> Result<()> {
    let id = ServiceInstanceId::new(id);
    let management = &broker.management;
    let deployments = match action {
        ManagementAction::Start => management.start(&id).await?,
        ManagementAction::Stop => management.stop(&id).await?,
        ManagementAction::Restart => management.restart(&id).await?,
        ManagementAction::Restage => management.restage(&id).await?,
    };
    for deployment in deployments {
        println!("{}", format!("✓ {} {}", action, deployment).green());
    }
    Ok(())
}

fn provision_request(
    id: &str,
    service: &str,
    plan: &str,
    params: &[String],
    parameters: Option<&str>,
) -> Result<ProvisionRequest> {
    let mut request = ProvisionRequest::new(id, service, plan);
    request.parameters = parse_parameters(params, parameters)?;
    Ok(request)
}

/// Merges `--parameters` (inline JSON or `@file`) with `--param KEY=VALUE`
/// pairs; the pairs win.
pub fn parse_parameters(pairs: &[String], json: Option<&str>) -> Result<Parameters> {
    let mut parameters = match json {
        Some(raw) => {
            let text = match raw.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read parameters file {}", path))?,
                None => raw.to_string(),
            };
            match serde_json::from_str::<Value>(&text).context("Parameters are not valid JSON")? {
                Value::Object(map) => map,
                _ => bail!("Parameters must be a JSON object"),
            }
        }
        None => Parameters::new(),
    };

    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid parameter '{}': expected KEY=VALUE", pair);
        };
        if key.is_empty() {
            bail!("Invalid parameter '{}': empty key", pair);
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        parameters.insert(key.to_string(), value);
    }

    Ok(parameters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pairs_parse_json_values_and_fall_back_to_strings() {
        let parameters = parse_parameters(
            &["count=3".into(), "LOG_LEVEL=debug".into(), "flags={\"beta\":true}".into()],
            None,
        )
        .unwrap();

        assert_eq!(parameters["count"], json!(3));
        assert_eq!(parameters["LOG_LEVEL"], json!("debug"));
        assert_eq!(parameters["flags"], json!({ "beta": true }));
    }

    #[test]
    fn pairs_override_the_json_object() {
        let parameters = parse_parameters(&["count=5".into()], Some(r#"{"count": 1, "memory": "1G"}"#)).unwrap();
        assert_eq!(parameters["count"], json!(5));
        assert_eq!(parameters["memory"], json!("1G"));
    }

    #[test]
    fn parameters_can_come_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"storage_gb": 20}"#).unwrap();

        let parameters = parse_parameters(&[], Some(&format!("@{}", path.display()))).unwrap();
        assert_eq!(parameters["storage_gb"], json!(20));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(parse_parameters(&["novalue".into()], None).is_err());
        assert!(parse_parameters(&["=x".into()], None).is_err());
        assert!(parse_parameters(&[], Some("[1, 2]")).is_err());
    }
}
