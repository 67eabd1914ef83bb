// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod binding;
pub mod broker;
pub mod create_service_instance;
pub mod credentials;
pub mod delete_service_instance;
pub mod lifecycle;
pub mod management;
pub mod operation_tracker;
pub mod pipeline;
pub mod repository_factory;
pub mod service_instance;
pub mod update_service_instance;

// Re-export use cases for convenience
pub use binding::{ServiceBindingService, StandardServiceBindingService};
pub use lifecycle::{WorkflowContext, WorkflowError};
pub use management::{ManagementAction, ManagementService, StandardManagementService};
pub use operation_tracker::OperationTracker;
pub use service_instance::{wait_for_operation, ServiceInstanceService, StandardServiceInstanceService};
