// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Broker Events
//
// In-memory event streaming over tokio broadcast channels. Observers (CLI
// progress output, tests) subscribe; events are lost on restart.

use crate::domain::events::{BindingEvent, ManagementEvent, OperationEvent};
use crate::domain::service_instance::ServiceInstanceId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified broker event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    Operation(OperationEvent),
    Management(ManagementEvent),
    Binding(BindingEvent),
}

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<BrokerEvent>>,
}

impl EventBus {
    /// Capacity is how many events are buffered before the oldest are dropped
    /// for slow receivers.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_operation_event(&self, event: OperationEvent) {
        self.publish(BrokerEvent::Operation(event));
    }

    pub fn publish_management_event(&self, event: ManagementEvent) {
        self.publish(BrokerEvent::Management(event));
    }

    pub fn publish_binding_event(&self, event: BindingEvent) {
        self.publish(BrokerEvent::Binding(event));
    }

    fn publish(&self, event: BrokerEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is listening
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to operation events of a single service instance.
    pub fn subscribe_instance(&self, service_instance_id: ServiceInstanceId) -> OperationEventReceiver {
        OperationEventReceiver {
            receiver: self.sender.subscribe(),
            service_instance_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<BrokerEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<BrokerEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<BrokerEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one service instance's operation events
pub struct OperationEventReceiver {
    receiver: broadcast::Receiver<BrokerEvent>,
    service_instance_id: ServiceInstanceId,
}

impl OperationEventReceiver {
    pub async fn recv(&mut self) -> Result<OperationEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let BrokerEvent::Operation(op_event) = event {
                if op_event.service_instance_id() == &self.service_instance_id {
                    return Ok(op_event);
                }
            }
        }
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::{OperationId, OperationKind};
    use chrono::Utc;

    fn started(id: &str) -> OperationEvent {
        OperationEvent::OperationStarted {
            operation_id: OperationId::new(),
            service_instance_id: ServiceInstanceId::new(id),
            kind: OperationKind::Create,
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish_operation_event(started("si-1"));

        match receiver.recv().await.unwrap() {
            BrokerEvent::Operation(OperationEvent::OperationStarted { service_instance_id, .. }) => {
                assert_eq!(service_instance_id.as_str(), "si-1");
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_instance_event_filtering() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_instance(ServiceInstanceId::new("si-2"));

        event_bus.publish_operation_event(started("si-1"));
        event_bus.publish_operation_event(started("si-2"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.service_instance_id().as_str(), "si-2");
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish_binding_event(BindingEvent::BindingCreated {
            service_instance_id: ServiceInstanceId::new("si-1"),
            binding_id: "b-1".into(),
            created_at: Utc::now(),
        });

        assert!(receiver1.recv().await.is_ok());
        assert!(receiver2.recv().await.is_ok());
        assert!(matches!(receiver1.try_recv(), Err(EventBusError::Empty)));
    }
}
