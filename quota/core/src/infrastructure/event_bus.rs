// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory event streaming over tokio broadcast channels. Subscribers that
// fall behind lose the oldest events.

use crate::domain::events::{QuotaEvent, ReservationEvent};
use crate::domain::quota::ProjectId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Reservation(ReservationEvent),
    Quota(QuotaEvent),
}

impl DomainEvent {
    /// Stable snake_case name of the wrapped event
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::Reservation(event) => match event {
                ReservationEvent::ReservationCreated { .. } => "reservation_created",
                ReservationEvent::ReservationCommitted { .. } => "reservation_committed",
                ReservationEvent::ReservationRolledBack { .. } => "reservation_rolled_back",
                ReservationEvent::ReservationExpired { .. } => "reservation_expired",
                ReservationEvent::QuotaExceeded { .. } => "quota_exceeded",
            },
            DomainEvent::Quota(event) => match event {
                QuotaEvent::QuotaUpdated { .. } => "quota_updated",
                QuotaEvent::QuotaDeleted { .. } => "quota_deleted",
                QuotaEvent::ProjectRegistered { .. } => "project_registered",
            },
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        match self {
            DomainEvent::Reservation(event) => match event {
                ReservationEvent::ReservationCreated { key, .. }
                | ReservationEvent::ReservationCommitted { key, .. }
                | ReservationEvent::ReservationRolledBack { key, .. }
                | ReservationEvent::ReservationExpired { key, .. }
                | ReservationEvent::QuotaExceeded { key, .. } => &key.project_id,
            },
            DomainEvent::Quota(event) => match event {
                QuotaEvent::QuotaUpdated { key, .. }
                | QuotaEvent::QuotaDeleted { key, .. }
                | QuotaEvent::ProjectRegistered { key, .. } => &key.project_id,
            },
        }
    }
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus; `capacity` events are buffered per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_reservation_event(&self, event: ReservationEvent) {
        self.publish(DomainEvent::Reservation(event));
    }

    pub fn publish_quota_event(&self, event: QuotaEvent) {
        self.publish(DomainEvent::Quota(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
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

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::quota::{QuotaKey, ResourceKind};
    use crate::domain::reservation::ReservationId;
    use chrono::Utc;

    fn key(project: &str) -> QuotaKey {
        QuotaKey::project(ProjectId::new(project).unwrap())
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let reservation_id = ReservationId::new();
        event_bus.publish_reservation_event(ReservationEvent::ReservationCreated {
            reservation_id,
            key: key("p1"),
            resource: ResourceKind::Shares,
            delta: 1,
            created_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Reservation(ReservationEvent::ReservationCreated { reservation_id: id, .. }) => {
                assert_eq!(id, reservation_id);
            }
            _ => panic!("Wrong event type received"),
        }
    }

    #[test]
    fn test_event_kind_and_project() {
        let event = DomainEvent::Quota(QuotaEvent::QuotaDeleted {
            key: key("p2"),
            overrides_removed: 1,
            deleted_at: Utc::now(),
        });
        assert_eq!(event.kind(), "quota_deleted");
        assert_eq!(event.project_id().as_str(), "p2");
    }

    #[tokio::test]
    async fn test_lagged_receiver_reports_dropped_events() {
        let event_bus = EventBus::new(2);
        let mut receiver = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 1);

        for n in 0..3 {
            event_bus.publish_quota_event(QuotaEvent::QuotaDeleted {
                key: key("p1"),
                overrides_removed: n,
                deleted_at: Utc::now(),
            });
        }

        assert!(matches!(receiver.recv().await, Err(EventBusError::Lagged(1))));
        match receiver.recv().await.unwrap() {
            DomainEvent::Quota(QuotaEvent::QuotaDeleted { overrides_removed, .. }) => {
                assert_eq!(overrides_removed, 1);
            }
            _ => panic!("Wrong event type received"),
        }
    }
}
