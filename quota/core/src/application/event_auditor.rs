// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Event Auditor
//!
//! Subscribes to the event bus and writes every reservation and quota
//! event to the `quotad::audit` log target, one structured record per
//! event, and counts them per kind. Limit changes and expired holds are
//! logged at info, routine reservation traffic at debug.
//!
//! Errors never stop the task; it ends when the bus closes or on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::events::ReservationEvent;
use crate::infrastructure::event_bus::{DomainEvent, EventBus, EventBusError};

const EVENTS_AUDITED_TOTAL: &str = "quotad_events_audited_total";
const EVENTS_DROPPED_TOTAL: &str = "quotad_events_dropped_total";

pub struct EventAuditor {
    event_bus: Arc<EventBus>,
    processed: AtomicU64,
    dropped: AtomicU64,
    shutdown_token: CancellationToken,
}

impl EventAuditor {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            event_bus,
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Handle used to stop the auditor
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Events recorded so far
    pub fn events_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Events lost because the auditor fell behind the bus
    pub fn events_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Subscribe and spawn the audit loop.
    ///
    /// The subscription is taken before this returns, so every event
    /// published afterwards is seen.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        info!("Starting event auditor");
        let mut receiver = self.event_bus.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = receiver.recv() => match received {
                        Ok(event) => self.record(&event),
                        Err(EventBusError::Lagged(n)) => {
                            self.dropped.fetch_add(n, Ordering::Relaxed);
                            metrics::counter!(EVENTS_DROPPED_TOTAL).increment(n);
                            warn!("Event auditor lagged by {} events, audit trail has a gap", n);
                        }
                        Err(EventBusError::Closed) => {
                            info!("Event bus closed, stopping event auditor");
                            break;
                        }
                    },
                    _ = self.shutdown_token.cancelled() => {
                        info!("Shutdown signal received, stopping event auditor");
                        break;
                    }
                }
            }

            info!(
                processed = self.events_processed(),
                dropped = self.events_dropped(),
                "Event auditor shut down"
            );
        })
    }

    fn record(&self, event: &DomainEvent) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();
        metrics::counter!(EVENTS_AUDITED_TOTAL, "kind" => kind).increment(1);

        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind, "Failed to serialize audit event: {}", e);
                return;
            }
        };
        let project_id = event.project_id().as_str();

        if is_notable(event) {
            info!(target: "quotad::audit", kind, project_id, event = %payload, "quota event");
        } else {
            debug!(target: "quotad::audit", kind, project_id, event = %payload, "quota event");
        }
    }
}

fn is_notable(event: &DomainEvent) -> bool {
    match event {
        DomainEvent::Quota(_) => true,
        DomainEvent::Reservation(event) => matches!(
            event,
            ReservationEvent::ReservationExpired { .. } | ReservationEvent::QuotaExceeded { .. }
        ),
    }
}
