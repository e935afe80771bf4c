// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::domain::quota::{QuotaKey, ResourceKind};
use crate::domain::reservation::ReservationId;

/// Reservation lifecycle events published by the reservation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReservationEvent {
    ReservationCreated {
        reservation_id: ReservationId,
        key: QuotaKey,
        resource: ResourceKind,
        delta: i64,
        created_at: DateTime<Utc>,
    },
    ReservationCommitted {
        reservation_id: ReservationId,
        key: QuotaKey,
        resource: ResourceKind,
        delta: i64,
        committed_at: DateTime<Utc>,
    },
    ReservationRolledBack {
        reservation_id: ReservationId,
        key: QuotaKey,
        resource: ResourceKind,
        delta: i64,
        rolled_back_at: DateTime<Utc>,
    },
    ReservationExpired {
        reservation_id: ReservationId,
        key: QuotaKey,
        resource: ResourceKind,
        held_since: DateTime<Utc>,
        expired_at: DateTime<Utc>,
    },
    QuotaExceeded {
        key: QuotaKey,
        resource: ResourceKind,
        requested: i64,
        available: i64,
        exceeded_at: DateTime<Utc>,
    },
}

/// Limit administration events published by the quota service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QuotaEvent {
    QuotaUpdated {
        key: QuotaKey,
        resource: ResourceKind,
        old_limit: i64,
        new_limit: i64,
        forced: bool,
        updated_at: DateTime<Utc>,
    },
    QuotaDeleted {
        key: QuotaKey,
        overrides_removed: usize,
        deleted_at: DateTime<Utc>,
    },
    ProjectRegistered {
        key: QuotaKey,
        registered_at: DateTime<Utc>,
    },
}
