// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::quota::{QuotaError, QuotaKey, ResourceKind};

// ============================================================================
// Value Objects
// ============================================================================

/// Unique identifier for a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(pub Uuid);

impl ReservationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reservation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Quota is held, waiting for the caller to finish
    Held,
    /// Held amount was converted into usage
    Committed,
    /// Held amount was released
    RolledBack,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Held)
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReservationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held" => Ok(Self::Held),
            "committed" => Ok(Self::Committed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(format!("Unknown reservation state: {}", other)),
        }
    }
}

/// Outcome of a terminal transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed, counters must be adjusted
    Applied,
    /// Already in the requested state
    AlreadyDone,
}

// ============================================================================
// Aggregate Root: Reservation
// ============================================================================

/// Provisional hold against a quota limit, pending commit or rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub key: QuotaKey,
    pub resource: ResourceKind,
    /// Requested change in usage; negative for explicit decreases
    pub delta: i64,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(
        key: QuotaKey,
        resource: ResourceKind,
        delta: i64,
    ) -> Result<Self, QuotaError> {
        if delta == 0 {
            return Err(QuotaError::InvalidDelta(format!(
                "reservation delta for {} must be non-zero",
                resource
            )));
        }

        Ok(Self {
            id: ReservationId::new(),
            key,
            resource,
            delta,
            state: ReservationState::Held,
            created_at: Utc::now(),
        })
    }

    /// Amount added to the `reserved` counter while held.
    ///
    /// Decreases hold nothing: they only lower `in_use` once committed.
    pub fn held_amount(&self) -> i64 {
        self.delta.max(0)
    }

    pub fn is_held(&self) -> bool {
        self.state == ReservationState::Held
    }

    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_held() && self.created_at < cutoff
    }

    // ========================================================================
    // Aggregate Commands (State Mutations)
    // ========================================================================

    pub fn mark_committed(&mut self) -> Result<Transition, QuotaError> {
        match self.state {
            ReservationState::Held => {
                self.state = ReservationState::Committed;
                Ok(Transition::Applied)
            }
            ReservationState::Committed => Ok(Transition::AlreadyDone),
            ReservationState::RolledBack => Err(self.invalid("committed")),
        }
    }

    pub fn mark_rolled_back(&mut self) -> Result<Transition, QuotaError> {
        match self.state {
            ReservationState::Held => {
                self.state = ReservationState::RolledBack;
                Ok(Transition::Applied)
            }
            ReservationState::RolledBack => Ok(Transition::AlreadyDone),
            ReservationState::Committed => Err(self.invalid("rolled back")),
        }
    }

    fn invalid(&self, action: &'static str) -> QuotaError {
        QuotaError::InvalidReservationState {
            id: self.id.to_string(),
            state: self.state.to_string(),
            action,
        }
    }
}
