// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Limit Store Interface
//!
//! Persistence contract for quota limits, usage counters and reservations.
//! The interface lives in the domain layer and is implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Holds | Implementations |
//! |-------|-------|----------------|
//! | `LimitStore` | limit overrides, counters, reservations, known projects | `InMemoryLimitStore`, `PostgresLimitStore` |
//!
//! Counters are versioned. Writers read a `QuotaUsage`, compute the next
//! state and publish it with `compare_and_swap_usage`; a `false` result means
//! another writer got there first and the caller must re-read. Commit and
//! rollback go through `finish_reservation`, which lands the counters and the
//! reservation state in one atomic write so a retried transition cannot be
//! applied twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use crate::domain::quota::{ProjectId, QuotaKey, QuotaSet, QuotaUsage, ResourceKind, Scope};
use crate::domain::reservation::{Reservation, ReservationId};

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone)]
pub enum StorageBackend {
    InMemory,
    PostgreSQL(PostgresConfig),
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

#[async_trait]
pub trait LimitStore: Send + Sync {
    /// Record a project as known. Returns false if it already was.
    async fn register_project(&self, project_id: &ProjectId) -> Result<bool, RepositoryError>;

    async fn project_exists(&self, project_id: &ProjectId) -> Result<bool, RepositoryError>;

    /// Override stored at exactly this key, if any
    async fn get_limit(&self, key: &QuotaKey, resource: ResourceKind) -> Result<Option<i64>, RepositoryError>;

    /// All overrides stored at exactly this key
    async fn get_limits(&self, key: &QuotaKey) -> Result<BTreeMap<ResourceKind, i64>, RepositoryError>;

    /// User and share-type overrides of one resource within a project
    async fn find_scoped_limits(
        &self,
        project_id: &ProjectId,
        resource: ResourceKind,
    ) -> Result<Vec<(Scope, i64)>, RepositoryError>;

    /// Create or replace several overrides at one key, all or none
    async fn set_limits(&self, key: &QuotaKey, limits: &QuotaSet) -> Result<(), RepositoryError>;

    /// Create or replace a single override
    async fn set_limit(&self, key: &QuotaKey, resource: ResourceKind, limit: i64) -> Result<(), RepositoryError> {
        self.set_limits(key, &QuotaSet::from([(resource, limit)])).await
    }

    /// Remove every override stored at this key. Returns the number removed.
    async fn delete_limits(&self, key: &QuotaKey) -> Result<usize, RepositoryError>;

    /// Counters for exactly this key; zeroed at version 0 when never written
    async fn get_usage(&self, key: &QuotaKey, resource: ResourceKind) -> Result<QuotaUsage, RepositoryError>;

    /// Replace the counters if the stored version still equals `expected_version`.
    async fn compare_and_swap_usage(
        &self,
        key: &QuotaKey,
        resource: ResourceKind,
        expected_version: u64,
        next: QuotaUsage,
    ) -> Result<bool, RepositoryError>;

    /// Save reservation (create or update)
    async fn save_reservation(&self, reservation: &Reservation) -> Result<(), RepositoryError>;

    /// Publish the counters of a terminal transition together with the
    /// reservation's new state. Same version rule as `compare_and_swap_usage`;
    /// on `false` neither write happened.
    async fn finish_reservation(
        &self,
        reservation: &Reservation,
        expected_version: u64,
        next: QuotaUsage,
    ) -> Result<bool, RepositoryError>;

    async fn find_reservation(&self, id: ReservationId) -> Result<Option<Reservation>, RepositoryError>;

    /// Held reservations created before `cutoff`
    async fn find_stale_reservations(&self, cutoff: DateTime<Utc>) -> Result<Vec<Reservation>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
