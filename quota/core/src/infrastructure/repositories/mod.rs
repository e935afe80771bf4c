// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Limit Store Implementations
//!
//! Infrastructure implementations of the `LimitStore` abstraction defined in
//! the domain layer.
//!
//! - **InMemoryLimitStore** - sharded `DashMap` storage for development, tests
//!   and single-node deployments
//! - **PostgresLimitStore** - durable storage; counter CAS is a conditional
//!   `UPDATE ... WHERE version = $n`

pub mod postgres_limit;

pub use postgres_limit::PostgresLimitStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use crate::domain::quota::{ProjectId, QuotaKey, QuotaSet, QuotaUsage, ResourceKind, Scope};
use crate::domain::repository::{LimitStore, RepositoryError, StorageBackend};
use crate::domain::reservation::{Reservation, ReservationId};
use crate::infrastructure::db::Database;

#[derive(Clone, Default)]
pub struct InMemoryLimitStore {
    projects: Arc<DashSet<ProjectId>>,
    limits: Arc<DashMap<QuotaKey, BTreeMap<ResourceKind, i64>>>,
    usage: Arc<DashMap<(QuotaKey, ResourceKind), QuotaUsage>>,
    reservations: Arc<DashMap<ReservationId, Reservation>>,
}

impl InMemoryLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version-checked counter write. `also` runs while the counter shard is
    /// still locked, so whatever it writes lands together with the counters.
    fn swap_usage(
        &self,
        key: &QuotaKey,
        resource: ResourceKind,
        expected_version: u64,
        next: QuotaUsage,
        also: impl FnOnce(),
    ) -> bool {
        match self.usage.entry((key.clone(), resource)) {
            Entry::Occupied(mut entry) => {
                if entry.get().version != expected_version {
                    return false;
                }
                also();
                entry.insert(next);
                true
            }
            Entry::Vacant(entry) => {
                if expected_version != 0 {
                    return false;
                }
                also();
                entry.insert(next);
                true
            }
        }
    }
}

#[async_trait]
impl LimitStore for InMemoryLimitStore {
    async fn register_project(&self, project_id: &ProjectId) -> Result<bool, RepositoryError> {
        Ok(self.projects.insert(project_id.clone()))
    }

    async fn project_exists(&self, project_id: &ProjectId) -> Result<bool, RepositoryError> {
        Ok(self.projects.contains(project_id))
    }

    async fn get_limit(&self, key: &QuotaKey, resource: ResourceKind) -> Result<Option<i64>, RepositoryError> {
        Ok(self
            .limits
            .get(key)
            .and_then(|limits| limits.get(&resource).copied()))
    }

    async fn get_limits(&self, key: &QuotaKey) -> Result<BTreeMap<ResourceKind, i64>, RepositoryError> {
        Ok(self
            .limits
            .get(key)
            .map(|limits| limits.clone())
            .unwrap_or_default())
    }

    async fn find_scoped_limits(
        &self,
        project_id: &ProjectId,
        resource: ResourceKind,
    ) -> Result<Vec<(Scope, i64)>, RepositoryError> {
        Ok(self
            .limits
            .iter()
            .filter(|entry| &entry.key().project_id == project_id && !entry.key().scope.is_project())
            .filter_map(|entry| {
                entry
                    .value()
                    .get(&resource)
                    .map(|limit| (entry.key().scope.clone(), *limit))
            })
            .collect())
    }

    async fn set_limits(&self, key: &QuotaKey, limits: &QuotaSet) -> Result<(), RepositoryError> {
        self.limits
            .entry(key.clone())
            .or_default()
            .extend(limits.iter().map(|(resource, limit)| (*resource, *limit)));
        Ok(())
    }

    async fn delete_limits(&self, key: &QuotaKey) -> Result<usize, RepositoryError> {
        Ok(self
            .limits
            .remove(key)
            .map(|(_, limits)| limits.len())
            .unwrap_or(0))
    }

    async fn get_usage(&self, key: &QuotaKey, resource: ResourceKind) -> Result<QuotaUsage, RepositoryError> {
        Ok(self
            .usage
            .get(&(key.clone(), resource))
            .map(|usage| *usage)
            .unwrap_or_default())
    }

    async fn compare_and_swap_usage(
        &self,
        key: &QuotaKey,
        resource: ResourceKind,
        expected_version: u64,
        next: QuotaUsage,
    ) -> Result<bool, RepositoryError> {
        Ok(self.swap_usage(key, resource, expected_version, next, || {}))
    }

    async fn save_reservation(&self, reservation: &Reservation) -> Result<(), RepositoryError> {
        self.reservations.insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn finish_reservation(
        &self,
        reservation: &Reservation,
        expected_version: u64,
        next: QuotaUsage,
    ) -> Result<bool, RepositoryError> {
        Ok(self.swap_usage(&reservation.key, reservation.resource, expected_version, next, || {
            self.reservations.insert(reservation.id, reservation.clone());
        }))
    }

    async fn find_reservation(&self, id: ReservationId) -> Result<Option<Reservation>, RepositoryError> {
        Ok(self.reservations.get(&id).map(|r| r.clone()))
    }

    async fn find_stale_reservations(&self, cutoff: DateTime<Utc>) -> Result<Vec<Reservation>, RepositoryError> {
        let mut stale: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.is_stale(cutoff))
            .map(|r| r.clone())
            .collect();
        stale.sort_by_key(|r| r.created_at);
        Ok(stale)
    }
}

/// Build a limit store for the configured backend
pub async fn create_limit_store(backend: StorageBackend) -> anyhow::Result<Arc<dyn LimitStore>> {
    match backend {
        StorageBackend::InMemory => Ok(Arc::new(InMemoryLimitStore::new())),
        StorageBackend::PostgreSQL(config) => {
            let database = Database::new(&config.connection_string, config.max_connections).await?;
            database.migrate().await?;
            Ok(Arc::new(PostgresLimitStore::new(database.get_pool().clone())))
        }
    }
}
