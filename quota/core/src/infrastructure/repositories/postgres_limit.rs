// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Postgres Limit Store
//!
//! Durable `LimitStore` backed by the schema in `quota/core/migrations`.
//! Scopes are flattened into `(scope_type, scope_id)` columns, with an empty
//! `scope_id` for project-level rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use std::collections::BTreeMap;
use uuid::Uuid;
use crate::domain::quota::{ProjectId, QuotaKey, QuotaSet, QuotaUsage, ResourceKind, Scope, ShareTypeId, UserId};
use crate::domain::repository::{LimitStore, RepositoryError};
use crate::domain::reservation::{Reservation, ReservationId, ReservationState};

pub struct PostgresLimitStore {
    pool: PgPool,
}

impl PostgresLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn scope_columns(scope: &Scope) -> (&'static str, &str) {
    match scope {
        Scope::Project => ("project", ""),
        Scope::User(user) => ("user", user.0.as_str()),
        Scope::ShareType(share_type) => ("share_type", share_type.0.as_str()),
    }
}

fn parse_scope(scope_type: &str, scope_id: String) -> Result<Scope, RepositoryError> {
    match scope_type {
        "project" => Ok(Scope::Project),
        "user" => Ok(Scope::User(UserId(scope_id))),
        "share_type" => Ok(Scope::ShareType(ShareTypeId(scope_id))),
        other => Err(RepositoryError::Serialization(format!("Unknown scope type: {}", other))),
    }
}

fn parse_resource(resource: &str) -> Result<ResourceKind, RepositoryError> {
    resource
        .parse()
        .map_err(|_| RepositoryError::Serialization(format!("Unknown resource: {}", resource)))
}

fn to_version(version: u64) -> Result<i64, RepositoryError> {
    i64::try_from(version)
        .map_err(|_| RepositoryError::Serialization(format!("Counter version {} out of range", version)))
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Conditional counter write. Version 0 means no row has been written yet.
fn usage_cas<'q>(
    key: &'q QuotaKey,
    resource: ResourceKind,
    expected_version: u64,
    next: QuotaUsage,
) -> Result<PgQuery<'q>, RepositoryError> {
    let (scope_type, scope_id) = scope_columns(&key.scope);
    let query = if expected_version == 0 {
        sqlx::query(
            r#"
            INSERT INTO quota_usages (project_id, scope_type, scope_id, resource, in_use, reserved, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (project_id, scope_type, scope_id, resource) DO NOTHING
            "#,
        )
        .bind(key.project_id.as_str())
        .bind(scope_type)
        .bind(scope_id)
        .bind(resource.as_str())
        .bind(next.in_use)
        .bind(next.reserved)
        .bind(to_version(next.version)?)
    } else {
        sqlx::query(
            r#"
            UPDATE quota_usages
            SET in_use = $5, reserved = $6, version = $7, updated_at = now()
            WHERE project_id = $1 AND scope_type = $2 AND scope_id = $3 AND resource = $4
              AND version = $8
            "#,
        )
        .bind(key.project_id.as_str())
        .bind(scope_type)
        .bind(scope_id)
        .bind(resource.as_str())
        .bind(next.in_use)
        .bind(next.reserved)
        .bind(to_version(next.version)?)
        .bind(to_version(expected_version)?)
    };
    Ok(query)
}

fn reservation_upsert(reservation: &Reservation) -> PgQuery<'_> {
    let (scope_type, scope_id) = scope_columns(&reservation.key.scope);
    sqlx::query(
        r#"
        INSERT INTO quota_reservations (
            id, project_id, scope_type, scope_id, resource, delta, state, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state
        "#,
    )
    .bind(reservation.id.0)
    .bind(reservation.key.project_id.as_str())
    .bind(scope_type)
    .bind(scope_id)
    .bind(reservation.resource.as_str())
    .bind(reservation.delta)
    .bind(reservation.state.as_str())
    .bind(reservation.created_at)
}

fn limit_upsert(key: &QuotaKey, resource: ResourceKind, limit: i64) -> PgQuery<'_> {
    let (scope_type, scope_id) = scope_columns(&key.scope);
    sqlx::query(
        r#"
        INSERT INTO quota_limits (project_id, scope_type, scope_id, resource, hard_limit, updated_at)
        VALUES ($1, $2, $3, $4, $5, now())
        ON CONFLICT (project_id, scope_type, scope_id, resource) DO UPDATE SET
            hard_limit = EXCLUDED.hard_limit,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(key.project_id.as_str())
    .bind(scope_type)
    .bind(scope_id)
    .bind(resource.as_str())
    .bind(limit)
}

fn parse_reservation_row(row: PgRow) -> Result<Reservation, RepositoryError> {
    let id: Uuid = row.try_get("id")?;
    let project_id: String = row.try_get("project_id")?;
    let scope_type: String = row.try_get("scope_type")?;
    let scope_id: String = row.try_get("scope_id")?;
    let resource: String = row.try_get("resource")?;
    let state: String = row.try_get("state")?;

    Ok(Reservation {
        id: ReservationId(id),
        key: QuotaKey {
            project_id: ProjectId(project_id),
            scope: parse_scope(&scope_type, scope_id)?,
        },
        resource: parse_resource(&resource)?,
        delta: row.try_get("delta")?,
        state: state
            .parse::<ReservationState>()
            .map_err(RepositoryError::Serialization)?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl LimitStore for PostgresLimitStore {
    async fn register_project(&self, project_id: &ProjectId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO quota_projects (project_id) VALUES ($1) ON CONFLICT (project_id) DO NOTHING",
        )
        .bind(project_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to register project: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn project_exists(&self, project_id: &ProjectId) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM quota_projects WHERE project_id = $1")
            .bind(project_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_limit(&self, key: &QuotaKey, resource: ResourceKind) -> Result<Option<i64>, RepositoryError> {
        let (scope_type, scope_id) = scope_columns(&key.scope);
        let row = sqlx::query(
            r#"
            SELECT hard_limit FROM quota_limits
            WHERE project_id = $1 AND scope_type = $2 AND scope_id = $3 AND resource = $4
            "#,
        )
        .bind(key.project_id.as_str())
        .bind(scope_type)
        .bind(scope_id)
        .bind(resource.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_get::<i64, _>("hard_limit"))
            .transpose()
            .map_err(RepositoryError::from)
    }

    async fn get_limits(&self, key: &QuotaKey) -> Result<BTreeMap<ResourceKind, i64>, RepositoryError> {
        let (scope_type, scope_id) = scope_columns(&key.scope);
        let rows = sqlx::query(
            r#"
            SELECT resource, hard_limit FROM quota_limits
            WHERE project_id = $1 AND scope_type = $2 AND scope_id = $3
            "#,
        )
        .bind(key.project_id.as_str())
        .bind(scope_type)
        .bind(scope_id)
        .fetch_all(&self.pool)
        .await?;

        let mut limits = BTreeMap::new();
        for row in rows {
            let resource: String = row.try_get("resource")?;
            limits.insert(parse_resource(&resource)?, row.try_get("hard_limit")?);
        }
        Ok(limits)
    }

    async fn find_scoped_limits(
        &self,
        project_id: &ProjectId,
        resource: ResourceKind,
    ) -> Result<Vec<(Scope, i64)>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT scope_type, scope_id, hard_limit FROM quota_limits
            WHERE project_id = $1 AND resource = $2 AND scope_type <> 'project'
            "#,
        )
        .bind(project_id.as_str())
        .bind(resource.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut scoped = Vec::with_capacity(rows.len());
        for row in rows {
            let scope_type: String = row.try_get("scope_type")?;
            let scope = parse_scope(&scope_type, row.try_get("scope_id")?)?;
            scoped.push((scope, row.try_get("hard_limit")?));
        }
        Ok(scoped)
    }

    async fn set_limits(&self, key: &QuotaKey, limits: &QuotaSet) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        for (resource, limit) in limits {
            limit_upsert(key, *resource, *limit)
                .execute(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Database(format!("Failed to save quota limit: {}", e)))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_limits(&self, key: &QuotaKey) -> Result<usize, RepositoryError> {
        let (scope_type, scope_id) = scope_columns(&key.scope);
        let result = sqlx::query(
            "DELETE FROM quota_limits WHERE project_id = $1 AND scope_type = $2 AND scope_id = $3",
        )
        .bind(key.project_id.as_str())
        .bind(scope_type)
        .bind(scope_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn get_usage(&self, key: &QuotaKey, resource: ResourceKind) -> Result<QuotaUsage, RepositoryError> {
        let (scope_type, scope_id) = scope_columns(&key.scope);
        let row = sqlx::query(
            r#"
            SELECT in_use, reserved, version FROM quota_usages
            WHERE project_id = $1 AND scope_type = $2 AND scope_id = $3 AND resource = $4
            "#,
        )
        .bind(key.project_id.as_str())
        .bind(scope_type)
        .bind(scope_id)
        .bind(resource.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let version: i64 = row.try_get("version")?;
                Ok(QuotaUsage {
                    in_use: row.try_get("in_use")?,
                    reserved: row.try_get("reserved")?,
                    version: version as u64,
                })
            }
            None => Ok(QuotaUsage::default()),
        }
    }

    async fn compare_and_swap_usage(
        &self,
        key: &QuotaKey,
        resource: ResourceKind,
        expected_version: u64,
        next: QuotaUsage,
    ) -> Result<bool, RepositoryError> {
        let result = usage_cas(key, resource, expected_version, next)?
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to update quota usage: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_reservation(&self, reservation: &Reservation) -> Result<(), RepositoryError> {
        reservation_upsert(reservation)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to save reservation: {}", e)))?;

        Ok(())
    }

    async fn finish_reservation(
        &self,
        reservation: &Reservation,
        expected_version: u64,
        next: QuotaUsage,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let swapped = usage_cas(&reservation.key, reservation.resource, expected_version, next)?
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to update quota usage: {}", e)))?;
        if swapped.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        reservation_upsert(reservation)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to save reservation: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to finish reservation: {}", e)))?;
        Ok(true)
    }

    async fn find_reservation(&self, id: ReservationId) -> Result<Option<Reservation>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, scope_type, scope_id, resource, delta, state, created_at
            FROM quota_reservations
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_reservation_row).transpose()
    }

    async fn find_stale_reservations(&self, cutoff: DateTime<Utc>) -> Result<Vec<Reservation>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, scope_type, scope_id, resource, delta, state, created_at
            FROM quota_reservations
            WHERE state = 'held' AND created_at < $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_reservation_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_columns_roundtrip() {
        let scopes = [
            Scope::Project,
            Scope::User(UserId("u1".into())),
            Scope::ShareType(ShareTypeId("gold".into())),
        ];
        for scope in scopes {
            let (scope_type, scope_id) = scope_columns(&scope);
            assert_eq!(parse_scope(scope_type, scope_id.to_string()).unwrap(), scope);
        }
        assert!(parse_scope("group", String::new()).is_err());
    }

    #[test]
    fn test_version_range() {
        assert_eq!(to_version(7).unwrap(), 7);
        assert!(to_version(u64::MAX).is_err());
    }
}
