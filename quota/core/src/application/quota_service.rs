// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Quota Service
//!
//! Facade behind the `quota-sets` API. Composes the hierarchy resolver
//! (limits) and the reservation engine (counters). Limit overrides are
//! written here; usage counters are only ever changed by the engine.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::hierarchy_resolver::HierarchyResolver;
use crate::application::reservation_engine::ReservationEngine;
use crate::domain::events::QuotaEvent;
use crate::domain::quota::{
    validate_limit, ProjectId, QuotaDetail, QuotaError, QuotaKey, QuotaSet, QuotaSetDetail,
    ResourceKind, ShareTypeId, UserId, UNLIMITED,
};
use crate::domain::repository::LimitStore;
use crate::domain::reservation::ReservationId;
use crate::infrastructure::event_bus::EventBus;

const QUOTA_UPDATES_TOTAL: &str = "quotad_quota_updates_total";

// ============================================================================
// Service Trait
// ============================================================================

#[async_trait]
pub trait QuotaService: Send + Sync {
    /// Effective limits for every resource at the given scope
    async fn show(
        &self,
        project_id: &ProjectId,
        user_id: Option<UserId>,
        share_type: Option<ShareTypeId>,
    ) -> Result<QuotaSet, QuotaError>;

    /// Process-wide defaults, ignoring any override
    async fn show_defaults(&self, project_id: &ProjectId) -> Result<QuotaSet, QuotaError>;

    /// Effective limits plus the counters of the exact key
    async fn show_detail(
        &self,
        project_id: &ProjectId,
        user_id: Option<UserId>,
        share_type: Option<ShareTypeId>,
    ) -> Result<QuotaSetDetail, QuotaError>;

    /// Write overrides at the selected scope and return the new effective limits
    async fn update(
        &self,
        project_id: &ProjectId,
        updates: QuotaSet,
        user_id: Option<UserId>,
        share_type: Option<ShareTypeId>,
        force: bool,
    ) -> Result<QuotaSet, QuotaError>;

    /// Remove every override at the selected scope. No-op when there are none.
    async fn delete(
        &self,
        project_id: &ProjectId,
        user_id: Option<UserId>,
        share_type: Option<ShareTypeId>,
    ) -> Result<(), QuotaError>;

    /// Make a project known. Returns false if it already was.
    async fn register_project(&self, project_id: &ProjectId) -> Result<bool, QuotaError>;

    async fn reserve(
        &self,
        key: &QuotaKey,
        resource: ResourceKind,
        delta: i64,
    ) -> Result<ReservationId, QuotaError>;

    async fn reserve_batch(
        &self,
        key: &QuotaKey,
        deltas: &BTreeMap<ResourceKind, i64>,
    ) -> Result<Vec<ReservationId>, QuotaError>;

    async fn commit(&self, id: ReservationId) -> Result<(), QuotaError>;

    async fn rollback(&self, id: ReservationId) -> Result<(), QuotaError>;
}

// ============================================================================
// Standard Implementation
// ============================================================================

pub struct StandardQuotaService {
    store: Arc<dyn LimitStore>,
    resolver: Arc<HierarchyResolver>,
    engine: Arc<ReservationEngine>,
    event_bus: Arc<EventBus>,
}

impl StandardQuotaService {
    pub fn new(
        store: Arc<dyn LimitStore>,
        resolver: Arc<HierarchyResolver>,
        engine: Arc<ReservationEngine>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            resolver,
            engine,
            event_bus,
        }
    }

    pub fn engine(&self) -> &Arc<ReservationEngine> {
        &self.engine
    }

    /// Reject the whole update before anything is written.
    async fn validate_update(&self, key: &QuotaKey, updates: &QuotaSet, force: bool) -> Result<(), QuotaError> {
        for (&resource, &limit) in updates {
            validate_limit(resource, limit)?;

            if !resource.allowed_in(&key.scope) {
                return Err(QuotaError::InvalidScope(format!(
                    "{} cannot be limited per {}",
                    resource, key.scope
                )));
            }

            if key.scope.is_project() {
                if !force && limit != UNLIMITED {
                    self.check_scoped_overrides(key, resource, limit).await?;
                }
            } else {
                let project_limit = self.resolver.effective_limit(&key.project_key(), resource).await?;
                if project_limit != UNLIMITED && (limit == UNLIMITED || limit > project_limit) {
                    return Err(QuotaError::ExceedsProjectLimit {
                        resource,
                        limit,
                        project_limit,
                    });
                }
            }

            if limit == UNLIMITED {
                continue;
            }
            let usage = self.store.get_usage(key, resource).await?;
            if limit < usage.consumed() {
                if !force {
                    return Err(QuotaError::QuotaTooSmall {
                        resource,
                        limit,
                        in_use: usage.in_use,
                        reserved: usage.reserved,
                    });
                }
                warn!(
                    "Forcing {} limit for {} to {} below usage (in_use {}, reserved {})",
                    resource, key, limit, usage.in_use, usage.reserved
                );
            }
        }
        Ok(())
    }

    /// A project limit may not drop below an override it contains.
    async fn check_scoped_overrides(
        &self,
        key: &QuotaKey,
        resource: ResourceKind,
        limit: i64,
    ) -> Result<(), QuotaError> {
        let scoped = self.store.find_scoped_limits(&key.project_id, resource).await?;
        if let Some((scope, scoped_limit)) = scoped
            .into_iter()
            .find(|(_, scoped_limit)| *scoped_limit == UNLIMITED || *scoped_limit > limit)
        {
            debug!("Project {} limit {} is below the {} override {}", resource, limit, scope, scoped_limit);
            return Err(QuotaError::ExceedsProjectLimit {
                resource,
                limit: scoped_limit,
                project_limit: limit,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaService for StandardQuotaService {
    async fn show(
        &self,
        project_id: &ProjectId,
        user_id: Option<UserId>,
        share_type: Option<ShareTypeId>,
    ) -> Result<QuotaSet, QuotaError> {
        let key = QuotaKey::from_parts(project_id.clone(), user_id, share_type)?;
        debug!("Showing quotas for {}", key);
        self.resolver.effective_limits(&key).await
    }

    async fn show_defaults(&self, project_id: &ProjectId) -> Result<QuotaSet, QuotaError> {
        debug!("Showing default quotas for {}", project_id);
        Ok(self.resolver.defaults().to_quota_set())
    }

    async fn show_detail(
        &self,
        project_id: &ProjectId,
        user_id: Option<UserId>,
        share_type: Option<ShareTypeId>,
    ) -> Result<QuotaSetDetail, QuotaError> {
        let key = QuotaKey::from_parts(project_id.clone(), user_id, share_type)?;
        debug!("Showing quota detail for {}", key);

        let limits = self.resolver.effective_limits(&key).await?;
        let mut detail = QuotaSetDetail::new();
        for (resource, limit) in limits {
            let usage = self.store.get_usage(&key, resource).await?;
            detail.insert(
                resource,
                QuotaDetail {
                    limit,
                    in_use: usage.in_use,
                    reserved: usage.reserved,
                },
            );
        }
        Ok(detail)
    }

    async fn update(
        &self,
        project_id: &ProjectId,
        updates: QuotaSet,
        user_id: Option<UserId>,
        share_type: Option<ShareTypeId>,
        force: bool,
    ) -> Result<QuotaSet, QuotaError> {
        let key = QuotaKey::from_parts(project_id.clone(), user_id, share_type)?;
        self.resolver.ensure_project(&key.project_id).await?;

        info!("Updating {} quota limits for {} (force: {})", updates.len(), key, force);

        // Reservations resolve limits under the same pair locks, so none can
        // slip in between validation and the write. Project pairs go first.
        let resources: Vec<ResourceKind> = updates.keys().copied().collect();
        let _project_locks = if key.scope.is_project() {
            Vec::new()
        } else {
            self.engine.lock_pairs(&key.project_key(), resources.iter().copied()).await
        };
        let _locks = self.engine.lock_pairs(&key, resources).await;

        self.validate_update(&key, &updates, force).await?;

        let mut previous = BTreeMap::new();
        for &resource in updates.keys() {
            previous.insert(resource, self.resolver.effective_limit(&key, resource).await?);
        }
        self.store.set_limits(&key, &updates).await?;

        for (resource, new_limit) in updates {
            let old_limit = previous.get(&resource).copied().unwrap_or(new_limit);
            metrics::counter!(QUOTA_UPDATES_TOTAL).increment(1);
            self.event_bus.publish_quota_event(QuotaEvent::QuotaUpdated {
                key: key.clone(),
                resource,
                old_limit,
                new_limit,
                forced: force,
                updated_at: Utc::now(),
            });
            info!("{} limit for {} set to {} (was {})", resource, key, new_limit, old_limit);
        }

        self.resolver.effective_limits(&key).await
    }

    async fn delete(
        &self,
        project_id: &ProjectId,
        user_id: Option<UserId>,
        share_type: Option<ShareTypeId>,
    ) -> Result<(), QuotaError> {
        let key = QuotaKey::from_parts(project_id.clone(), user_id, share_type)?;
        self.resolver.ensure_project(&key.project_id).await?;

        let removed = self.store.delete_limits(&key).await?;
        if removed == 0 {
            debug!("No quota overrides to delete for {}", key);
            return Ok(());
        }

        info!("Deleted {} quota overrides for {}", removed, key);
        self.event_bus.publish_quota_event(QuotaEvent::QuotaDeleted {
            key,
            overrides_removed: removed,
            deleted_at: Utc::now(),
        });
        Ok(())
    }

    async fn register_project(&self, project_id: &ProjectId) -> Result<bool, QuotaError> {
        let created = self.store.register_project(project_id).await?;
        if created {
            info!("Registered project {}", project_id);
            self.event_bus.publish_quota_event(QuotaEvent::ProjectRegistered {
                key: QuotaKey::project(project_id.clone()),
                registered_at: Utc::now(),
            });
        }
        Ok(created)
    }

    async fn reserve(
        &self,
        key: &QuotaKey,
        resource: ResourceKind,
        delta: i64,
    ) -> Result<ReservationId, QuotaError> {
        self.engine.reserve(key, resource, delta).await
    }

    async fn reserve_batch(
        &self,
        key: &QuotaKey,
        deltas: &BTreeMap<ResourceKind, i64>,
    ) -> Result<Vec<ReservationId>, QuotaError> {
        self.engine.reserve_batch(key, deltas).await
    }

    async fn commit(&self, id: ReservationId) -> Result<(), QuotaError> {
        self.engine.commit(id).await
    }

    async fn rollback(&self, id: ReservationId) -> Result<(), QuotaError> {
        self.engine.rollback(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::quota_config::{DefaultLimits, ReservationConfig};
    use crate::infrastructure::repositories::InMemoryLimitStore;

    fn create_test_service() -> StandardQuotaService {
        let store: Arc<dyn LimitStore> = Arc::new(InMemoryLimitStore::new());
        let event_bus = Arc::new(EventBus::new(64));
        let resolver = Arc::new(HierarchyResolver::new(store.clone(), DefaultLimits::default()));
        let engine = Arc::new(ReservationEngine::new(
            store.clone(),
            resolver.clone(),
            event_bus.clone(),
            &ReservationConfig::default(),
        ));
        StandardQuotaService::new(store, resolver, engine, event_bus)
    }

    async fn registered() -> (StandardQuotaService, ProjectId) {
        let service = create_test_service();
        let project = ProjectId::new("p1").unwrap();
        assert!(service.register_project(&project).await.unwrap());
        (service, project)
    }

    fn user(id: &str) -> Option<UserId> {
        Some(UserId(id.to_string()))
    }

    #[tokio::test]
    async fn test_show_returns_every_resource() {
        let (service, project) = registered().await;
        let limits = service.show(&project, None, None).await.unwrap();
        assert_eq!(limits, DefaultLimits::default().to_quota_set());
    }

    #[tokio::test]
    async fn test_show_defaults_ignores_overrides() {
        let (service, project) = registered().await;
        service
            .update(&project, QuotaSet::from([(ResourceKind::Shares, 5)]), None, None, false)
            .await
            .unwrap();

        let defaults = service.show_defaults(&project).await.unwrap();
        assert_eq!(defaults[&ResourceKind::Shares], 50);
        let current = service.show(&project, None, None).await.unwrap();
        assert_eq!(current[&ResourceKind::Shares], 5);
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let service = create_test_service();
        let ghost = ProjectId::new("ghost").unwrap();
        assert!(matches!(
            service.show(&ghost, None, None).await.unwrap_err(),
            QuotaError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_user_and_share_type_together_rejected() {
        let (service, project) = registered().await;
        let err = service
            .show(&project, user("u1"), Some(ShareTypeId("gold".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::InvalidScope(_)));
    }

    #[tokio::test]
    async fn test_delete_falls_through_to_project() {
        let (service, project) = registered().await;
        service
            .update(&project, QuotaSet::from([(ResourceKind::Shares, 5)]), None, None, false)
            .await
            .unwrap();
        let limits = service
            .update(&project, QuotaSet::from([(ResourceKind::Shares, 3)]), user("u1"), None, false)
            .await
            .unwrap();
        assert_eq!(limits[&ResourceKind::Shares], 3);

        service.delete(&project, user("u1"), None).await.unwrap();
        let limits = service.show(&project, user("u1"), None).await.unwrap();
        assert_eq!(limits[&ResourceKind::Shares], 5);

        // Nothing left at that scope
        service.delete(&project, user("u1"), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_validates_before_writing() {
        let (service, project) = registered().await;
        let updates = QuotaSet::from([(ResourceKind::Shares, 7), (ResourceKind::Gigabytes, -2)]);
        let err = service.update(&project, updates, None, None, false).await.unwrap_err();
        assert!(matches!(err, QuotaError::InvalidLimit { limit: -2, .. }));

        let limits = service.show(&project, None, None).await.unwrap();
        assert_eq!(limits[&ResourceKind::Shares], 50);
    }

    #[tokio::test]
    async fn test_scoped_override_cannot_exceed_project() {
        let (service, project) = registered().await;
        service
            .update(&project, QuotaSet::from([(ResourceKind::Shares, 5)]), None, None, false)
            .await
            .unwrap();

        let err = service
            .update(&project, QuotaSet::from([(ResourceKind::Shares, 6)]), user("u1"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::ExceedsProjectLimit { project_limit: 5, .. }));

        let err = service
            .update(&project, QuotaSet::from([(ResourceKind::Shares, UNLIMITED)]), user("u1"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::ExceedsProjectLimit { .. }));
    }

    #[tokio::test]
    async fn test_project_limit_cannot_drop_below_override() {
        let (service, project) = registered().await;
        service
            .update(&project, QuotaSet::from([(ResourceKind::Shares, 4)]), user("u1"), None, false)
            .await
            .unwrap();

        let err = service
            .update(&project, QuotaSet::from([(ResourceKind::Shares, 3)]), None, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::ExceedsProjectLimit { limit: 4, project_limit: 3, .. }));

        service
            .update(&project, QuotaSet::from([(ResourceKind::Shares, 3)]), None, None, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_share_networks_not_per_share_type() {
        let (service, project) = registered().await;
        let err = service
            .update(
                &project,
                QuotaSet::from([(ResourceKind::ShareNetworks, 1)]),
                None,
                Some(ShareTypeId("gold".into())),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::InvalidScope(_)));
    }

    #[tokio::test]
    async fn test_show_detail_counters_for_exact_key() {
        let (service, project) = registered().await;
        let key = QuotaKey::project(project.clone());
        let id = service.reserve(&key, ResourceKind::Gigabytes, 10).await.unwrap();
        service.reserve(&key, ResourceKind::Gigabytes, 5).await.unwrap();
        service.commit(id).await.unwrap();

        let detail = service.show_detail(&project, None, None).await.unwrap();
        assert_eq!(
            detail[&ResourceKind::Gigabytes],
            QuotaDetail { limit: 1000, in_use: 10, reserved: 5 }
        );

        let user_detail = service.show_detail(&project, user("u1"), None).await.unwrap();
        assert_eq!(user_detail[&ResourceKind::Gigabytes].reserved, 0);
    }

    #[tokio::test]
    async fn test_publishes_quota_events() {
        let (service, project) = registered().await;
        let mut receiver = service.event_bus.subscribe();

        service
            .update(&project, QuotaSet::from([(ResourceKind::Snapshots, 9)]), None, None, false)
            .await
            .unwrap();

        match receiver.recv().await.unwrap() {
            crate::infrastructure::event_bus::DomainEvent::Quota(QuotaEvent::QuotaUpdated {
                old_limit,
                new_limit,
                ..
            }) => {
                assert_eq!(old_limit, 50);
                assert_eq!(new_limit, 9);
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scoped_update_releases_pair_locks() {
        let (service, project) = registered().await;
        let updates = QuotaSet::from([(ResourceKind::Shares, 4), (ResourceKind::Gigabytes, 40)]);
        service.update(&project, updates.clone(), None, None, false).await.unwrap();
        service.update(&project, updates, user("u1"), None, false).await.unwrap();

        // Rejected updates release their locks too
        let err = service
            .update(&project, QuotaSet::from([(ResourceKind::Shares, 9)]), user("u1"), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::ExceedsProjectLimit { .. }));
        assert_eq!(service.engine().active_locks(), 0);

        let key = QuotaKey::user(project.clone(), UserId("u1".into()));
        service.reserve(&key, ResourceKind::Shares, 4).await.unwrap();
        assert_eq!(service.engine().active_locks(), 0);
    }
}
