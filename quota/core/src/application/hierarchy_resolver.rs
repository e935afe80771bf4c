// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Hierarchy Resolver
//!
//! Computes the effective limit for a quota key by reading the scoped and
//! project overrides from the `LimitStore` and folding them over the
//! process-wide defaults with `LimitLayers`. Reads limits only, never counters.

use std::sync::Arc;
use tracing::debug;

use crate::domain::hierarchy::{LimitLayers, LimitSource};
use crate::domain::quota::{ProjectId, QuotaError, QuotaKey, QuotaSet, ResourceKind};
use crate::domain::quota_config::DefaultLimits;
use crate::domain::repository::LimitStore;

pub struct HierarchyResolver {
    store: Arc<dyn LimitStore>,
    defaults: DefaultLimits,
}

impl HierarchyResolver {
    pub fn new(store: Arc<dyn LimitStore>, defaults: DefaultLimits) -> Self {
        Self { store, defaults }
    }

    pub fn defaults(&self) -> &DefaultLimits {
        &self.defaults
    }

    /// Fail with `NotFound` unless the project is registered.
    pub async fn ensure_project(&self, project_id: &ProjectId) -> Result<(), QuotaError> {
        if self.store.project_exists(project_id).await? {
            Ok(())
        } else {
            Err(QuotaError::NotFound(format!("project {}", project_id)))
        }
    }

    /// Effective limit and the layer it came from.
    pub async fn resolve(
        &self,
        key: &QuotaKey,
        resource: ResourceKind,
    ) -> Result<(i64, LimitSource), QuotaError> {
        self.ensure_project(&key.project_id).await?;

        let scoped = if key.scope.is_project() {
            None
        } else {
            self.store.get_limit(key, resource).await?
        };
        let project = self.store.get_limit(&key.project_key(), resource).await?;

        let layers = LimitLayers::for_scope(&key.scope, scoped, project, self.defaults.get(resource));
        let (limit, source) = layers.resolve();
        debug!("Effective {} limit for {} is {} ({:?})", resource, key, limit, source);
        Ok((limit, source))
    }

    pub async fn effective_limit(&self, key: &QuotaKey, resource: ResourceKind) -> Result<i64, QuotaError> {
        Ok(self.resolve(key, resource).await?.0)
    }

    /// Effective limits for every resource kind, reading each override layer once.
    pub async fn effective_limits(&self, key: &QuotaKey) -> Result<QuotaSet, QuotaError> {
        self.ensure_project(&key.project_id).await?;

        let scoped = if key.scope.is_project() {
            QuotaSet::new()
        } else {
            self.store.get_limits(key).await?
        };
        let project = self.store.get_limits(&key.project_key()).await?;

        Ok(ResourceKind::ALL
            .into_iter()
            .map(|resource| {
                let layers = LimitLayers::for_scope(
                    &key.scope,
                    scoped.get(&resource).copied(),
                    project.get(&resource).copied(),
                    self.defaults.get(resource),
                );
                (resource, layers.effective())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::quota::{ShareTypeId, UserId, UNLIMITED};
    use crate::infrastructure::repositories::InMemoryLimitStore;

    async fn setup() -> (HierarchyResolver, Arc<InMemoryLimitStore>, ProjectId) {
        let store = Arc::new(InMemoryLimitStore::new());
        let project = ProjectId::new("p1").unwrap();
        store.register_project(&project).await.unwrap();
        let resolver = HierarchyResolver::new(store.clone(), DefaultLimits::default());
        (resolver, store, project)
    }

    #[tokio::test]
    async fn test_defaults_fill_gaps() {
        let (resolver, _store, project) = setup().await;
        let limits = resolver.effective_limits(&QuotaKey::project(project)).await.unwrap();
        assert_eq!(limits.len(), ResourceKind::ALL.len());
        assert_eq!(limits[&ResourceKind::Shares], 50);
        assert_eq!(limits[&ResourceKind::Gigabytes], 1000);
        assert_eq!(limits[&ResourceKind::ShareNetworks], 10);
    }

    #[tokio::test]
    async fn test_precedence_user_over_project() {
        let (resolver, store, project) = setup().await;
        let project_key = QuotaKey::project(project.clone());
        let user_key = QuotaKey::user(project.clone(), UserId("u1".into()));

        store.set_limit(&project_key, ResourceKind::Shares, 5).await.unwrap();
        store.set_limit(&user_key, ResourceKind::Shares, 3).await.unwrap();

        assert_eq!(
            resolver.resolve(&user_key, ResourceKind::Shares).await.unwrap(),
            (3, LimitSource::Scoped)
        );
        assert_eq!(
            resolver.resolve(&project_key, ResourceKind::Shares).await.unwrap(),
            (5, LimitSource::Project)
        );

        // Another user only sees the project override
        let other = QuotaKey::user(project, UserId("u2".into()));
        assert_eq!(resolver.effective_limit(&other, ResourceKind::Shares).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_share_type_override_and_unlimited() {
        let (resolver, store, project) = setup().await;
        let st_key = QuotaKey::share_type(project, ShareTypeId("gold".into()));
        store.set_limit(&st_key, ResourceKind::Gigabytes, UNLIMITED).await.unwrap();

        let limits = resolver.effective_limits(&st_key).await.unwrap();
        assert_eq!(limits[&ResourceKind::Gigabytes], UNLIMITED);
        assert_eq!(limits[&ResourceKind::Shares], 50);
    }

    #[tokio::test]
    async fn test_unknown_project_not_found() {
        let (resolver, _store, _project) = setup().await;
        let key = QuotaKey::project(ProjectId::new("ghost").unwrap());
        let err = resolver.effective_limit(&key, ResourceKind::Shares).await.unwrap_err();
        assert!(matches!(err, QuotaError::NotFound(_)));
    }
}
