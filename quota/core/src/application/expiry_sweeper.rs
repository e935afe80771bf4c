// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Expiry Sweeper - background reclamation of abandoned reservations
//!
//! Callers are expected to pair every reservation with a commit or a
//! rollback. This task is the backstop for the ones that crash in between.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::application::reservation_engine::ReservationEngine;
use crate::domain::quota::QuotaError;
use crate::domain::quota_config::ReservationConfig;

pub struct ExpirySweeper {
    engine: Arc<ReservationEngine>,
    expire: chrono::Duration,
    sweep_interval: Duration,
    shutdown_token: CancellationToken,
}

impl ExpirySweeper {
    pub fn new(engine: Arc<ReservationEngine>, config: &ReservationConfig) -> Self {
        Self {
            engine,
            expire: chrono::Duration::from_std(config.expire).unwrap_or_else(|_| chrono::Duration::hours(24)),
            sweep_interval: config.sweep_interval,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Handle used to stop the sweeper
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            sweep_interval = ?self.sweep_interval,
            expire_seconds = self.expire.num_seconds(),
            "Starting reservation expiry sweeper"
        );

        let mut tick = interval(self.sweep_interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    debug!("Running reservation expiry sweep");
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(expired) => info!(expired, "Reservation expiry sweep completed"),
                        Err(e) => error!("Reservation expiry sweep failed: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping reservation expiry sweeper");
                    break;
                }
            }
        }
    }

    /// One sweep over held reservations older than the configured expiry.
    pub async fn sweep_once(&self) -> Result<usize, QuotaError> {
        self.engine.expire_stale(self.expire).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::hierarchy_resolver::HierarchyResolver;
    use crate::domain::quota::{ProjectId, QuotaKey, ResourceKind};
    use crate::domain::quota_config::DefaultLimits;
    use crate::domain::repository::LimitStore;
    use crate::domain::reservation::ReservationState;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::repositories::InMemoryLimitStore;

    fn config() -> ReservationConfig {
        ReservationConfig {
            expire: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(20),
            max_cas_retries: 4,
        }
    }

    async fn setup() -> (Arc<ReservationEngine>, Arc<InMemoryLimitStore>, QuotaKey) {
        let store = Arc::new(InMemoryLimitStore::new());
        let project = ProjectId::new("p1").unwrap();
        store.register_project(&project).await.unwrap();
        let resolver = Arc::new(HierarchyResolver::new(store.clone(), DefaultLimits::default()));
        let engine = Arc::new(ReservationEngine::new(
            store.clone(),
            resolver,
            Arc::new(EventBus::new(16)),
            &config(),
        ));
        (engine, store, QuotaKey::project(project))
    }

    #[tokio::test]
    async fn test_sweep_once_reclaims_old_holds() {
        let (engine, store, key) = setup().await;
        let id = engine.reserve(&key, ResourceKind::Shares, 2).await.unwrap();

        let mut reservation = store.find_reservation(id).await.unwrap().unwrap();
        reservation.created_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        store.save_reservation(&reservation).await.unwrap();

        let sweeper = ExpirySweeper::new(engine.clone(), &config());
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        assert_eq!(engine.get_reservation(id).await.unwrap().state, ReservationState::RolledBack);
        assert_eq!(store.get_usage(&key, ResourceKind::Shares).await.unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let (engine, _store, _key) = setup().await;
        let sweeper = Arc::new(ExpirySweeper::new(engine, &config()));
        let token = sweeper.shutdown_token();

        let handle = sweeper.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
