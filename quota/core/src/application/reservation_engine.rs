// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Reservation Engine
//!
//! Two-phase usage accounting against hierarchical limits:
//! `reserve` holds capacity in the `reserved` counter, `commit` moves the
//! hold into `in_use`, `rollback` releases it and `expire_stale` reclaims
//! holds whose caller never came back.
//!
//! Counter writes for one (key, resource) pair are linearizable. In-process
//! writers serialize on a per-pair async mutex taken from a sharded map, and
//! every write is a compare-and-swap on the counter version so that other
//! processes sharing the same store cannot interleave a read-modify-write.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::application::hierarchy_resolver::HierarchyResolver;
use crate::domain::events::ReservationEvent;
use crate::domain::quota::{QuotaError, QuotaKey, QuotaUsage, ResourceKind, UNLIMITED};
use crate::domain::quota_config::ReservationConfig;
use crate::domain::repository::LimitStore;
use crate::domain::reservation::{Reservation, ReservationId, Transition};
use crate::infrastructure::event_bus::EventBus;

const RESERVATIONS_TOTAL: &str = "quotad_reservations_total";
const RESERVATIONS_EXPIRED_TOTAL: &str = "quotad_reservations_expired_total";

type LockKey = (QuotaKey, ResourceKind);
type LockMap = DashMap<LockKey, Arc<Mutex<()>>>;

/// Exclusive hold on one (key, resource) counter pair.
///
/// The map entry is dropped with the last holder so idle keys cost nothing.
pub struct PairLock<'a> {
    locks: &'a LockMap,
    pair: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PairLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone of the Arc, so a count of one means nobody is queued
        self.locks
            .remove_if(&self.pair, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Terminal action applied to a held reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Commit,
    Rollback,
    Expire,
}

impl Finish {
    fn outcome(&self) -> &'static str {
        match self {
            Finish::Commit => "committed",
            Finish::Rollback => "rolled_back",
            Finish::Expire => "expired",
        }
    }
}

pub struct ReservationEngine {
    store: Arc<dyn LimitStore>,
    resolver: Arc<HierarchyResolver>,
    event_bus: Arc<EventBus>,
    locks: LockMap,
    max_cas_retries: u32,
}

impl ReservationEngine {
    pub fn new(
        store: Arc<dyn LimitStore>,
        resolver: Arc<HierarchyResolver>,
        event_bus: Arc<EventBus>,
        config: &ReservationConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            event_bus,
            locks: DashMap::new(),
            max_cas_retries: config.max_cas_retries.max(1),
        }
    }

    /// Reserve `delta` units of `resource` for `key`.
    ///
    /// A positive delta must fit under the effective limit. A negative delta
    /// is an explicit decrease: it holds nothing and only lowers `in_use`
    /// once committed.
    pub async fn reserve(
        &self,
        key: &QuotaKey,
        resource: ResourceKind,
        delta: i64,
    ) -> Result<ReservationId, QuotaError> {
        let ids = self.reserve_all(key, vec![(resource, delta)]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| QuotaError::InvalidDelta("no reservation created".to_string()))
    }

    /// Reserve several resources for one key, all or nothing.
    ///
    /// Locks are taken in resource order so overlapping batches cannot deadlock.
    pub async fn reserve_batch(
        &self,
        key: &QuotaKey,
        deltas: &BTreeMap<ResourceKind, i64>,
    ) -> Result<Vec<ReservationId>, QuotaError> {
        self.reserve_all(key, deltas.iter().map(|(r, d)| (*r, *d)).collect())
            .await
    }

    /// Like `reserve`, but returns a guard that rolls back when dropped unfinished.
    pub async fn reserve_guarded(
        self: &Arc<Self>,
        key: &QuotaKey,
        resource: ResourceKind,
        delta: i64,
    ) -> Result<ReservationGuard, QuotaError> {
        let id = self.reserve(key, resource, delta).await?;
        Ok(ReservationGuard {
            engine: Arc::clone(self),
            id,
            finished: false,
        })
    }

    /// Move the hold into `in_use`. Committing twice is a no-op.
    pub async fn commit(&self, id: ReservationId) -> Result<(), QuotaError> {
        self.finish(id, Finish::Commit).await.map(|_| ())
    }

    /// Release the hold. Rolling back twice is a no-op.
    pub async fn rollback(&self, id: ReservationId) -> Result<(), QuotaError> {
        self.finish(id, Finish::Rollback).await.map(|_| ())
    }

    pub async fn get_reservation(&self, id: ReservationId) -> Result<Reservation, QuotaError> {
        self.store
            .find_reservation(id)
            .await?
            .ok_or_else(|| QuotaError::NotFound(format!("reservation {}", id)))
    }

    /// Roll back every held reservation created more than `older_than` ago.
    ///
    /// Failures are logged and left for the next sweep. Returns the number
    /// of reservations reclaimed.
    pub async fn expire_stale(&self, older_than: Duration) -> Result<usize, QuotaError> {
        let cutoff = Utc::now() - older_than;
        let stale = self.store.find_stale_reservations(cutoff).await?;

        if stale.is_empty() {
            debug!("No stale reservations older than {}", cutoff);
            return Ok(0);
        }

        info!("Found {} stale reservations held since before {}", stale.len(), cutoff);

        let mut expired = 0;
        for reservation in stale {
            match self.finish(reservation.id, Finish::Expire).await {
                Ok(Transition::Applied) => expired += 1,
                Ok(Transition::AlreadyDone) => {
                    debug!("Reservation {} finished before it could expire", reservation.id);
                }
                Err(e) => {
                    warn!("Failed to expire reservation {}: {}", reservation.id, e);
                }
            }
        }

        info!("Expired {} stale reservations", expired);
        Ok(expired)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn lock(&self, key: &QuotaKey, resource: ResourceKind) -> PairLock<'_> {
        let pair = (key.clone(), resource);
        let lock = self.locks.entry(pair.clone()).or_default().value().clone();
        let guard = lock.lock_owned().await;
        PairLock {
            locks: &self.locks,
            pair,
            guard: Some(guard),
        }
    }

    /// Lock the counter pairs of `key` for `resources`, in resource order.
    ///
    /// While held, no reservation against those pairs can start or finish.
    pub async fn lock_pairs(
        &self,
        key: &QuotaKey,
        resources: impl IntoIterator<Item = ResourceKind>,
    ) -> Vec<PairLock<'_>> {
        let mut resources: Vec<ResourceKind> = resources.into_iter().collect();
        resources.sort();
        resources.dedup();

        let mut guards = Vec::with_capacity(resources.len());
        for resource in resources {
            guards.push(self.lock(key, resource).await);
        }
        guards
    }

    /// Number of counter pairs currently locked or waited on
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// Read-modify-write of one counter pair with bounded CAS retries.
    async fn update_usage<F>(
        &self,
        key: &QuotaKey,
        resource: ResourceKind,
        next: F,
    ) -> Result<QuotaUsage, QuotaError>
    where
        F: Fn(&QuotaUsage) -> Result<QuotaUsage, QuotaError> + Send + Sync,
    {
        self.write_usage(key, resource, None, next).await
    }

    /// CAS loop shared by holds and terminal transitions. With `finished`
    /// set, the reservation's new state is stored in the same write.
    async fn write_usage<F>(
        &self,
        key: &QuotaKey,
        resource: ResourceKind,
        finished: Option<&Reservation>,
        next: F,
    ) -> Result<QuotaUsage, QuotaError>
    where
        F: Fn(&QuotaUsage) -> Result<QuotaUsage, QuotaError> + Send + Sync,
    {
        for attempt in 1..=self.max_cas_retries {
            let current = self.store.get_usage(key, resource).await?;
            let updated = next(&current)?;
            let swapped = match finished {
                Some(reservation) => {
                    self.store
                        .finish_reservation(reservation, current.version, updated)
                        .await?
                }
                None => {
                    self.store
                        .compare_and_swap_usage(key, resource, current.version, updated)
                        .await?
                }
            };
            if swapped {
                return Ok(updated);
            }
            debug!(
                "Counter version {} for {} {} changed underneath us (attempt {})",
                current.version, key, resource, attempt
            );
        }

        warn!("Giving up on {} {} after {} CAS attempts", key, resource, self.max_cas_retries);
        Err(QuotaError::ConcurrentModification {
            attempts: self.max_cas_retries,
        })
    }

    async fn reserve_all(
        &self,
        key: &QuotaKey,
        mut deltas: Vec<(ResourceKind, i64)>,
    ) -> Result<Vec<ReservationId>, QuotaError> {
        if deltas.is_empty() {
            return Err(QuotaError::InvalidDelta("no resources requested".to_string()));
        }
        deltas.sort_by_key(|(resource, _)| *resource);
        deltas.dedup_by_key(|(resource, _)| *resource);

        let mut pending = Vec::with_capacity(deltas.len());
        for (resource, delta) in deltas {
            if !resource.allowed_in(&key.scope) {
                return Err(QuotaError::InvalidScope(format!(
                    "{} cannot be reserved under {}",
                    resource, key.scope
                )));
            }
            pending.push(Reservation::new(key.clone(), resource, delta)?);
        }

        let _guards = self.lock_pairs(key, pending.iter().map(|r| r.resource)).await;

        // Limits are read under the pair locks; limit updates take the same locks
        let mut limited = Vec::with_capacity(pending.len());
        for reservation in pending {
            let limit = self.resolver.effective_limit(key, reservation.resource).await?;
            limited.push((reservation, limit));
        }
        let pending = limited;

        let mut held: Vec<&Reservation> = Vec::with_capacity(pending.len());
        for (reservation, limit) in &pending {
            if let Err(e) = self.hold(reservation, *limit).await {
                self.release_holds(&held).await;
                if let QuotaError::OverQuota { resource, requested, available } = &e {
                    self.report_over_quota(key, *resource, *requested, *available);
                }
                return Err(e);
            }
            held.push(reservation);
        }

        for (index, (reservation, _)) in pending.iter().enumerate() {
            if let Err(e) = self.store.save_reservation(reservation).await {
                error!("Failed to save reservation {}: {}", reservation.id, e);
                self.release_holds(&held).await;
                self.abandon(pending[..index].iter().map(|(r, _)| r)).await;
                return Err(e.into());
            }
        }

        let mut ids = Vec::with_capacity(pending.len());
        for (reservation, limit) in pending {
            info!(
                "Reserved {} {} for {} (limit {}, reservation {})",
                reservation.delta, reservation.resource, key, limit, reservation.id
            );
            metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "held").increment(1);
            self.event_bus
                .publish_reservation_event(ReservationEvent::ReservationCreated {
                    reservation_id: reservation.id,
                    key: reservation.key.clone(),
                    resource: reservation.resource,
                    delta: reservation.delta,
                    created_at: reservation.created_at,
                });
            ids.push(reservation.id);
        }

        Ok(ids)
    }

    /// Check the projected usage and apply the hold. Caller holds the pair lock.
    async fn hold(&self, reservation: &Reservation, limit: i64) -> Result<(), QuotaError> {
        let resource = reservation.resource;
        let delta = reservation.delta;

        if delta < 0 {
            let usage = self.store.get_usage(&reservation.key, resource).await?;
            if usage.in_use + delta < 0 {
                return Err(QuotaError::InvalidDelta(format!(
                    "decrease of {} {} exceeds in_use {}",
                    -delta, resource, usage.in_use
                )));
            }
            return Ok(());
        }

        self.update_usage(&reservation.key, resource, |usage| {
            let projected = usage.consumed() + delta;
            if limit != UNLIMITED && projected > limit {
                return Err(QuotaError::OverQuota {
                    resource,
                    requested: delta,
                    available: (limit - usage.consumed()).max(0),
                });
            }
            Ok(usage.apply(0, delta))
        })
        .await?;
        Ok(())
    }

    /// Compensate holds applied earlier in a failed batch.
    async fn release_holds(&self, held: &[&Reservation]) {
        for reservation in held {
            let hold = reservation.held_amount();
            if hold == 0 {
                continue;
            }
            if let Err(e) = self
                .update_usage(&reservation.key, reservation.resource, |usage| {
                    Ok(usage.apply(0, -hold.min(usage.reserved)))
                })
                .await
            {
                error!(
                    "Failed to release {} {} held for {}: {}",
                    hold, reservation.resource, reservation.key, e
                );
            }
        }
    }

    /// Mark already persisted reservations of a failed batch as rolled back.
    async fn abandon<'a>(&self, saved: impl Iterator<Item = &'a Reservation>) {
        for reservation in saved {
            let mut reservation = reservation.clone();
            if reservation.mark_rolled_back().is_ok() {
                if let Err(e) = self.store.save_reservation(&reservation).await {
                    error!("Failed to abandon reservation {}: {}", reservation.id, e);
                }
            }
        }
    }

    fn report_over_quota(&self, key: &QuotaKey, resource: ResourceKind, requested: i64, available: i64) {
        warn!(
            "Reservation of {} {} for {} rejected: only {} available",
            requested, resource, key, available
        );
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "over_quota").increment(1);
        self.event_bus
            .publish_reservation_event(ReservationEvent::QuotaExceeded {
                key: key.clone(),
                resource,
                requested,
                available,
                exceeded_at: Utc::now(),
            });
    }

    async fn finish(&self, id: ReservationId, action: Finish) -> Result<Transition, QuotaError> {
        let located = self.get_reservation(id).await?;
        let _guard = self.lock(&located.key, located.resource).await;

        // Re-read under the lock; a concurrent finish may have won.
        let mut reservation = self.get_reservation(id).await?;
        let held_since = reservation.created_at;

        let transition = match action {
            Finish::Commit => reservation.mark_committed()?,
            Finish::Rollback => reservation.mark_rolled_back()?,
            Finish::Expire => {
                if !reservation.is_held() {
                    return Ok(Transition::AlreadyDone);
                }
                reservation.mark_rolled_back()?
            }
        };

        if transition == Transition::AlreadyDone {
            debug!("Reservation {} already {}", id, reservation.state);
            return Ok(transition);
        }

        let hold = reservation.held_amount();
        let delta = reservation.delta;
        let key = reservation.key.clone();
        let resource = reservation.resource;

        // Counters and the new state land in one write, so a retry after a
        // failed write sees the reservation still held and nothing applied.
        match action {
            Finish::Commit => {
                self.write_usage(&key, resource, Some(&reservation), |usage| {
                    let released = hold.min(usage.reserved);
                    let in_use = usage.in_use + delta;
                    if in_use < 0 {
                        warn!("Commit of {} would drive {} {} in_use below zero, clamping", id, key, resource);
                    }
                    Ok(QuotaUsage {
                        in_use: in_use.max(0),
                        reserved: usage.reserved - released,
                        version: usage.version + 1,
                    })
                })
                .await?;
            }
            Finish::Rollback | Finish::Expire => {
                self.write_usage(&key, resource, Some(&reservation), |usage| {
                    Ok(usage.apply(0, -hold.min(usage.reserved)))
                })
                .await?;
            }
        }

        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => action.outcome()).increment(1);

        let now = Utc::now();
        let event = match action {
            Finish::Commit => {
                info!("Committed reservation {} ({} {} for {})", id, delta, resource, key);
                ReservationEvent::ReservationCommitted {
                    reservation_id: id,
                    key,
                    resource,
                    delta,
                    committed_at: now,
                }
            }
            Finish::Rollback => {
                info!("Rolled back reservation {} ({} {} for {})", id, delta, resource, key);
                ReservationEvent::ReservationRolledBack {
                    reservation_id: id,
                    key,
                    resource,
                    delta,
                    rolled_back_at: now,
                }
            }
            Finish::Expire => {
                warn!(
                    "Expired reservation {} ({} {} for {}, held since {})",
                    id, delta, resource, key, held_since
                );
                metrics::counter!(RESERVATIONS_EXPIRED_TOTAL).increment(1);
                expired_event(id, key, resource, held_since, now)
            }
        };
        self.event_bus.publish_reservation_event(event);

        Ok(Transition::Applied)
    }
}

fn expired_event(
    reservation_id: ReservationId,
    key: QuotaKey,
    resource: ResourceKind,
    held_since: DateTime<Utc>,
    expired_at: DateTime<Utc>,
) -> ReservationEvent {
    ReservationEvent::ReservationExpired {
        reservation_id,
        key,
        resource,
        held_since,
        expired_at,
    }
}

/// Scoped reservation handle.
///
/// The only ways out are `commit` and `rollback`. A guard dropped without
/// either spawns a rollback on the current runtime; if there is none the
/// hold is left to the expiry sweep.
pub struct ReservationGuard {
    engine: Arc<ReservationEngine>,
    id: ReservationId,
    finished: bool,
}

impl ReservationGuard {
    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub async fn commit(mut self) -> Result<(), QuotaError> {
        self.finished = true;
        self.engine.commit(self.id).await
    }

    pub async fn rollback(mut self) -> Result<(), QuotaError> {
        self.finished = true;
        self.engine.rollback(self.id).await
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = Arc::clone(&self.engine);
                handle.spawn(async move {
                    if let Err(e) = engine.rollback(id).await {
                        warn!("Failed to roll back dropped reservation {}: {}", id, e);
                    }
                });
            }
            Err(_) => {
                warn!("Reservation {} dropped outside a runtime, leaving it to the expiry sweep", id);
            }
        }
    }
}
