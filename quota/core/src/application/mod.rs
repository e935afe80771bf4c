// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod hierarchy_resolver;
pub mod reservation_engine;
pub mod quota_service;
pub mod expiry_sweeper;
pub mod event_auditor;

pub use hierarchy_resolver::HierarchyResolver;
pub use reservation_engine::{ReservationEngine, ReservationGuard};
pub use quota_service::{QuotaService, StandardQuotaService};
pub use expiry_sweeper::ExpirySweeper;
pub use event_auditor::EventAuditor;
