// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Layer
//!
//! Quota keys, resource kinds, reservations, limit precedence and the
//! persistence contract. Nothing here performs I/O.

pub mod quota;
pub mod reservation;
pub mod hierarchy;
pub mod events;
pub mod repository;
pub mod quota_config;
