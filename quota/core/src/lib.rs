// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Quota enforcement core for a shared file system control plane.
//!
//! # Architecture
//!
//! - **Domain:** quota keys, limits, reservations, the `LimitStore` contract
//! - **Application:** hierarchy resolver, reservation engine, quota service, expiry sweeper
//! - **Infrastructure:** in-memory and PostgreSQL limit stores, event bus
//! - **Presentation:** `quota-sets` REST router

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
