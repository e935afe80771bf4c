// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the quotad CLI

pub mod config;
pub mod quota;

pub use self::config::ConfigCommand;
pub use self::quota::QuotaCommand;
