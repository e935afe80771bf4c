// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server process and its HTTP client

pub mod client;
pub mod server;

pub use client::QuotaClient;
pub use server::start_server;
