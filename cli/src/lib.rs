// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! quotad CLI library - exposes testable components
//!
//! - `daemon` - the HTTP server wiring and the client used to talk to it
//! - `commands` - `quota` and `config` subcommands

pub mod daemon;
pub mod commands;
