// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Limit precedence.
//!
//! From highest to lowest: the scoped override (user or share type, never
//! both), the project override, then the process-wide default. Absence at
//! one level falls through to the next.

use crate::domain::quota::Scope;

/// Where an effective limit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    Scoped,
    Project,
    Default,
}

/// Overrides found for one (key, resource) pair, ordered by precedence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitLayers {
    pub scoped: Option<i64>,
    pub project: Option<i64>,
    pub default: i64,
}

impl LimitLayers {
    /// Assemble layers for a scope. A project-scoped query has no scoped layer.
    pub fn for_scope(scope: &Scope, scoped: Option<i64>, project: Option<i64>, default: i64) -> Self {
        Self {
            scoped: if scope.is_project() { None } else { scoped },
            project,
            default,
        }
    }

    pub fn effective(&self) -> i64 {
        self.resolve().0
    }

    pub fn resolve(&self) -> (i64, LimitSource) {
        if let Some(limit) = self.scoped {
            return (limit, LimitSource::Scoped);
        }
        if let Some(limit) = self.project {
            return (limit, LimitSource::Project);
        }
        (self.default, LimitSource::Default)
    }
}
