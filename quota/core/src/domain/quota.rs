// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;
use crate::domain::repository::RepositoryError;

/// Limit value meaning "no upper bound".
pub const UNLIMITED: i64 = -1;

// ============================================================================
// Value Objects
// ============================================================================

/// Identifier of a project (tenant) as issued by the identity service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Result<Self, QuotaError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(QuotaError::InvalidScope("project_id cannot be empty".to_string()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user within a project
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Share type name or id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShareTypeId(pub String);

impl std::fmt::Display for ShareTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Override axis a quota record applies to.
///
/// User and share-type scopes are mutually exclusive refinements of the
/// project scope; a single key never carries both.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Scope {
    Project,
    User(UserId),
    ShareType(ShareTypeId),
}

impl Scope {
    pub fn is_project(&self) -> bool {
        matches!(self, Self::Project)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Project => write!(f, "project"),
            Self::User(user) => write!(f, "user:{}", user),
            Self::ShareType(share_type) => write!(f, "share_type:{}", share_type),
        }
    }
}

/// Scope a quota record or counter pair applies to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QuotaKey {
    pub project_id: ProjectId,
    pub scope: Scope,
}

impl QuotaKey {
    pub fn project(project_id: ProjectId) -> Self {
        Self { project_id, scope: Scope::Project }
    }

    pub fn user(project_id: ProjectId, user_id: UserId) -> Self {
        Self { project_id, scope: Scope::User(user_id) }
    }

    pub fn share_type(project_id: ProjectId, share_type: ShareTypeId) -> Self {
        Self { project_id, scope: Scope::ShareType(share_type) }
    }

    /// Build a key from the optional query parameters of an API call.
    pub fn from_parts(
        project_id: ProjectId,
        user_id: Option<UserId>,
        share_type: Option<ShareTypeId>,
    ) -> Result<Self, QuotaError> {
        match (user_id, share_type) {
            (Some(_), Some(_)) => Err(QuotaError::InvalidScope(
                "user_id and share_type cannot be combined in one request".to_string(),
            )),
            (Some(user), None) => Ok(Self::user(project_id, user)),
            (None, Some(share_type)) => Ok(Self::share_type(project_id, share_type)),
            (None, None) => Ok(Self::project(project_id)),
        }
    }

    /// The project-level key this key refines.
    pub fn project_key(&self) -> Self {
        Self::project(self.project_id.clone())
    }
}

impl std::fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.scope)
    }
}

/// Independently limited resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Shares,
    Gigabytes,
    Snapshots,
    SnapshotGigabytes,
    ShareNetworks,
    ShareGroups,
    ShareGroupSnapshots,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Shares,
        ResourceKind::Gigabytes,
        ResourceKind::Snapshots,
        ResourceKind::SnapshotGigabytes,
        ResourceKind::ShareNetworks,
        ResourceKind::ShareGroups,
        ResourceKind::ShareGroupSnapshots,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shares => "shares",
            Self::Gigabytes => "gigabytes",
            Self::Snapshots => "snapshots",
            Self::SnapshotGigabytes => "snapshot_gigabytes",
            Self::ShareNetworks => "share_networks",
            Self::ShareGroups => "share_groups",
            Self::ShareGroupSnapshots => "share_group_snapshots",
        }
    }

    /// Share networks are not bound to a share type and cannot be limited per type.
    pub fn allowed_in(&self, scope: &Scope) -> bool {
        !(matches!(scope, Scope::ShareType(_)) && *self == Self::ShareNetworks)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| QuotaError::UnknownResource(s.to_string()))
    }
}

/// Validate a limit value: any non-negative number, or -1 for unlimited.
pub fn validate_limit(resource: ResourceKind, limit: i64) -> Result<(), QuotaError> {
    if limit < UNLIMITED {
        return Err(QuotaError::InvalidLimit { resource, limit });
    }
    Ok(())
}

/// Usage counters for a single key + resource.
///
/// `version` increases on every write and backs compare-and-swap updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub in_use: i64,
    pub reserved: i64,
    pub version: u64,
}

impl QuotaUsage {
    pub fn consumed(&self) -> i64 {
        self.in_use + self.reserved
    }

    /// Next counter state with the given adjustments applied.
    pub fn apply(&self, in_use_delta: i64, reserved_delta: i64) -> Self {
        Self {
            in_use: self.in_use + in_use_delta,
            reserved: self.reserved + reserved_delta,
            version: self.version + 1,
        }
    }
}

/// Limit plus counters for one key and resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub key: QuotaKey,
    pub resource: ResourceKind,
    pub limit: i64,
    pub in_use: i64,
    pub reserved: i64,
}

impl QuotaRecord {
    pub fn new(key: QuotaKey, resource: ResourceKind, limit: i64, usage: QuotaUsage) -> Self {
        Self {
            key,
            resource,
            limit,
            in_use: usage.in_use,
            reserved: usage.reserved,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit == UNLIMITED
    }

    /// `in_use + reserved <= limit` for bounded limits; counters never negative.
    pub fn within_limit(&self) -> bool {
        self.in_use >= 0
            && self.reserved >= 0
            && (self.is_unlimited() || self.in_use + self.reserved <= self.limit)
    }
}

/// Limits per resource, one entry for every resource kind
pub type QuotaSet = BTreeMap<ResourceKind, i64>;

/// Limit and counters as returned by the detail view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDetail {
    pub limit: i64,
    pub in_use: i64,
    pub reserved: i64,
}

pub type QuotaSetDetail = BTreeMap<ResourceKind, QuotaDetail>;

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded for {resource}: requested {requested}, available {available}")]
    OverQuota {
        resource: ResourceKind,
        requested: i64,
        available: i64,
    },

    #[error("Quota limit {limit} for {resource} is below current usage (in_use {in_use}, reserved {reserved})")]
    QuotaTooSmall {
        resource: ResourceKind,
        limit: i64,
        in_use: i64,
        reserved: i64,
    },

    #[error("Quota limit {limit} for {resource} exceeds the project limit {project_limit}")]
    ExceedsProjectLimit {
        resource: ResourceKind,
        limit: i64,
        project_limit: i64,
    },

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Invalid limit {limit} for {resource}: must be -1 or greater")]
    InvalidLimit { resource: ResourceKind, limit: i64 },

    #[error("Unknown quota resource: {0}")]
    UnknownResource(String),

    #[error("Invalid reservation delta: {0}")]
    InvalidDelta(String),

    #[error("Reservation {id} is {state} and cannot be {action}")]
    InvalidReservationState {
        id: String,
        state: String,
        action: &'static str,
    },

    #[error("Concurrent modification of quota usage, gave up after {attempts} attempts")]
    ConcurrentModification { attempts: u32 },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ============================================================================
// Tests
// ============================================================================
