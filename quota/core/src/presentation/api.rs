// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `quota-sets` REST API
//!
//! Thin axum adapter over `QuotaService`. `{project_id}` is the caller's
//! project from the URL prefix, `{target}` the project whose quotas are read
//! or written. Errors use the OpenStack fault body
//! `{"badRequest": {"code": 400, "message": "..."}}`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::application::quota_service::QuotaService;
use crate::domain::quota::{ProjectId, QuotaDetail, QuotaError, QuotaSet, ResourceKind, ShareTypeId, UserId};

pub struct AppState {
    pub quota_service: Arc<dyn QuotaService>,
    pub start_time: Instant,
}

pub fn app(service: Arc<dyn QuotaService>) -> Router {
    let state = Arc::new(AppState {
        quota_service: service,
        start_time: Instant::now(),
    });

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/v2/{project_id}/quota-sets/{target}",
            get(show_handler).put(update_handler).delete(delete_handler),
        )
        .route("/v2/{project_id}/quota-sets/{target}/defaults", get(defaults_handler))
        .route("/v2/{project_id}/quota-sets/{target}/detail", get(detail_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ScopeQuery {
    pub user_id: Option<String>,
    pub share_type: Option<String>,
}

impl ScopeQuery {
    fn into_parts(self) -> (Option<UserId>, Option<ShareTypeId>) {
        (self.user_id.map(UserId), self.share_type.map(ShareTypeId))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuotaSetBody<T> {
    pub id: String,
    #[serde(flatten)]
    pub resources: BTreeMap<ResourceKind, T>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuotaSetResponse<T> {
    pub quota_set: QuotaSetBody<T>,
}

impl<T> QuotaSetResponse<T> {
    fn new(id: &ProjectId, resources: BTreeMap<ResourceKind, T>) -> Self {
        Self {
            quota_set: QuotaSetBody {
                id: id.to_string(),
                resources,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub quota_set: Map<String, Value>,
}

/// Resource limits plus the `force` and `share_type` controls of an update body.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedUpdate {
    pub limits: QuotaSet,
    pub force: bool,
    pub share_type: Option<ShareTypeId>,
}

/// Parse an update body. Unknown keys and non-integer limits are rejected.
pub fn parse_update(body: Map<String, Value>) -> Result<ParsedUpdate, QuotaError> {
    let mut parsed = ParsedUpdate::default();

    for (name, value) in body {
        match name.as_str() {
            "force" => {
                parsed.force = match &value {
                    Value::Bool(force) => *force,
                    Value::String(s) => s.eq_ignore_ascii_case("true"),
                    _ => return Err(QuotaError::InvalidScope(format!("invalid force value: {}", value))),
                }
            }
            "share_type" => match value {
                Value::String(share_type) => parsed.share_type = Some(ShareTypeId(share_type)),
                Value::Null => {}
                other => {
                    return Err(QuotaError::InvalidScope(format!("invalid share_type: {}", other)));
                }
            },
            _ => {
                let resource: ResourceKind = name.parse()?;
                let limit = match &value {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| QuotaError::InvalidLimit { resource, limit: i64::MIN })?;
                parsed.limits.insert(resource, limit);
            }
        }
    }

    Ok(parsed)
}

// ============================================================================
// Errors
// ============================================================================

pub struct ApiError(pub QuotaError);

impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            QuotaError::ConcurrentModification { .. } => StatusCode::CONFLICT,
            QuotaError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

fn fault_name(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "badRequest",
        StatusCode::CONFLICT => "conflictingRequest",
        _ => "computeFault",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Quota request failed: {}", self.0);
        } else {
            debug!("Quota request rejected: {}", self.0);
        }

        let body = json!({
            fault_name(status): {
                "code": status.as_u16(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

async fn show_handler(
    State(state): State<Arc<AppState>>,
    Path((_project_id, target)): Path<(String, String)>,
    Query(query): Query<ScopeQuery>,
) -> Result<Json<QuotaSetResponse<i64>>, ApiError> {
    let target = ProjectId::new(target)?;
    let (user_id, share_type) = query.into_parts();
    let limits = state.quota_service.show(&target, user_id, share_type).await?;
    Ok(Json(QuotaSetResponse::new(&target, limits)))
}

async fn defaults_handler(
    State(state): State<Arc<AppState>>,
    Path((_project_id, target)): Path<(String, String)>,
) -> Result<Json<QuotaSetResponse<i64>>, ApiError> {
    let target = ProjectId::new(target)?;
    let limits = state.quota_service.show_defaults(&target).await?;
    Ok(Json(QuotaSetResponse::new(&target, limits)))
}

async fn detail_handler(
    State(state): State<Arc<AppState>>,
    Path((_project_id, target)): Path<(String, String)>,
    Query(query): Query<ScopeQuery>,
) -> Result<Json<QuotaSetResponse<QuotaDetail>>, ApiError> {
    let target = ProjectId::new(target)?;
    let (user_id, share_type) = query.into_parts();
    let detail = state.quota_service.show_detail(&target, user_id, share_type).await?;
    Ok(Json(QuotaSetResponse::new(&target, detail)))
}

async fn update_handler(
    State(state): State<Arc<AppState>>,
    Path((_project_id, target)): Path<(String, String)>,
    Query(query): Query<ScopeQuery>,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<QuotaSetResponse<i64>>, ApiError> {
    let target = ProjectId::new(target)?;
    let update = parse_update(request.quota_set)?;
    let (user_id, query_share_type) = query.into_parts();
    let share_type = update.share_type.or(query_share_type);

    let limits = state
        .quota_service
        .update(&target, update.limits, user_id, share_type, update.force)
        .await?;
    Ok(Json(QuotaSetResponse::new(&target, limits)))
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path((_project_id, target)): Path<(String, String)>,
    Query(query): Query<ScopeQuery>,
) -> Result<StatusCode, ApiError> {
    let target = ProjectId::new(target)?;
    let (user_id, share_type) = query.into_parts();
    state.quota_service.delete(&target, user_id, share_type).await?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_parse_update() {
        let parsed = parse_update(body(json!({
            "shares": 5,
            "gigabytes": "-1",
            "force": true,
            "share_type": "gold",
        })))
        .unwrap();

        assert_eq!(parsed.limits[&ResourceKind::Shares], 5);
        assert_eq!(parsed.limits[&ResourceKind::Gigabytes], -1);
        assert!(parsed.force);
        assert_eq!(parsed.share_type, Some(ShareTypeId("gold".into())));
    }

    #[test]
    fn test_parse_update_rejects_unknown_keys() {
        let err = parse_update(body(json!({"volumes": 5}))).unwrap_err();
        assert!(matches!(err, QuotaError::UnknownResource(name) if name == "volumes"));

        let err = parse_update(body(json!({"shares": "many"}))).unwrap_err();
        assert!(matches!(err, QuotaError::InvalidLimit { .. }));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError(QuotaError::NotFound("p".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(QuotaError::ConcurrentModification { attempts: 3 }).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(QuotaError::Repository(crate::domain::repository::RepositoryError::Database(
                "down".into()
            )))
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_quota_set_body_shape() {
        let project = ProjectId::new("p1").unwrap();
        let response = QuotaSetResponse::new(&project, QuotaSet::from([(ResourceKind::SnapshotGigabytes, 7)]));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value, json!({"quota_set": {"id": "p1", "snapshot_gigabytes": 7}}));
    }
}
