// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP tests for the `quota-sets` router, driven through `tower::ServiceExt::oneshot`.

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use quotad_core::application::{HierarchyResolver, QuotaService, ReservationEngine, StandardQuotaService};
use quotad_core::domain::quota::{ProjectId, QuotaKey, ResourceKind};
use quotad_core::domain::quota_config::{DefaultLimits, ReservationConfig};
use quotad_core::domain::repository::LimitStore;
use quotad_core::infrastructure::event_bus::EventBus;
use quotad_core::infrastructure::repositories::InMemoryLimitStore;
use quotad_core::presentation::app;

async fn setup() -> (Router, Arc<StandardQuotaService>) {
    let store: Arc<dyn LimitStore> = Arc::new(InMemoryLimitStore::new());
    let event_bus = Arc::new(EventBus::with_default_capacity());
    let resolver = Arc::new(HierarchyResolver::new(store.clone(), DefaultLimits::default()));
    let engine = Arc::new(ReservationEngine::new(
        store.clone(),
        resolver.clone(),
        event_bus.clone(),
        &ReservationConfig::default(),
    ));
    let service = Arc::new(StandardQuotaService::new(store, resolver, engine, event_bus));
    service
        .register_project(&ProjectId::new("tenant-a").unwrap())
        .await
        .unwrap();

    (app(service.clone()), service)
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let (router, _) = setup().await;
    let (status, body) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_show_defaults() {
    let (router, _) = setup().await;
    let (status, body) = send(&router, Method::GET, "/v2/admin/quota-sets/tenant-a/defaults", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"quota_set": {
            "id": "tenant-a",
            "shares": 50,
            "gigabytes": 1000,
            "snapshots": 50,
            "snapshot_gigabytes": 1000,
            "share_networks": 10,
            "share_groups": 50,
            "share_group_snapshots": 50,
        }})
    );
}

#[tokio::test]
async fn test_update_then_show_for_user() {
    let (router, _) = setup().await;

    let (status, body) = send(
        &router,
        Method::PUT,
        "/v2/admin/quota-sets/tenant-a",
        Some(json!({"quota_set": {"shares": 5, "gigabytes": 500}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["quota_set"]["shares"], 5);

    let (status, _) = send(
        &router,
        Method::PUT,
        "/v2/admin/quota-sets/tenant-a?user_id=alice",
        Some(json!({"quota_set": {"shares": 3}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&router, Method::GET, "/v2/admin/quota-sets/tenant-a?user_id=alice", None).await;
    assert_eq!(body["quota_set"]["shares"], 3);
    assert_eq!(body["quota_set"]["gigabytes"], 500);

    let (status, body) = send(&router, Method::DELETE, "/v2/admin/quota-sets/tenant-a?user_id=alice", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, Value::Null);

    let (_, body) = send(&router, Method::GET, "/v2/admin/quota-sets/tenant-a?user_id=alice", None).await;
    assert_eq!(body["quota_set"]["shares"], 5);
}

#[tokio::test]
async fn test_share_type_from_body() {
    let (router, service) = setup().await;

    let (status, _) = send(
        &router,
        Method::PUT,
        "/v2/admin/quota-sets/tenant-a",
        Some(json!({"quota_set": {"share_type": "gold", "gigabytes": 200}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&router, Method::GET, "/v2/admin/quota-sets/tenant-a?share_type=gold", None).await;
    assert_eq!(body["quota_set"]["gigabytes"], 200);

    let project = service
        .show(&ProjectId::new("tenant-a").unwrap(), None, None)
        .await
        .unwrap();
    assert_eq!(project[&ResourceKind::Gigabytes], 1000);
}

#[tokio::test]
async fn test_detail_reports_counters() {
    let (router, service) = setup().await;
    let key = QuotaKey::project(ProjectId::new("tenant-a").unwrap());
    let id = service.reserve(&key, ResourceKind::Gigabytes, 40).await.unwrap();
    service.commit(id).await.unwrap();
    service.reserve(&key, ResourceKind::Gigabytes, 2).await.unwrap();

    let (status, body) = send(&router, Method::GET, "/v2/admin/quota-sets/tenant-a/detail", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["quota_set"]["gigabytes"],
        json!({"limit": 1000, "in_use": 40, "reserved": 2})
    );
}

#[tokio::test]
async fn test_quota_too_small_is_bad_request() {
    let (router, service) = setup().await;
    let key = QuotaKey::project(ProjectId::new("tenant-a").unwrap());
    service.reserve(&key, ResourceKind::Shares, 3).await.unwrap();

    let (status, body) = send(
        &router,
        Method::PUT,
        "/v2/admin/quota-sets/tenant-a",
        Some(json!({"quota_set": {"shares": 2}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["badRequest"]["code"], 400);

    let (status, body) = send(
        &router,
        Method::PUT,
        "/v2/admin/quota-sets/tenant-a",
        Some(json!({"quota_set": {"shares": 2, "force": true}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["quota_set"]["shares"], 2);
}

#[tokio::test]
async fn test_bad_requests() {
    let (router, _) = setup().await;

    // Unknown resource key
    let (status, _) = send(
        &router,
        Method::PUT,
        "/v2/admin/quota-sets/tenant-a",
        Some(json!({"quota_set": {"volumes": 2}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Limit below -1
    let (status, _) = send(
        &router,
        Method::PUT,
        "/v2/admin/quota-sets/tenant-a",
        Some(json!({"quota_set": {"shares": -5}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Both scopes at once
    let (status, body) = send(
        &router,
        Method::GET,
        "/v2/admin/quota-sets/tenant-a?user_id=alice&share_type=gold",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["badRequest"]["message"].as_str().unwrap().contains("Invalid scope"));

    // Unknown project
    let (status, _) = send(&router, Method::GET, "/v2/admin/quota-sets/nobody", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
