//! Control-surface smoke tests against the real router and store

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::Utc;
use tower::ServiceExt;

use cap_collector::server::{router, AppState};
use cap_collector::store::rate_limits::{self, NewRateLimitConfig, ResetStrategy};
use cap_collector::{Config, Coordinator, DeltaEngine, PricingOracle, Reconciler, UpstreamClient};

async fn test_state() -> (AppState, common::TestStore) {
    let store = common::test_store().await;

    // Point the upstream at a closed port; triggered passes fail fast and
    // transiently, which is all these tests need.
    let config = Config {
        cliproxy_url: "http://127.0.0.1:1".to_string(),
        ..Config::default()
    };

    let coordinator = Arc::new(Coordinator::new(
        UpstreamClient::new(&config),
        DeltaEngine::new(
            store.db.pool().clone(),
            Arc::new(PricingOracle::defaults_only()),
            &config,
        ),
        Reconciler::new(store.db.pool().clone(), &config),
        config.interval_seconds,
    ));

    let state = AppState {
        db: store.db.clone(),
        coordinator,
        offset: config.local_offset(),
    };
    (state, store)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn test_health_is_always_ok() {
    let (state, _store) = test_state().await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/collector/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_trigger_returns_accepted() {
    let (state, _store) = test_state().await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/collector/trigger")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn test_reset_rejects_bad_ids() {
    let (state, _store) = test_state().await;
    let app = router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/collector/reset/not-a-number")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/collector/reset/999")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reset_reports_full_budget() {
    let (state, store) = test_state().await;

    let config = rate_limits::create_config(
        store.db.pool(),
        &NewRateLimitConfig {
            model_pattern: "gpt".to_string(),
            window_minutes: 1440,
            reset_strategy: Some(ResetStrategy::Daily),
            token_limit: Some(10_000),
            request_limit: None,
        },
        Utc::now(),
    )
    .await
    .unwrap();

    let app = router(state);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/collector/reset/{}", config.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["new_status"]["percentage"], 100);
    assert!(body["new_status"]["label"].as_str().unwrap().starts_with("ok:"));

    // The anchor is stamped on the config and the status row is zeroed.
    let config = rate_limits::get_config(store.db.pool(), config.id)
        .await
        .unwrap()
        .unwrap();
    assert!(config.reset_anchor_at.is_some());

    let status = rate_limits::get_status(store.db.pool(), config.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.used_tokens, 0);
    assert_eq!(status.percentage, 100);
}

#[tokio::test]
async fn test_limits_crud_round_trip() {
    let (state, _store) = test_state().await;
    let app = router(state);

    // Create
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/limits")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "model_pattern": "sonnet",
                        "window_minutes": 300,
                        "reset_strategy": "rolling",
                        "token_limit": 50_000
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["model_pattern"], "sonnet");

    // Empty patterns are rejected
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/limits")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"model_pattern": "  "}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // List contains the config with no status yet
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/limits")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    assert_eq!(listed["limits"].as_array().unwrap().len(), 1);
    assert!(listed["limits"][0]["status"].is_null());

    // Update
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/api/limits/{id}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "model_pattern": "sonnet",
                        "window_minutes": 600,
                        "reset_strategy": "rolling",
                        "token_limit": 75_000
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated = body_json(response).await;
    assert_eq!(updated["window_minutes"], 600);

    // Delete, then the list is empty
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/limits/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/limits")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed = body_json(response).await;
    assert!(listed["limits"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_usage_endpoints_on_empty_store() {
    let (state, _store) = test_state().await;
    let app = router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/usage/latest")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["snapshot"].is_null());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/usage/daily")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/usage/hourly?date=2026-03-10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["hours"].as_array().unwrap().is_empty());
}
