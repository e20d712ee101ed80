//! Rate limit config CRUD and the merged config+status view

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use crate::store::rate_limits::{self, NewRateLimitConfig, RateLimitConfigRow};

use super::AppState;

fn internal_error(e: crate::error::Error) -> Response {
    tracing::error!("Rate limit query failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

fn validate(new: &NewRateLimitConfig) -> Option<Response> {
    if new.model_pattern.trim().is_empty() {
        return Some(bad_request("model_pattern must not be empty"));
    }
    if new.window_minutes <= 0 {
        return Some(bad_request("window_minutes must be positive"));
    }
    if new.token_limit.unwrap_or(0) < 0 || new.request_limit.unwrap_or(0) < 0 {
        return Some(bad_request("limits must be zero, null or positive"));
    }
    None
}

fn config_json(config: &RateLimitConfigRow, status: Option<serde_json::Value>) -> serde_json::Value {
    serde_json::json!({
        "id": config.id,
        "model_pattern": config.model_pattern,
        "window_minutes": config.window_minutes,
        "reset_strategy": config.reset_strategy,
        "token_limit": config.token_limit,
        "request_limit": config.request_limit,
        "reset_anchor_at": config.reset_anchor_at,
        "enforced": config.is_enforced(),
        "status": status,
    })
}

/// All configs merged with their latest reconciled statuses
pub async fn list(State(state): State<AppState>) -> Response {
    let pool = state.db.pool();
    let configs = match rate_limits::list_configs(pool).await {
        Ok(configs) => configs,
        Err(e) => return internal_error(e),
    };

    let mut limits = Vec::with_capacity(configs.len());
    for config in &configs {
        let status = match rate_limits::get_status(pool, config.id).await {
            Ok(status) => status.map(|s| {
                serde_json::json!({
                    "used_tokens": s.used_tokens,
                    "used_requests": s.used_requests,
                    "remaining_tokens": s.remaining_tokens,
                    "remaining_requests": s.remaining_requests,
                    "percentage": s.percentage,
                    "label": s.status_label,
                    "window_start": s.window_start,
                    "next_reset": s.next_reset,
                    "last_updated": s.last_updated,
                })
            }),
            Err(e) => return internal_error(e),
        };
        limits.push(config_json(config, status));
    }

    (StatusCode::OK, Json(serde_json::json!({"limits": limits}))).into_response()
}

pub async fn create(
    State(state): State<AppState>,
    Json(new): Json<NewRateLimitConfig>,
) -> Response {
    if let Some(rejection) = validate(&new) {
        return rejection;
    }

    match rate_limits::create_config(state.db.pool(), &new, Utc::now()).await {
        Ok(config) => (StatusCode::CREATED, Json(config_json(&config, None))).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(new): Json<NewRateLimitConfig>,
) -> Response {
    let Ok(id) = id.parse::<i64>() else {
        return bad_request("config id must be an integer");
    };
    if let Some(rejection) = validate(&new) {
        return rejection;
    }

    match rate_limits::update_config(state.db.pool(), id, &new, Utc::now()).await {
        Ok(Some(config)) => (StatusCode::OK, Json(config_json(&config, None))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("rate limit config {id} not found")})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<i64>() else {
        return bad_request("config id must be an integer");
    };

    match rate_limits::delete_config(state.db.pool(), id).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"message": format!("rate limit config {id} deleted")})),
        )
            .into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("rate limit config {id} not found")})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}
