//! Collector control endpoints: health, manual trigger, limit reset

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use crate::reconciler::window::natural_window;
use crate::reconciler::{build_status, WindowUsage};
use crate::store::rate_limits;

use super::AppState;

/// Liveness probe; never touches the data plane
pub async fn health() -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

/// Start a collect-then-reconcile pass in the background. A pass already in
/// flight absorbs the trigger.
pub async fn trigger(State(state): State<AppState>) -> Response {
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        coordinator.run_once().await;
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "message": "Collector pass triggered",
        })),
    )
        .into_response()
}

/// Zero a config's usage window: write a fresh status and stamp the reset
/// anchor so subsequent reconciler passes keep the window anchored at the
/// reset instant until the natural boundary overtakes it.
pub async fn reset(State(state): State<AppState>, Path(config_id): Path<String>) -> Response {
    let Ok(config_id) = config_id.parse::<i64>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "config id must be an integer",
            })),
        )
            .into_response();
    };

    let pool = state.db.pool();
    let config = match rate_limits::get_config(pool, config_id).await {
        Ok(Some(config)) => config,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": format!("rate limit config {config_id} not found"),
                })),
            )
                .into_response();
        }
        Err(e) => return persistence_error(e),
    };

    let now = Utc::now();
    let bounds = natural_window(config.strategy(), config.window_minutes, now, state.offset);
    let status = build_status(&config, &WindowUsage::default(), now, bounds.next_reset, now);

    if let Err(e) = rate_limits::set_reset_anchor(pool, config_id, now).await {
        return persistence_error(e);
    }
    if let Err(e) = rate_limits::upsert_status(pool, &status).await {
        return persistence_error(e);
    }

    tracing::info!(config_id, "Rate limit window reset");

    // Let the reconciler observe the anchor right away.
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        coordinator.run_once().await;
    });

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "message": format!("Rate limit {config_id} reset"),
            "new_status": {
                "percentage": status.percentage,
                "label": status.status_label,
            },
        })),
    )
        .into_response()
}

fn persistence_error(e: crate::error::Error) -> Response {
    tracing::error!("Persistence error in collector API: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "error": e.to_string(),
        })),
    )
        .into_response()
}
