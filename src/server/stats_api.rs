//! Read-only projections of the usage store

use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, NaiveDate, Timelike, Utc};
use serde::Deserialize;

use crate::collector::Breakdown;
use crate::store::{daily, model_usage, snapshots};

use super::AppState;

fn internal_error(e: crate::error::Error) -> Response {
    tracing::error!("Read query failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}

/// Latest snapshot with its per-model rows
pub async fn latest(State(state): State<AppState>) -> Response {
    let pool = state.db.pool();

    let snapshot = match snapshots::latest(pool).await {
        Ok(snapshot) => snapshot,
        Err(e) => return internal_error(e),
    };

    let Some(snapshot) = snapshot else {
        return (
            StatusCode::OK,
            Json(serde_json::json!({"snapshot": null, "models": []})),
        )
            .into_response();
    };

    match model_usage::for_snapshot(pool, snapshot.id).await {
        Ok(models) => (
            StatusCode::OK,
            Json(serde_json::json!({"snapshot": snapshot, "models": models})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DailyParams {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

/// Daily aggregates for a date range (default: trailing 7 local days),
/// breakdown returned as a parsed document
pub async fn daily(State(state): State<AppState>, Query(params): Query<DailyParams>) -> Response {
    let today = Utc::now().with_timezone(&state.offset).date_naive();
    let end = params.end.unwrap_or(today);
    let start = params.start.unwrap_or(end - Duration::days(6));

    if start > end {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "start must not be after end"})),
        )
            .into_response();
    }

    match daily::range(state.db.pool(), start, end).await {
        Ok(rows) => {
            let days: Vec<_> = rows
                .into_iter()
                .map(|row| {
                    serde_json::json!({
                        "date": row.date,
                        "total_requests": row.total_requests,
                        "success_count": row.success_count,
                        "failure_count": row.failure_count,
                        "total_tokens": row.total_tokens,
                        "total_cost_usd": row.total_cost_usd,
                        "breakdown": Breakdown::from_column(&row.breakdown),
                        "updated_at": row.updated_at,
                    })
                })
                .collect();
            (StatusCode::OK, Json(serde_json::json!({"days": days}))).into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ModelsParams {
    /// Trailing window in hours (default 24)
    pub hours: Option<i64>,
    /// Optional model-name substring filter
    pub model: Option<String>,
    pub limit: Option<i64>,
}

/// Per-model usage rows over a trailing window, newest first
pub async fn models(State(state): State<AppState>, Query(params): Query<ModelsParams>) -> Response {
    let hours = params.hours.unwrap_or(24).clamp(1, 24 * 90);
    let hi = Utc::now() + Duration::minutes(1);
    let lo = hi - Duration::hours(hours);

    match model_usage::in_range(
        state.db.pool(),
        params.model.as_deref(),
        lo,
        hi,
        true,
        params.limit,
    )
    .await
    {
        Ok(rows) => (StatusCode::OK, Json(serde_json::json!({"rows": rows}))).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DateParam {
    pub date: Option<NaiveDate>,
}

/// Per-hour snapshot counts and high-water cumulative counters for one
/// local date
pub async fn hourly(State(state): State<AppState>, Query(params): Query<DateParam>) -> Response {
    let date = params
        .date
        .unwrap_or_else(|| Utc::now().with_timezone(&state.offset).date_naive());

    let local_midnight = date.and_time(chrono::NaiveTime::MIN);
    let lo = chrono::DateTime::<Utc>::from_naive_utc_and_offset(
        local_midnight - Duration::seconds(i64::from(state.offset.local_minus_utc())),
        Utc,
    );
    let hi = lo + Duration::hours(24);

    let rows = match snapshots::in_range(state.db.pool(), lo, hi).await {
        Ok(rows) => rows,
        Err(e) => return internal_error(e),
    };

    let mut buckets: BTreeMap<u32, serde_json::Value> = BTreeMap::new();
    for row in rows {
        let hour = row.captured_at.with_timezone(&state.offset).hour();
        let entry = buckets.entry(hour).or_insert_with(|| {
            serde_json::json!({
                "hour": hour,
                "snapshots": 0,
                "total_requests": 0,
                "total_tokens": 0,
                "cumulative_cost_usd": 0.0,
            })
        });
        entry["snapshots"] = (entry["snapshots"].as_i64().unwrap_or(0) + 1).into();
        entry["total_requests"] = row
            .total_requests
            .max(entry["total_requests"].as_i64().unwrap_or(0))
            .into();
        entry["total_tokens"] = row
            .total_tokens
            .max(entry["total_tokens"].as_i64().unwrap_or(0))
            .into();
        let prev_cost = entry["cumulative_cost_usd"].as_f64().unwrap_or(0.0);
        entry["cumulative_cost_usd"] = serde_json::json!(row.cumulative_cost_usd.max(prev_cost));
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "date": date,
            "hours": buckets.into_values().collect::<Vec<_>>(),
        })),
    )
        .into_response()
}

/// The endpoint slice of one day's breakdown
pub async fn endpoints(State(state): State<AppState>, Query(params): Query<DateParam>) -> Response {
    let date = params
        .date
        .unwrap_or_else(|| Utc::now().with_timezone(&state.offset).date_naive());

    match daily::get(state.db.pool(), date).await {
        Ok(Some(row)) => {
            let breakdown = Breakdown::from_column(&row.breakdown);
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "date": date,
                    "endpoints": breakdown.endpoints,
                })),
            )
                .into_response()
        }
        Ok(None) => (
            StatusCode::OK,
            Json(serde_json::json!({"date": date, "endpoints": {}})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}
