//! Per-(snapshot, endpoint, model) usage rows
//!
//! Rows carry the snapshot's capture timestamp so time-range queries stay on
//! the `(captured_at DESC)` index without joining back to the snapshot table.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};

use crate::error::Result;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ModelUsageRow {
    pub id: i64,
    pub snapshot_id: i64,
    pub api_endpoint: String,
    pub model_name: String,
    pub request_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub estimated_cost_usd: f64,
    pub captured_at: DateTime<Utc>,
}

/// Values for a model usage insert (snapshot id and timestamp supplied by
/// the caller, copied onto every row)
#[derive(Debug, Clone)]
pub struct NewModelUsage {
    pub api_endpoint: String,
    pub model_name: String,
    pub request_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub estimated_cost_usd: f64,
}

/// Per-model totals aggregated across endpoints at one capture timestamp
#[derive(Debug, Clone, FromRow)]
pub struct ModelTotals {
    pub model_name: String,
    pub tokens: i64,
    pub requests: i64,
}

/// Insert all model rows for one snapshot inside the caller's transaction
pub async fn insert_all(
    conn: &mut SqliteConnection,
    snapshot_id: i64,
    captured_at: DateTime<Utc>,
    rows: &[NewModelUsage],
) -> Result<()> {
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO model_usage
                (snapshot_id, api_endpoint, model_name, request_count,
                 input_tokens, output_tokens, total_tokens,
                 estimated_cost_usd, captured_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(snapshot_id)
        .bind(&row.api_endpoint)
        .bind(&row.model_name)
        .bind(row.request_count)
        .bind(row.input_tokens)
        .bind(row.output_tokens)
        .bind(row.total_tokens)
        .bind(row.estimated_cost_usd)
        .bind(captured_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// All rows belonging to one snapshot
pub async fn for_snapshot(pool: &SqlitePool, snapshot_id: i64) -> Result<Vec<ModelUsageRow>> {
    let rows = sqlx::query_as::<_, ModelUsageRow>(
        "SELECT * FROM model_usage WHERE snapshot_id = $1 ORDER BY api_endpoint, model_name",
    )
    .bind(snapshot_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Same as [`for_snapshot`] but usable inside the collector transaction
pub async fn for_snapshot_tx(
    conn: &mut SqliteConnection,
    snapshot_id: i64,
) -> Result<Vec<ModelUsageRow>> {
    let rows = sqlx::query_as::<_, ModelUsageRow>(
        "SELECT * FROM model_usage WHERE snapshot_id = $1 ORDER BY api_endpoint, model_name",
    )
    .bind(snapshot_id)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

fn like(pattern: &str) -> String {
    format!("%{pattern}%")
}

/// Most recent capture timestamp among rows matching the model pattern
pub async fn latest_time_matching(
    pool: &SqlitePool,
    pattern: &str,
) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query(
        r#"
        SELECT captured_at FROM model_usage
        WHERE model_name LIKE $1
        ORDER BY captured_at DESC LIMIT 1
        "#,
    )
    .bind(like(pattern))
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get::<DateTime<Utc>, _>(0)))
}

/// Latest capture timestamp strictly before `before` for the pattern
pub async fn last_time_before(
    pool: &SqlitePool,
    pattern: &str,
    before: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query(
        r#"
        SELECT captured_at FROM model_usage
        WHERE model_name LIKE $1 AND captured_at < $2
        ORDER BY captured_at DESC LIMIT 1
        "#,
    )
    .bind(like(pattern))
    .bind(before)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get::<DateTime<Utc>, _>(0)))
}

/// Earliest capture timestamp at or after `at` for the pattern
pub async fn first_time_at_or_after(
    pool: &SqlitePool,
    pattern: &str,
    at: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query(
        r#"
        SELECT captured_at FROM model_usage
        WHERE model_name LIKE $1 AND captured_at >= $2
        ORDER BY captured_at ASC LIMIT 1
        "#,
    )
    .bind(like(pattern))
    .bind(at)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get::<DateTime<Utc>, _>(0)))
}

/// Per-model token/request totals for the rows captured at exactly `at`
pub async fn totals_at(
    pool: &SqlitePool,
    pattern: &str,
    at: DateTime<Utc>,
) -> Result<Vec<ModelTotals>> {
    let rows = sqlx::query_as::<_, ModelTotals>(
        r#"
        SELECT
            model_name,
            COALESCE(SUM(total_tokens), 0) AS tokens,
            COALESCE(SUM(request_count), 0) AS requests
        FROM model_usage
        WHERE model_name LIKE $1 AND captured_at = $2
        GROUP BY model_name
        "#,
    )
    .bind(like(pattern))
    .bind(at)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Range query over rows: optional pattern filter, `[lo, hi)` time bounds,
/// ASC/DESC ordering and an optional limit
pub async fn in_range(
    pool: &SqlitePool,
    pattern: Option<&str>,
    lo: DateTime<Utc>,
    hi: DateTime<Utc>,
    descending: bool,
    limit: Option<i64>,
) -> Result<Vec<ModelUsageRow>> {
    let order = if descending { "DESC" } else { "ASC" };
    let sql = format!(
        r#"
        SELECT * FROM model_usage
        WHERE model_name LIKE $1 AND captured_at >= $2 AND captured_at < $3
        ORDER BY captured_at {order}
        LIMIT $4
        "#
    );

    let rows = sqlx::query_as::<_, ModelUsageRow>(&sql)
        .bind(like(pattern.unwrap_or("")))
        .bind(lo)
        .bind(hi)
        .bind(limit.unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await?;
    Ok(rows)
}
