//! Daily aggregate rows, one per local calendar date
//!
//! The breakdown column holds the serialized model/endpoint document; the
//! collector reads, merges and rewrites it within its pass transaction.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use crate::error::Result;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DailyUsageRow {
    pub date: NaiveDate,
    pub total_requests: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
    pub breakdown: String,
    pub updated_at: DateTime<Utc>,
}

/// Fetch one date's aggregate inside the collector transaction
pub async fn get_tx(
    conn: &mut SqliteConnection,
    date: NaiveDate,
) -> Result<Option<DailyUsageRow>> {
    let row = sqlx::query_as::<_, DailyUsageRow>("SELECT * FROM daily_usage WHERE date = $1")
        .bind(date)
        .fetch_optional(conn)
        .await?;
    Ok(row)
}

/// Fetch one date's aggregate
pub async fn get(pool: &SqlitePool, date: NaiveDate) -> Result<Option<DailyUsageRow>> {
    let row = sqlx::query_as::<_, DailyUsageRow>("SELECT * FROM daily_usage WHERE date = $1")
        .bind(date)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Upsert a date's aggregate with fully recomputed totals and breakdown
pub async fn upsert(conn: &mut SqliteConnection, row: &DailyUsageRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO daily_usage
            (date, total_requests, success_count, failure_count,
             total_tokens, total_cost_usd, breakdown, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (date) DO UPDATE SET
            total_requests = excluded.total_requests,
            success_count = excluded.success_count,
            failure_count = excluded.failure_count,
            total_tokens = excluded.total_tokens,
            total_cost_usd = excluded.total_cost_usd,
            breakdown = excluded.breakdown,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(row.date)
    .bind(row.total_requests)
    .bind(row.success_count)
    .bind(row.failure_count)
    .bind(row.total_tokens)
    .bind(row.total_cost_usd)
    .bind(&row.breakdown)
    .bind(row.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Aggregates for an inclusive date range, oldest first
pub async fn range(
    pool: &SqlitePool,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<DailyUsageRow>> {
    let rows = sqlx::query_as::<_, DailyUsageRow>(
        "SELECT * FROM daily_usage WHERE date >= $1 AND date <= $2 ORDER BY date ASC",
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
