//! Snapshot rows: one observation of upstream cumulative counters

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};

use crate::error::Result;

/// A stored observation of the upstream cumulative counters. Append-only;
/// only `cumulative_cost_usd` is finalised once, at ingest time.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SnapshotRow {
    pub id: i64,
    pub captured_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub raw_payload: String,
    pub total_requests: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub total_tokens: i64,
    pub cumulative_cost_usd: f64,
}

/// Values for a snapshot insert
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub captured_at: DateTime<Utc>,
    pub raw_payload: String,
    pub total_requests: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub total_tokens: i64,
    pub cumulative_cost_usd: f64,
}

/// Insert a snapshot inside the caller's transaction, returning its id
pub async fn insert(conn: &mut SqliteConnection, snapshot: &NewSnapshot) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO usage_snapshots
            (captured_at, raw_payload, total_requests, success_count,
             failure_count, total_tokens, cumulative_cost_usd)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(snapshot.captured_at)
    .bind(&snapshot.raw_payload)
    .bind(snapshot.total_requests)
    .bind(snapshot.success_count)
    .bind(snapshot.failure_count)
    .bind(snapshot.total_tokens)
    .bind(snapshot.cumulative_cost_usd)
    .fetch_one(conn)
    .await?;

    Ok(row.get::<i64, _>(0))
}

/// Latest snapshot by insertion order
pub async fn latest(pool: &SqlitePool) -> Result<Option<SnapshotRow>> {
    let row = sqlx::query_as::<_, SnapshotRow>(
        "SELECT * FROM usage_snapshots ORDER BY id DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// The snapshot inserted before `snapshot_id`, if any.
///
/// Called from inside the collector transaction after the current snapshot
/// has been written, so it must run on the same connection.
pub async fn previous(
    conn: &mut SqliteConnection,
    snapshot_id: i64,
) -> Result<Option<SnapshotRow>> {
    let row = sqlx::query_as::<_, SnapshotRow>(
        "SELECT * FROM usage_snapshots WHERE id < $1 ORDER BY id DESC LIMIT 1",
    )
    .bind(snapshot_id)
    .fetch_optional(conn)
    .await?;
    Ok(row)
}

/// Snapshots captured within `[lo, hi)`, oldest first
pub async fn in_range(
    pool: &SqlitePool,
    lo: DateTime<Utc>,
    hi: DateTime<Utc>,
) -> Result<Vec<SnapshotRow>> {
    let rows = sqlx::query_as::<_, SnapshotRow>(
        r#"
        SELECT * FROM usage_snapshots
        WHERE captured_at >= $1 AND captured_at < $2
        ORDER BY id ASC
        "#,
    )
    .bind(lo)
    .bind(hi)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Cumulative cost recorded by the most recent snapshot, 0 if none
pub async fn last_cumulative_cost(conn: &mut SqliteConnection) -> Result<f64> {
    let row = sqlx::query(
        "SELECT cumulative_cost_usd FROM usage_snapshots ORDER BY id DESC LIMIT 1",
    )
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|r| r.get::<f64, _>(0)).unwrap_or(0.0))
}
