#![allow(dead_code)]

//! Shared fixtures for integration tests: a file-backed store with the
//! schema applied, plus helpers to seed observations.

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use cap_collector::store::{model_usage, snapshots, NewModelUsage, NewSnapshot};
use cap_collector::Database;

pub struct TestStore {
    pub db: Database,
    _dir: TempDir,
}

pub async fn test_store() -> TestStore {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("usage.db");
    let db = Database::open(path.to_str().expect("utf-8 path"))
        .await
        .expect("open database");
    db.initialize().await.expect("run migrations");
    TestStore { db, _dir: dir }
}

/// One seeded (endpoint, model) observation
pub struct SeedRow {
    pub endpoint: &'static str,
    pub model: &'static str,
    pub requests: i64,
    pub tokens: i64,
    pub cost: f64,
}

/// Insert a snapshot with model rows at a fixed timestamp, bypassing the
/// delta engine (for reconciler tests that need precise row placement).
pub async fn seed_observation(db: &Database, captured_at: DateTime<Utc>, rows: &[SeedRow]) {
    let mut tx = db.pool().begin().await.expect("begin");

    let total_requests: i64 = rows.iter().map(|r| r.requests).sum();
    let total_tokens: i64 = rows.iter().map(|r| r.tokens).sum();

    let snapshot_id = snapshots::insert(
        &mut *tx,
        &NewSnapshot {
            captured_at,
            raw_payload: "{}".to_string(),
            total_requests,
            success_count: total_requests,
            failure_count: 0,
            total_tokens,
            cumulative_cost_usd: rows.iter().map(|r| r.cost).sum(),
        },
    )
    .await
    .expect("insert snapshot");

    let new_rows: Vec<NewModelUsage> = rows
        .iter()
        .map(|r| NewModelUsage {
            api_endpoint: r.endpoint.to_string(),
            model_name: r.model.to_string(),
            request_count: r.requests,
            input_tokens: r.tokens * 6 / 10,
            output_tokens: r.tokens - r.tokens * 6 / 10,
            total_tokens: r.tokens,
            estimated_cost_usd: r.cost,
        })
        .collect();

    model_usage::insert_all(&mut *tx, snapshot_id, captured_at, &new_rows)
        .await
        .expect("insert model rows");

    tx.commit().await.expect("commit");
}
