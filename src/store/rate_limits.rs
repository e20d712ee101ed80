//! Rate limit configs (user-declared budgets) and their derived statuses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, SqlitePool};

use crate::error::Result;

/// How a budget window resets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetStrategy {
    Daily,
    Weekly,
    Rolling,
}

impl ResetStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetStrategy::Daily => "daily",
            ResetStrategy::Weekly => "weekly",
            ResetStrategy::Rolling => "rolling",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "daily" => ResetStrategy::Daily,
            "weekly" => ResetStrategy::Weekly,
            _ => ResetStrategy::Rolling,
        }
    }
}

impl std::fmt::Display for ResetStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A declarative budget over a model-name pattern
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RateLimitConfigRow {
    pub id: i64,
    pub model_pattern: String,
    pub window_minutes: i64,
    pub reset_strategy: String,
    pub token_limit: Option<i64>,
    pub request_limit: Option<i64>,
    pub reset_anchor_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RateLimitConfigRow {
    pub fn strategy(&self) -> ResetStrategy {
        ResetStrategy::parse(&self.reset_strategy)
    }

    /// A config with neither limit set positive is informational only
    pub fn is_enforced(&self) -> bool {
        self.token_limit.unwrap_or(0) > 0 || self.request_limit.unwrap_or(0) > 0
    }
}

/// Values for creating or replacing a config
#[derive(Debug, Clone, Deserialize)]
pub struct NewRateLimitConfig {
    pub model_pattern: String,
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    #[serde(default)]
    pub reset_strategy: Option<ResetStrategy>,
    pub token_limit: Option<i64>,
    pub request_limit: Option<i64>,
}

fn default_window_minutes() -> i64 {
    1440
}

/// Derived status, replaced whole-row by each reconciler pass
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RateLimitStatusRow {
    pub config_id: i64,
    pub used_tokens: i64,
    pub used_requests: i64,
    pub remaining_tokens: Option<i64>,
    pub remaining_requests: Option<i64>,
    pub percentage: i64,
    pub status_label: String,
    pub window_start: DateTime<Utc>,
    pub next_reset: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

pub async fn list_configs(pool: &SqlitePool) -> Result<Vec<RateLimitConfigRow>> {
    let rows = sqlx::query_as::<_, RateLimitConfigRow>(
        "SELECT * FROM rate_limit_configs ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_config(pool: &SqlitePool, id: i64) -> Result<Option<RateLimitConfigRow>> {
    let row = sqlx::query_as::<_, RateLimitConfigRow>(
        "SELECT * FROM rate_limit_configs WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn create_config(
    pool: &SqlitePool,
    new: &NewRateLimitConfig,
    now: DateTime<Utc>,
) -> Result<RateLimitConfigRow> {
    let strategy = new.reset_strategy.unwrap_or(ResetStrategy::Rolling);
    let id = sqlx::query(
        r#"
        INSERT INTO rate_limit_configs
            (model_pattern, window_minutes, reset_strategy,
             token_limit, request_limit, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $6)
        RETURNING id
        "#,
    )
    .bind(&new.model_pattern)
    .bind(new.window_minutes)
    .bind(strategy.as_str())
    .bind(new.token_limit)
    .bind(new.request_limit)
    .bind(now)
    .fetch_one(pool)
    .await?
    .get::<i64, _>(0);

    get_config(pool, id)
        .await?
        .ok_or_else(|| crate::error::Error::Database("Config vanished after insert".into()))
}

pub async fn update_config(
    pool: &SqlitePool,
    id: i64,
    new: &NewRateLimitConfig,
    now: DateTime<Utc>,
) -> Result<Option<RateLimitConfigRow>> {
    let strategy = new.reset_strategy.unwrap_or(ResetStrategy::Rolling);
    let result = sqlx::query(
        r#"
        UPDATE rate_limit_configs SET
            model_pattern = $2,
            window_minutes = $3,
            reset_strategy = $4,
            token_limit = $5,
            request_limit = $6,
            updated_at = $7
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(&new.model_pattern)
    .bind(new.window_minutes)
    .bind(strategy.as_str())
    .bind(new.token_limit)
    .bind(new.request_limit)
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    get_config(pool, id).await
}

pub async fn delete_config(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM rate_limit_configs WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Stamp the manual-reset anchor on a config. The reconciler uses it as the
/// effective window start until the natural window start overtakes it.
pub async fn set_reset_anchor(pool: &SqlitePool, id: i64, anchor: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE rate_limit_configs SET reset_anchor_at = $2, updated_at = $2 WHERE id = $1",
    )
    .bind(id)
    .bind(anchor)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_status(pool: &SqlitePool, config_id: i64) -> Result<Option<RateLimitStatusRow>> {
    let row = sqlx::query_as::<_, RateLimitStatusRow>(
        r#"
        SELECT config_id, used_tokens, used_requests, remaining_tokens,
               remaining_requests, percentage, status_label, window_start,
               next_reset, last_updated
        FROM rate_limit_status WHERE config_id = $1
        "#,
    )
    .bind(config_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Replace the whole status row for a config
pub async fn upsert_status(pool: &SqlitePool, status: &RateLimitStatusRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO rate_limit_status
            (config_id, used_tokens, used_requests, remaining_tokens,
             remaining_requests, percentage, status_label, window_start,
             next_reset, last_updated)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (config_id) DO UPDATE SET
            used_tokens = excluded.used_tokens,
            used_requests = excluded.used_requests,
            remaining_tokens = excluded.remaining_tokens,
            remaining_requests = excluded.remaining_requests,
            percentage = excluded.percentage,
            status_label = excluded.status_label,
            window_start = excluded.window_start,
            next_reset = excluded.next_reset,
            last_updated = excluded.last_updated
        "#,
    )
    .bind(status.config_id)
    .bind(status.used_tokens)
    .bind(status.used_requests)
    .bind(status.remaining_tokens)
    .bind(status.remaining_requests)
    .bind(status.percentage)
    .bind(&status.status_label)
    .bind(status.window_start)
    .bind(status.next_reset)
    .bind(status.last_updated)
    .execute(pool)
    .await?;
    Ok(())
}
