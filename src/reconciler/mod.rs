//! Rate-limit reconciliation: sum usage inside each configured window and
//! derive the budget status
//!
//! Usage is computed from cumulative per-model rows as latest-minus-baseline.
//! When the last snapshot before the window is far older than the first one
//! inside it, a synthetic baseline is interpolated at the window boundary so
//! an idle gap does not surface as in-window usage.

pub mod window;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, FixedOffset, Utc};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::error::Result;
use crate::store::{model_usage, rate_limits, RateLimitConfigRow, RateLimitStatusRow};

use self::window::{effective_start, natural_window};

/// Per-model cumulative observation inside a usage computation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCounters {
    pub tokens: i64,
    pub requests: i64,
}

/// Summed usage for one config's window
#[derive(Debug, Clone, Default)]
pub struct WindowUsage {
    pub tokens: i64,
    pub requests: i64,
    pub skipped: Vec<String>,
}

/// Outcome of one reconciler pass
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub configs: usize,
    pub failures: usize,
}

pub struct Reconciler {
    pool: SqlitePool,
    offset: FixedOffset,
    gap_threshold: Duration,
    token_threshold: i64,
    token_tolerance: i64,
}

impl Reconciler {
    pub fn new(pool: SqlitePool, config: &Config) -> Self {
        Self {
            pool,
            offset: config.local_offset(),
            gap_threshold: Duration::minutes(config.gap_threshold_minutes),
            token_threshold: config.false_start_token_threshold,
            token_tolerance: config.false_start_token_tolerance,
        }
    }

    /// Reconcile every config at the current time
    pub async fn run(&self) -> Result<ReconcileSummary> {
        self.run_at(Utc::now()).await
    }

    /// Reconcile every config. Per-config failures are isolated: they are
    /// counted and the pass continues.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<ReconcileSummary> {
        let configs = rate_limits::list_configs(&self.pool).await?;
        let mut summary = ReconcileSummary {
            configs: configs.len(),
            ..Default::default()
        };

        let mut skipped_models: BTreeSet<String> = BTreeSet::new();
        for config in &configs {
            match self.reconcile_config(config, now).await {
                Ok(usage) => skipped_models.extend(usage.skipped),
                Err(e) => {
                    tracing::debug!(config_id = config.id, "Reconcile failed: {}", e);
                    summary.failures += 1;
                }
            }
        }

        if !skipped_models.is_empty() {
            tracing::warn!(
                models = %skipped_models.into_iter().collect::<Vec<_>>().join(", "),
                "Models skipped by the window false-start filter"
            );
        }
        if summary.failures > 0 {
            tracing::warn!(
                "{}/{} rate limit configs failed to reconcile",
                summary.failures,
                summary.configs
            );
        }

        Ok(summary)
    }

    /// Compute and persist one config's status; returns the window usage
    pub async fn reconcile_config(
        &self,
        config: &RateLimitConfigRow,
        now: DateTime<Utc>,
    ) -> Result<WindowUsage> {
        let bounds = natural_window(config.strategy(), config.window_minutes, now, self.offset);
        let start = effective_start(bounds.start, config.reset_anchor_at);

        let usage = self
            .usage_in_window(&config.model_pattern, start)
            .await?;

        let status = build_status(config, &usage, start, bounds.next_reset, now);
        rate_limits::upsert_status(&self.pool, &status).await?;

        Ok(usage)
    }

    /// Sum per-model usage between a baseline at/around `window_start` and
    /// the latest observation
    async fn usage_in_window(&self, pattern: &str, window_start: DateTime<Utc>) -> Result<WindowUsage> {
        let Some(latest) = model_usage::latest_time_matching(&self.pool, pattern).await? else {
            return Ok(WindowUsage::default());
        };
        // No activity inside the window at all.
        if latest < window_start {
            return Ok(WindowUsage::default());
        }

        let curr_map = self.counters_at(pattern, latest).await?;

        let baseline_time = model_usage::last_time_before(&self.pool, pattern, window_start).await?;
        let first_inner_time =
            model_usage::first_time_at_or_after(&self.pool, pattern, window_start).await?;

        let baseline_map = match (baseline_time, first_inner_time) {
            (Some(base_t), Some(inner_t)) if inner_t - base_t > self.gap_threshold => {
                // The idle gap straddling the boundary is too wide; take a
                // synthetic baseline at window_start by linear interpolation.
                let base = self.counters_at(pattern, base_t).await?;
                let inner = self.counters_at(pattern, inner_t).await?;
                interpolate(&base, &inner, base_t, inner_t, window_start)
            }
            (Some(base_t), _) => self.counters_at(pattern, base_t).await?,
            // Scraping started inside the window: optimistically treat the
            // first inner observation as the baseline.
            (None, Some(inner_t)) => self.counters_at(pattern, inner_t).await?,
            (None, None) => BTreeMap::new(),
        };

        let mut usage = WindowUsage::default();
        let models: BTreeSet<&String> = curr_map.keys().chain(baseline_map.keys()).collect();
        for model in models {
            let curr = curr_map.get(model).copied().unwrap_or_default();
            let base = baseline_map.get(model).copied().unwrap_or_default();

            let mut delta = ModelCounters {
                tokens: curr.tokens - base.tokens,
                requests: curr.requests - base.requests,
            };
            if delta.tokens < 0 || delta.requests < 0 {
                delta = curr;
            }

            // A model absent from the baseline whose whole cumulative count
            // lands in one delta pre-dates our window; skip it.
            if base == ModelCounters::default()
                && delta.tokens > self.token_threshold
                && (delta.tokens - curr.tokens).abs() < self.token_tolerance
            {
                usage.skipped.push(model.clone());
                continue;
            }

            usage.tokens += delta.tokens.max(0);
            usage.requests += delta.requests.max(0);
        }

        Ok(usage)
    }

    async fn counters_at(
        &self,
        pattern: &str,
        at: DateTime<Utc>,
    ) -> Result<BTreeMap<String, ModelCounters>> {
        let totals = model_usage::totals_at(&self.pool, pattern, at).await?;
        Ok(totals
            .into_iter()
            .map(|t| {
                (
                    t.model_name,
                    ModelCounters {
                        tokens: t.tokens,
                        requests: t.requests,
                    },
                )
            })
            .collect())
    }
}

/// Linear per-model interpolation of a synthetic baseline at `at`, between
/// observations at `base_t` and `inner_t`
fn interpolate(
    base: &BTreeMap<String, ModelCounters>,
    inner: &BTreeMap<String, ModelCounters>,
    base_t: DateTime<Utc>,
    inner_t: DateTime<Utc>,
    at: DateTime<Utc>,
) -> BTreeMap<String, ModelCounters> {
    let span = (inner_t - base_t).num_seconds() as f64;
    let ratio = if span <= 0.0 {
        1.0
    } else {
        ((at - base_t).num_seconds() as f64 / span).clamp(0.0, 1.0)
    };

    let models: BTreeSet<&String> = base.keys().chain(inner.keys()).collect();
    models
        .into_iter()
        .map(|model| {
            let b = base.get(model).copied().unwrap_or_default();
            let i = inner.get(model).copied().unwrap_or_default();
            let counters = ModelCounters {
                tokens: b.tokens + ((i.tokens - b.tokens) as f64 * ratio).round() as i64,
                requests: b.requests + ((i.requests - b.requests) as f64 * ratio).round() as i64,
            };
            (model.clone(), counters)
        })
        .collect()
}

/// Derive the status row: remaining, percentage and label prefer the token
/// dimension when both limits are declared
pub fn build_status(
    config: &RateLimitConfigRow,
    usage: &WindowUsage,
    window_start: DateTime<Utc>,
    next_reset: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> RateLimitStatusRow {
    let token_limit = config.token_limit.filter(|l| *l > 0);
    let request_limit = config.request_limit.filter(|l| *l > 0);

    let remaining_tokens = token_limit.map(|l| (l - usage.tokens).max(0));
    let remaining_requests = request_limit.map(|l| (l - usage.requests).max(0));

    let (percentage, status_label) = match (token_limit, request_limit) {
        (Some(limit), _) => {
            percentage_label(remaining_tokens.unwrap_or(0), limit, usage.tokens, "tokens")
        }
        (None, Some(limit)) => percentage_label(
            remaining_requests.unwrap_or(0),
            limit,
            usage.requests,
            "requests",
        ),
        (None, None) => (100, "informational".to_string()),
    };

    RateLimitStatusRow {
        config_id: config.id,
        used_tokens: usage.tokens,
        used_requests: usage.requests,
        remaining_tokens,
        remaining_requests,
        percentage,
        status_label,
        window_start,
        next_reset,
        last_updated: now,
    }
}

fn percentage_label(remaining: i64, limit: i64, used: i64, unit: &str) -> (i64, String) {
    let percentage = ((remaining as f64 / limit as f64) * 100.0).floor() as i64;
    let percentage = percentage.clamp(0, 100);
    let word = if percentage == 0 {
        "exceeded"
    } else if percentage < 20 {
        "warning"
    } else {
        "ok"
    };
    (percentage, format!("{word}: {used}/{limit} {unit} used"))
}
