//! Snapshot ingestion: price the report, persist it, merge the delta into
//! today's aggregate
//!
//! The whole pass is one transaction; a failure anywhere rolls back the
//! snapshot, its model rows and the daily merge together, and the next pass
//! retries against a larger cumulative report.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use sqlx::SqlitePool;

use crate::collector::breakdown::Breakdown;
use crate::collector::delta::{self, CorrectorSettings, PricedKeyUsage, UsageTotals};
use crate::collector::report::UsageReport;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pricing::PricingOracle;
use crate::store::{daily, model_usage, snapshots, DailyUsageRow, NewModelUsage, NewSnapshot};

/// Outcome of one ingest pass, for logging
#[derive(Debug)]
pub struct PassSummary {
    pub snapshot_id: i64,
    pub date: NaiveDate,
    pub requests: i64,
    pub tokens: i64,
    pub cost: f64,
    pub skipped_models: usize,
    pub restarted: bool,
}

pub struct DeltaEngine {
    pool: SqlitePool,
    oracle: Arc<PricingOracle>,
    settings: CorrectorSettings,
    offset: FixedOffset,
}

impl DeltaEngine {
    pub fn new(pool: SqlitePool, oracle: Arc<PricingOracle>, config: &Config) -> Self {
        Self {
            pool,
            oracle,
            settings: CorrectorSettings {
                false_start_cost_threshold_usd: config.false_start_cost_threshold_usd,
                false_start_cost_tolerance_usd: config.false_start_cost_tolerance_usd,
            },
            offset: config.local_offset(),
        }
    }

    /// Ingest one cumulative report at the current server time
    pub async fn ingest(&self, report: &UsageReport, raw_payload: &str) -> Result<PassSummary> {
        self.ingest_at(report, raw_payload, Utc::now()).await
    }

    /// Ingest one cumulative report at an explicit capture time
    pub async fn ingest_at(
        &self,
        report: &UsageReport,
        raw_payload: &str,
        now: DateTime<Utc>,
    ) -> Result<PassSummary> {
        // Cost tabulation happens before the transaction opens; the oracle
        // may hit the network.
        let (priced, new_rows) = self.tabulate(report).await;
        let snapshot_cost: f64 = priced.iter().map(|r| r.cost).sum();

        let current_totals = UsageTotals {
            requests: report.total_requests,
            success: report.success_count,
            failure: report.failure_count,
            tokens: report.total_tokens,
        };

        let mut tx = self.pool.begin().await?;

        let prev_cumulative = snapshots::last_cumulative_cost(&mut *tx).await?;
        let snapshot_id = snapshots::insert(
            &mut *tx,
            &NewSnapshot {
                captured_at: now,
                raw_payload: raw_payload.to_string(),
                total_requests: report.total_requests,
                success_count: report.success_count,
                failure_count: report.failure_count,
                total_tokens: report.total_tokens,
                cumulative_cost_usd: prev_cumulative + snapshot_cost,
            },
        )
        .await?;
        model_usage::insert_all(&mut *tx, snapshot_id, now, &new_rows).await?;

        let previous = snapshots::previous(&mut *tx, snapshot_id).await?;
        let prev_state = match &previous {
            Some(prev) => {
                let rows = model_usage::for_snapshot_tx(&mut *tx, prev.id).await?;
                Some((
                    UsageTotals {
                        requests: prev.total_requests,
                        success: prev.success_count,
                        failure: prev.failure_count,
                        tokens: prev.total_tokens,
                    },
                    rows.into_iter()
                        .map(|r| PricedKeyUsage {
                            endpoint: r.api_endpoint,
                            model: r.model_name,
                            requests: r.request_count,
                            tokens: r.total_tokens,
                            input_tokens: r.input_tokens,
                            output_tokens: r.output_tokens,
                            cost: r.estimated_cost_usd,
                        })
                        .collect::<Vec<_>>(),
                ))
            }
            None => None,
        };

        let outcome = delta::compute(
            current_totals,
            &priced,
            prev_state.as_ref().map(|(t, r)| (t, r.as_slice())),
            &self.settings,
        );

        if !outcome.skipped.is_empty() {
            tracing::warn!(
                models = %outcome.skipped.join(", "),
                "Skipping false-start models whose full history appeared in one delta"
            );
        }
        if outcome.restarted {
            tracing::info!("Upstream counters rolled back; treating current values as the increment");
        }

        let date = now.with_timezone(&self.offset).date_naive();
        let row = self.merged_daily_row(&mut *tx, date, &outcome, now).await?;
        daily::upsert(&mut *tx, &row).await?;

        tx.commit().await?;

        Ok(PassSummary {
            snapshot_id,
            date,
            requests: outcome.totals.requests,
            tokens: outcome.totals.tokens,
            cost: outcome.totals.cost,
            skipped_models: outcome.skipped.len(),
            restarted: outcome.restarted,
        })
    }

    /// Price every (endpoint, model) in the report
    async fn tabulate(
        &self,
        report: &UsageReport,
    ) -> (Vec<PricedKeyUsage>, Vec<NewModelUsage>) {
        let mut priced = Vec::new();
        let mut rows = Vec::new();

        for (endpoint, api) in &report.apis {
            for (model, usage) in &api.models {
                let (input_tokens, output_tokens) = usage.token_sums();
                let cost = self.oracle.price(model, input_tokens, output_tokens).await;

                priced.push(PricedKeyUsage {
                    endpoint: endpoint.clone(),
                    model: model.clone(),
                    requests: usage.total_requests,
                    tokens: usage.total_tokens,
                    input_tokens,
                    output_tokens,
                    cost,
                });
                rows.push(NewModelUsage {
                    api_endpoint: endpoint.clone(),
                    model_name: model.clone(),
                    request_count: usage.total_requests,
                    input_tokens,
                    output_tokens,
                    total_tokens: usage.total_tokens,
                    estimated_cost_usd: cost,
                });
            }
        }

        (priced, rows)
    }

    /// Read-merge-recompute today's aggregate row. Top-level totals are
    /// recomputed from the merged breakdown whenever it is non-zero, so the
    /// row stays internally consistent by construction.
    async fn merged_daily_row(
        &self,
        tx: &mut sqlx::SqliteConnection,
        date: NaiveDate,
        outcome: &delta::DeltaOutcome,
        now: DateTime<Utc>,
    ) -> Result<DailyUsageRow> {
        let existing = daily::get_tx(tx, date).await?;
        let (mut breakdown, prev_success, prev_failure, prev_requests, prev_tokens, prev_cost) =
            match &existing {
                Some(row) => (
                    Breakdown::from_column(&row.breakdown),
                    row.success_count,
                    row.failure_count,
                    row.total_requests,
                    row.total_tokens,
                    row.total_cost_usd,
                ),
                None => (Breakdown::default(), 0, 0, 0, 0, 0.0),
            };

        breakdown.merge(&outcome.breakdown);
        let merged = breakdown.totals();

        let (total_requests, total_tokens, total_cost) =
            if merged.requests > 0 || merged.tokens > 0 || merged.cost > 0.0 {
                (merged.requests, merged.tokens, merged.cost)
            } else {
                (
                    prev_requests + outcome.coarse.requests,
                    prev_tokens + outcome.coarse.tokens,
                    prev_cost + outcome.coarse.cost,
                )
            };

        // The totals must stay reproducible from the breakdown.
        if !breakdown.is_empty()
            && (total_requests != merged.requests
                || total_tokens != merged.tokens
                || (total_cost - merged.cost).abs() > 1e-9)
        {
            return Err(Error::Invariant(format!(
                "daily totals diverged from breakdown for {date}: \
                 {total_requests}/{total_tokens}/{total_cost} vs \
                 {}/{}/{}",
                merged.requests, merged.tokens, merged.cost
            )));
        }

        Ok(DailyUsageRow {
            date,
            total_requests,
            success_count: prev_success + outcome.totals.success,
            failure_count: prev_failure + outcome.totals.failure,
            total_tokens,
            total_cost_usd: total_cost,
            breakdown: breakdown.to_column()?,
            updated_at: now,
        })
    }
}
