//! Pure delta computation between two cumulative observations
//!
//! Input is the current snapshot's totals and priced per-(endpoint, model)
//! rows plus the previous snapshot's equivalents; output is the increment to
//! apply to today's aggregate. No I/O happens here, which is what makes the
//! corrector behaviour (upstream restarts, false starts, dropped keys)
//! directly testable.

use std::collections::{BTreeMap, BTreeSet};

use super::breakdown::Breakdown;

/// Global cumulative counters of one observation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub requests: i64,
    pub success: i64,
    pub failure: i64,
    pub tokens: i64,
}

/// One cumulative per-(endpoint, model) observation with its priced cost
#[derive(Debug, Clone)]
pub struct PricedKeyUsage {
    pub endpoint: String,
    pub model: String,
    pub requests: i64,
    pub tokens: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
}

/// Thresholds gating the false-start filter
#[derive(Debug, Clone, Copy)]
pub struct CorrectorSettings {
    pub false_start_cost_threshold_usd: f64,
    pub false_start_cost_tolerance_usd: f64,
}

impl Default for CorrectorSettings {
    fn default() -> Self {
        Self {
            false_start_cost_threshold_usd: 10.0,
            false_start_cost_tolerance_usd: 0.1,
        }
    }
}

/// The computed increment for this pass
#[derive(Debug, Clone, Copy, Default)]
pub struct TotalsDelta {
    pub requests: i64,
    pub success: i64,
    pub failure: i64,
    pub tokens: i64,
    pub cost: f64,
}

#[derive(Debug, Default)]
pub struct DeltaOutcome {
    /// Final global delta: requests/tokens/cost from the granular side
    pub totals: TotalsDelta,
    /// Coarse counter delta after restart handling and false-start
    /// adjustment; the daily merge falls back to it when no granular
    /// breakdown survived
    pub coarse: TotalsDelta,
    pub breakdown: Breakdown,
    /// Models dropped by the false-start filter, for logging
    pub skipped: Vec<String>,
    /// Whether the coarse counters indicated an upstream counter rollback
    pub restarted: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyDelta {
    requests: i64,
    tokens: i64,
    input_tokens: i64,
    output_tokens: i64,
    cost: f64,
}

fn keyed<'a>(rows: &'a [PricedKeyUsage]) -> BTreeMap<(&'a str, &'a str), &'a PricedKeyUsage> {
    rows.iter()
        .map(|r| ((r.endpoint.as_str(), r.model.as_str()), r))
        .collect()
}

/// Compute the increment between the previous observation and the current
/// one.
///
/// With no previous observation the current values are their own delta. A
/// negative coarse request/token delta means the upstream counters rolled
/// back (restart), in which case the entire current value is the increment;
/// the same rule is applied per key. A key whose cost delta exceeds the
/// threshold while matching its own current cumulative cost is a false
/// start (a pre-existing model's history surfacing at once) and is dropped,
/// with the coarse counters adjusted to stay consistent.
pub fn compute(
    current_totals: UsageTotals,
    current_rows: &[PricedKeyUsage],
    previous: Option<(&UsageTotals, &[PricedKeyUsage])>,
    settings: &CorrectorSettings,
) -> DeltaOutcome {
    let current_cost: f64 = current_rows.iter().map(|r| r.cost).sum();

    let Some((prev_totals, prev_rows)) = previous else {
        // First observation: no correctors apply, everything is new.
        let mut breakdown = Breakdown::default();
        for row in current_rows {
            if row.requests > 0 || row.cost > 0.0 {
                breakdown.add_key(
                    &row.endpoint,
                    &row.model,
                    row.requests,
                    row.tokens,
                    row.cost,
                    row.input_tokens.max(0),
                    row.output_tokens.max(0),
                );
            }
        }
        let totals = TotalsDelta {
            requests: current_totals.requests,
            success: current_totals.success,
            failure: current_totals.failure,
            tokens: current_totals.tokens,
            cost: current_cost,
        };
        return DeltaOutcome {
            totals,
            coarse: totals,
            breakdown,
            skipped: Vec::new(),
            restarted: false,
        };
    };

    // Coarse delta over the global counters.
    let prev_cost: f64 = prev_rows.iter().map(|r| r.cost).sum();
    let mut d_requests = current_totals.requests - prev_totals.requests;
    let mut d_tokens = current_totals.tokens - prev_totals.tokens;
    let mut d_success = current_totals.success - prev_totals.success;
    let mut d_failure = current_totals.failure - prev_totals.failure;
    let mut d_cost = current_cost - prev_cost;

    let restarted = d_requests < 0 || d_tokens < 0;
    if restarted {
        d_requests = current_totals.requests;
        d_tokens = current_totals.tokens;
        d_success = current_totals.success;
        d_failure = current_totals.failure;
        d_cost = current_cost;
    }

    // Granular delta per (endpoint, model).
    let prev_by = keyed(prev_rows);
    let curr_by = keyed(current_rows);
    let keys: BTreeSet<_> = prev_by.keys().chain(curr_by.keys()).copied().collect();

    let mut breakdown = Breakdown::default();
    let mut skipped = Vec::new();

    for key in keys {
        let curr = curr_by.get(&key);
        let prev = prev_by.get(&key);

        let curr_delta = |r: &PricedKeyUsage| KeyDelta {
            requests: r.requests,
            tokens: r.tokens,
            input_tokens: r.input_tokens,
            output_tokens: r.output_tokens,
            cost: r.cost,
        };

        let mut delta = match (curr, prev) {
            (Some(c), Some(p)) => KeyDelta {
                requests: c.requests - p.requests,
                tokens: c.tokens - p.tokens,
                input_tokens: c.input_tokens - p.input_tokens,
                output_tokens: c.output_tokens - p.output_tokens,
                cost: c.cost - p.cost,
            },
            (Some(c), None) => curr_delta(c),
            // Key vanished from the report; nothing to account.
            (None, Some(_)) => continue,
            (None, None) => continue,
        };

        if let Some(c) = curr {
            // Per-key restart: the key's own counters rolled back.
            if delta.requests < 0 || delta.tokens < 0 {
                delta = curr_delta(c);
            }

            // False start: the model's entire cumulative cost appears as a
            // single delta, meaning its history predates our scraping and is
            // only now being reported.
            if delta.cost > settings.false_start_cost_threshold_usd
                && (delta.cost - c.cost).abs() < settings.false_start_cost_tolerance_usd
            {
                d_requests -= delta.requests;
                d_tokens -= delta.tokens;
                d_cost -= delta.cost;
                skipped.push(c.model.clone());
                continue;
            }
        }

        if delta.requests > 0 || delta.cost > 0.0 {
            breakdown.add_key(
                key.0,
                key.1,
                delta.requests,
                delta.tokens,
                delta.cost,
                delta.input_tokens.max(0),
                delta.output_tokens.max(0),
            );
        }
    }

    // Reconcile global to granular: success/failure are not tracked per key,
    // so when keys were dropped they are attenuated by the surviving share;
    // requests/tokens/cost come from the granular side outright.
    let safe = breakdown.totals();
    if d_requests > 0 {
        let ratio = safe.requests as f64 / d_requests as f64;
        if ratio < 0.99 {
            d_success = (d_success as f64 * ratio).round() as i64;
            d_failure = (d_failure as f64 * ratio).round() as i64;
        }
    }

    let success = d_success.max(0);
    let failure = d_failure.max(0);

    DeltaOutcome {
        totals: TotalsDelta {
            requests: safe.requests,
            success,
            failure,
            tokens: safe.tokens,
            cost: safe.cost,
        },
        coarse: TotalsDelta {
            requests: d_requests.max(0),
            success,
            failure,
            tokens: d_tokens.max(0),
            cost: d_cost.max(0.0),
        },
        breakdown,
        skipped,
        restarted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(endpoint: &str, model: &str, requests: i64, tokens: i64, cost: f64) -> PricedKeyUsage {
        PricedKeyUsage {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            requests,
            tokens,
            input_tokens: tokens * 6 / 10,
            output_tokens: tokens * 4 / 10,
            cost,
        }
    }

    fn settings() -> CorrectorSettings {
        CorrectorSettings::default()
    }

    #[test]
    fn test_first_observation_is_its_own_delta() {
        let totals = UsageTotals {
            requests: 10,
            success: 10,
            failure: 0,
            tokens: 1000,
        };
        let rows = vec![key("chat", "gpt-4", 10, 1000, 0.042)];

        let outcome = compute(totals, &rows, None, &settings());

        assert_eq!(outcome.totals.requests, 10);
        assert_eq!(outcome.totals.tokens, 1000);
        assert!((outcome.totals.cost - 0.042).abs() < 1e-9);
        assert_eq!(outcome.breakdown.models["gpt-4"].requests, 10);
        assert!(!outcome.restarted);
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn test_normal_increment() {
        let prev_totals = UsageTotals {
            requests: 10,
            success: 10,
            failure: 0,
            tokens: 1000,
        };
        let prev_rows = vec![key("chat", "gpt-4", 10, 1000, 0.042)];

        let curr_totals = UsageTotals {
            requests: 15,
            success: 15,
            failure: 0,
            tokens: 1600,
        };
        let curr_rows = vec![key("chat", "gpt-4", 15, 1600, 0.0672)];

        let outcome = compute(
            curr_totals,
            &curr_rows,
            Some((&prev_totals, &prev_rows)),
            &settings(),
        );

        assert_eq!(outcome.totals.requests, 5);
        assert_eq!(outcome.totals.tokens, 600);
        assert!((outcome.totals.cost - 0.0252).abs() < 1e-9);
        assert_eq!(outcome.totals.success, 5);
        assert_eq!(outcome.breakdown.models["gpt-4"].tokens, 600);
    }

    #[test]
    fn test_upstream_restart_uses_current_values() {
        let prev_totals = UsageTotals {
            requests: 15,
            success: 15,
            failure: 0,
            tokens: 1600,
        };
        let prev_rows = vec![key("chat", "gpt-4", 15, 1600, 0.0672)];

        // Upstream restarted: counters rolled back to small values.
        let curr_totals = UsageTotals {
            requests: 2,
            success: 2,
            failure: 0,
            tokens: 200,
        };
        let curr_rows = vec![key("chat", "gpt-4", 2, 200, 0.0084)];

        let outcome = compute(
            curr_totals,
            &curr_rows,
            Some((&prev_totals, &prev_rows)),
            &settings(),
        );

        assert!(outcome.restarted);
        assert_eq!(outcome.totals.requests, 2);
        assert_eq!(outcome.totals.tokens, 200);
        assert_eq!(outcome.totals.success, 2);
        assert!(outcome.totals.cost > 0.0);
        assert_eq!(outcome.breakdown.models["gpt-4"].requests, 2);
    }

    #[test]
    fn test_per_key_restart_with_stable_globals() {
        // One model rolled back while another grew enough to keep the
        // coarse counters non-decreasing.
        let prev_totals = UsageTotals {
            requests: 20,
            success: 20,
            failure: 0,
            tokens: 2000,
        };
        let prev_rows = vec![
            key("chat", "gpt-4", 15, 1500, 0.06),
            key("chat", "sonnet", 5, 500, 0.005),
        ];

        let curr_totals = UsageTotals {
            requests: 23,
            success: 23,
            failure: 0,
            tokens: 2300,
        };
        let curr_rows = vec![
            key("chat", "gpt-4", 20, 2000, 0.08),
            key("chat", "sonnet", 3, 300, 0.003),
        ];

        let outcome = compute(
            curr_totals,
            &curr_rows,
            Some((&prev_totals, &prev_rows)),
            &settings(),
        );

        assert!(!outcome.restarted);
        // gpt-4: normal 5-request delta; sonnet: rolled back, current stands in
        assert_eq!(outcome.breakdown.models["gpt-4"].requests, 5);
        assert_eq!(outcome.breakdown.models["sonnet"].requests, 3);
        assert_eq!(outcome.totals.requests, 8);
    }

    #[test]
    fn test_false_start_model_is_skipped() {
        let prev_totals = UsageTotals {
            requests: 15,
            success: 15,
            failure: 0,
            tokens: 1600,
        };
        let prev_rows = vec![key("chat", "gpt-4", 15, 1600, 0.0672)];

        // claude-opus appears out of nowhere with its whole history:
        // $45 > $10 threshold and the delta equals its current cumulative.
        let curr_totals = UsageTotals {
            requests: 65,
            success: 65,
            failure: 0,
            tokens: 1_001_600,
        };
        let curr_rows = vec![
            key("chat", "gpt-4", 15, 1600, 0.0672),
            key("chat", "claude-opus", 50, 1_000_000, 45.0),
        ];

        let outcome = compute(
            curr_totals,
            &curr_rows,
            Some((&prev_totals, &prev_rows)),
            &settings(),
        );

        assert_eq!(outcome.skipped, vec!["claude-opus".to_string()]);
        assert!(!outcome.breakdown.models.contains_key("claude-opus"));
        assert_eq!(outcome.totals.requests, 0);
        assert_eq!(outcome.totals.tokens, 0);
        assert!(outcome.totals.cost.abs() < 1e-9);
    }

    #[test]
    fn test_genuinely_new_cheap_model_is_kept() {
        let prev_totals = UsageTotals {
            requests: 10,
            success: 10,
            failure: 0,
            tokens: 1000,
        };
        let prev_rows = vec![key("chat", "gpt-4", 10, 1000, 0.042)];

        // New model below the cost threshold: a real first use, not a
        // false start.
        let curr_totals = UsageTotals {
            requests: 12,
            success: 12,
            failure: 0,
            tokens: 1200,
        };
        let curr_rows = vec![
            key("chat", "gpt-4", 10, 1000, 0.042),
            key("chat", "haiku", 2, 200, 0.0006),
        ];

        let outcome = compute(
            curr_totals,
            &curr_rows,
            Some((&prev_totals, &prev_rows)),
            &settings(),
        );

        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.breakdown.models["haiku"].requests, 2);
        assert_eq!(outcome.totals.requests, 2);
    }

    #[test]
    fn test_success_failure_scaled_when_keys_dropped() {
        let prev_totals = UsageTotals {
            requests: 100,
            success: 90,
            failure: 10,
            tokens: 10_000,
        };
        let prev_rows = vec![key("chat", "gpt-4", 100, 10_000, 0.42)];

        // 100 new requests total, but half belong to a skipped false start.
        let curr_totals = UsageTotals {
            requests: 200,
            success: 180,
            failure: 20,
            tokens: 1_010_000,
        };
        let curr_rows = vec![
            key("chat", "gpt-4", 150, 15_000, 0.63),
            key("chat", "claude-opus", 50, 995_000, 44.8),
        ];

        let outcome = compute(
            curr_totals,
            &curr_rows,
            Some((&prev_totals, &prev_rows)),
            &settings(),
        );

        // coarse requests delta 100, minus 50 skipped = 50 surviving;
        // ratio vs the adjusted coarse delta = 50/50 = 1.0, so no scaling
        assert_eq!(outcome.totals.requests, 50);
        assert_eq!(outcome.totals.success, 90);

        // Now a case where the surviving share genuinely shrinks: the
        // skipped key hides extra requests the survivors don't cover.
        let curr_rows = vec![
            key("chat", "gpt-4", 140, 14_000, 0.588),
            key("chat", "claude-opus", 50, 996_000, 44.8),
        ];
        let outcome = compute(
            curr_totals,
            &curr_rows,
            Some((&prev_totals, &prev_rows)),
            &settings(),
        );

        // surviving 40 of adjusted coarse 50 -> ratio 0.8 < 0.99
        assert_eq!(outcome.totals.requests, 40);
        assert_eq!(outcome.totals.success, 72);
        assert_eq!(outcome.totals.failure, 8);
    }

    #[test]
    fn test_vanished_key_contributes_nothing() {
        let prev_totals = UsageTotals {
            requests: 10,
            success: 10,
            failure: 0,
            tokens: 1000,
        };
        let prev_rows = vec![
            key("chat", "gpt-4", 8, 800, 0.03),
            key("chat", "retired-model", 2, 200, 0.002),
        ];

        let curr_totals = UsageTotals {
            requests: 12,
            success: 12,
            failure: 0,
            tokens: 1200,
        };
        let curr_rows = vec![key("chat", "gpt-4", 12, 1200, 0.05)];

        let outcome = compute(
            curr_totals,
            &curr_rows,
            Some((&prev_totals, &prev_rows)),
            &settings(),
        );

        assert!(!outcome.breakdown.models.contains_key("retired-model"));
        assert_eq!(outcome.breakdown.models["gpt-4"].requests, 4);
    }

    #[test]
    fn test_deltas_never_negative() {
        // Mixed rollback: totals decrease (restart), one key decreases.
        let prev_totals = UsageTotals {
            requests: 50,
            success: 45,
            failure: 5,
            tokens: 5000,
        };
        let prev_rows = vec![
            key("chat", "gpt-4", 40, 4000, 0.16),
            key("chat", "sonnet", 10, 1000, 0.01),
        ];

        let curr_totals = UsageTotals {
            requests: 5,
            success: 4,
            failure: 1,
            tokens: 500,
        };
        let curr_rows = vec![key("chat", "gpt-4", 5, 500, 0.02)];

        let outcome = compute(
            curr_totals,
            &curr_rows,
            Some((&prev_totals, &prev_rows)),
            &settings(),
        );

        assert!(outcome.restarted);
        assert!(outcome.totals.requests >= 0);
        assert!(outcome.totals.tokens >= 0);
        assert!(outcome.totals.success >= 0);
        assert!(outcome.totals.failure >= 0);
        assert!(outcome.totals.cost >= 0.0);
        for slice in outcome.breakdown.models.values() {
            assert!(slice.requests >= 0);
            assert!(slice.tokens >= 0);
            assert!(slice.cost >= 0.0);
        }
    }
}
