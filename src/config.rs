//! Configuration for the collector daemon
//!
//! All settings are injected via environment variables at runtime with safe
//! defaults; only the thresholds that gate the accounting correctors are
//! exposed beyond the basics, since operators occasionally need to tune them
//! for unusual upstream deployments.

use anyhow::{Context, Result};
use chrono::FixedOffset;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the upstream proxy exposing the cumulative usage report
    pub cliproxy_url: String,

    /// Optional management key sent as `Authorization: Bearer <key>`
    pub cliproxy_management_key: Option<String>,

    /// Seconds between collector passes, measured from the end of the
    /// previous pass (default: 300)
    pub interval_seconds: u64,

    /// Port for the control/read HTTP surface (default: 5001)
    pub trigger_port: u16,

    /// Local time = UTC + this many hours (default: 7)
    pub timezone_offset_hours: i32,

    /// Path to the SQLite database file
    pub db_path: String,

    /// Optional URL of a remote pricing table; built-in defaults apply
    /// when unset or unreachable
    pub pricing_url: Option<String>,

    /// Pricing table cache TTL in seconds (default: 3600)
    pub pricing_ttl_seconds: u64,

    /// Upstream and pricing fetch timeout in seconds (default: 30)
    pub fetch_timeout_seconds: u64,

    // =========================================================================
    // Accounting correctors
    // =========================================================================

    /// A per-model cost delta above this is a false-start candidate
    /// (default: 10.0 USD)
    pub false_start_cost_threshold_usd: f64,

    /// ...and is skipped when it matches the model's current cumulative
    /// cost within this tolerance (default: 0.1 USD)
    pub false_start_cost_tolerance_usd: f64,

    /// Reconciler variant of the false-start filter: token delta threshold
    /// (default: 100000)
    pub false_start_token_threshold: i64,

    /// ...and current-cumulative match tolerance in tokens (default: 100)
    pub false_start_token_tolerance: i64,

    /// Baseline-to-first-inner-snapshot gaps longer than this many minutes
    /// trigger baseline interpolation (default: 30)
    pub gap_threshold_minutes: i64,
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            cliproxy_url: std::env::var("CLIPROXY_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8317".to_string())
                .trim_end_matches('/')
                .to_string(),

            cliproxy_management_key: std::env::var("CLIPROXY_MANAGEMENT_KEY")
                .ok()
                .filter(|s| !s.is_empty()),

            interval_seconds: std::env::var("COLLECTOR_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .context("Invalid COLLECTOR_INTERVAL_SECONDS")?,

            trigger_port: std::env::var("COLLECTOR_TRIGGER_PORT")
                .unwrap_or_else(|_| "5001".to_string())
                .parse()
                .context("Invalid COLLECTOR_TRIGGER_PORT")?,

            timezone_offset_hours: std::env::var("TIMEZONE_OFFSET_HOURS")
                .unwrap_or_else(|_| "7".to_string())
                .parse()
                .context("Invalid TIMEZONE_OFFSET_HOURS")?,

            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "./data/usage.db".to_string()),

            pricing_url: std::env::var("PRICING_URL").ok().filter(|s| !s.is_empty()),

            pricing_ttl_seconds: parse_env("PRICING_TTL_SECONDS", 3600),
            fetch_timeout_seconds: parse_env("FETCH_TIMEOUT_SECONDS", 30),

            false_start_cost_threshold_usd: parse_env("FALSE_START_COST_THRESHOLD_USD", 10.0),
            false_start_cost_tolerance_usd: parse_env("FALSE_START_COST_TOLERANCE_USD", 0.1),
            false_start_token_threshold: parse_env("FALSE_START_TOKEN_THRESHOLD", 100_000),
            false_start_token_tolerance: parse_env("FALSE_START_TOKEN_TOLERANCE", 100),
            gap_threshold_minutes: parse_env("GAP_THRESHOLD_MINUTES", 30),
        })
    }

    /// The configured local timezone as a fixed offset from UTC
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.timezone_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cliproxy_url: "http://127.0.0.1:8317".to_string(),
            cliproxy_management_key: None,
            interval_seconds: 300,
            trigger_port: 5001,
            timezone_offset_hours: 7,
            db_path: "./data/usage.db".to_string(),
            pricing_url: None,
            pricing_ttl_seconds: 3600,
            fetch_timeout_seconds: 30,
            false_start_cost_threshold_usd: 10.0,
            false_start_cost_tolerance_usd: 0.1,
            false_start_token_threshold: 100_000,
            false_start_token_tolerance: 100,
            gap_threshold_minutes: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_offset() {
        let config = Config::default();
        assert_eq!(config.local_offset().local_minus_utc(), 7 * 3600);
    }

    #[test]
    fn test_negative_offset() {
        let config = Config {
            timezone_offset_hours: -5,
            ..Config::default()
        };
        assert_eq!(config.local_offset().local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn test_corrector_defaults() {
        let config = Config::default();
        assert_eq!(config.false_start_cost_threshold_usd, 10.0);
        assert_eq!(config.false_start_token_threshold, 100_000);
        assert_eq!(config.gap_threshold_minutes, 30);
    }
}
