//! Pricing oracle: model token prices with a remote table and built-in
//! fallbacks
//!
//! Prices are USD per million tokens. A remote table (if configured) is
//! fetched lazily and cached for a TTL; lookups fall back to the built-in
//! substring-keyed defaults whenever the remote table is unavailable or has
//! no match, so cost attribution never blocks a collector pass.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::Config;

/// One remote price table entry
#[derive(Debug, Clone, Deserialize)]
pub struct PriceEntry {
    pub id: String,
    /// USD per 1M input tokens
    pub input: f64,
    /// USD per 1M output tokens
    pub output: f64,
    #[serde(default)]
    pub vendor: String,
}

#[derive(Debug, Deserialize)]
struct PriceTable {
    #[serde(default)]
    prices: Vec<PriceEntry>,
}

struct CachedTable {
    fetched_at: Instant,
    entries: Vec<PriceEntry>,
}

/// Built-in defaults keyed by model-name substrings, USD per 1M tokens
const DEFAULT_PRICES: &[(&str, f64, f64)] = &[
    ("gpt-4", 30.0, 60.0),
    ("gpt-3.5", 0.5, 1.5),
    ("opus", 15.0, 75.0),
    ("sonnet", 3.0, 15.0),
    ("haiku", 0.8, 4.0),
    ("gemini", 1.25, 5.0),
];

/// Fallback when nothing matches
const DEFAULT_INPUT_PER_1M: f64 = 3.0;
const DEFAULT_OUTPUT_PER_1M: f64 = 15.0;

pub struct PricingOracle {
    http_client: reqwest::Client,
    source_url: Option<String>,
    ttl: Duration,
    cache: RwLock<Option<CachedTable>>,
}

impl PricingOracle {
    pub fn new(config: &Config) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_seconds))
            .build()
            .unwrap_or_default();

        Self {
            http_client,
            source_url: config.pricing_url.clone(),
            ttl: Duration::from_secs(config.pricing_ttl_seconds),
            cache: RwLock::new(None),
        }
    }

    /// An oracle that only ever uses the built-in defaults
    pub fn defaults_only() -> Self {
        Self {
            http_client: reqwest::Client::new(),
            source_url: None,
            ttl: Duration::from_secs(3600),
            cache: RwLock::new(None),
        }
    }

    /// Cost in USD of `input_tokens` in and `output_tokens` out for a model
    pub async fn price(&self, model_name: &str, input_tokens: i64, output_tokens: i64) -> f64 {
        let (input_per_1m, output_per_1m) = self.rates_for(model_name).await;
        (input_tokens as f64 / 1_000_000.0) * input_per_1m
            + (output_tokens as f64 / 1_000_000.0) * output_per_1m
    }

    /// (input, output) USD-per-1M rates for a model
    async fn rates_for(&self, model_name: &str) -> (f64, f64) {
        if let Some(entries) = self.table().await {
            if let Some((input, output)) = lookup(&entries, model_name) {
                return (input, output);
            }
        }
        builtin_rates(model_name)
    }

    /// Cached remote table, refreshed past the TTL. `None` when no source is
    /// configured or the fetch failed (callers fall back to defaults).
    async fn table(&self) -> Option<Vec<PriceEntry>> {
        let url = self.source_url.as_ref()?;

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Some(cached.entries.clone());
                }
            }
        }

        match self.fetch(url).await {
            Ok(entries) => {
                let mut cache = self.cache.write().await;
                *cache = Some(CachedTable {
                    fetched_at: Instant::now(),
                    entries: entries.clone(),
                });
                Some(entries)
            }
            Err(e) => {
                tracing::warn!("Price table fetch failed, using cached/default rates: {}", e);
                // A stale table beats the builtins
                let cache = self.cache.read().await;
                cache.as_ref().map(|c| c.entries.clone())
            }
        }
    }

    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<PriceEntry>> {
        let response = self.http_client.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("price table returned {}", response.status());
        }
        let table: PriceTable = response.json().await?;
        tracing::debug!("Loaded {} price entries", table.prices.len());
        Ok(table.prices)
    }
}

/// Case-insensitive substring match in either direction; first match wins,
/// then the `_default` row
fn lookup(entries: &[PriceEntry], model_name: &str) -> Option<(f64, f64)> {
    let model_lower = model_name.to_lowercase();

    for entry in entries {
        if entry.id == "_default" {
            continue;
        }
        let id_lower = entry.id.to_lowercase();
        if model_lower.contains(&id_lower) || id_lower.contains(&model_lower) {
            return Some((entry.input, entry.output));
        }
    }

    entries
        .iter()
        .find(|e| e.id == "_default")
        .map(|e| (e.input, e.output))
}

fn builtin_rates(model_name: &str) -> (f64, f64) {
    let model_lower = model_name.to_lowercase();
    for (key, input, output) in DEFAULT_PRICES {
        if model_lower.contains(key) {
            return (*input, *output);
        }
    }
    (DEFAULT_INPUT_PER_1M, DEFAULT_OUTPUT_PER_1M)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_gpt4_cost() {
        let oracle = PricingOracle::defaults_only();
        // 600 in at $30/1M + 400 out at $60/1M = 0.018 + 0.024 = 0.042
        let cost = oracle.price("gpt-4", 600, 400).await;
        assert!((cost - 0.042).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_builtin_opus_cost() {
        let oracle = PricingOracle::defaults_only();
        // 500k in at $15/1M + 500k out at $75/1M = 7.5 + 37.5 = 45
        let cost = oracle.price("claude-opus-4", 500_000, 500_000).await;
        assert!((cost - 45.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_model_uses_default_rates() {
        let oracle = PricingOracle::defaults_only();
        let cost = oracle.price("mystery-model", 1_000_000, 0).await;
        assert!((cost - DEFAULT_INPUT_PER_1M).abs() < 1e-9);
    }

    #[test]
    fn test_lookup_substring_both_directions() {
        let entries = vec![
            PriceEntry {
                id: "gpt-4".into(),
                input: 30.0,
                output: 60.0,
                vendor: "openai".into(),
            },
            PriceEntry {
                id: "claude-sonnet-4-20250514".into(),
                input: 3.0,
                output: 15.0,
                vendor: "anthropic".into(),
            },
            PriceEntry {
                id: "_default".into(),
                input: 1.0,
                output: 2.0,
                vendor: String::new(),
            },
        ];

        // model name contains the entry id
        assert_eq!(lookup(&entries, "GPT-4-turbo"), Some((30.0, 60.0)));
        // entry id contains the model name
        assert_eq!(lookup(&entries, "claude-sonnet-4"), Some((3.0, 15.0)));
        // no match falls through to _default
        assert_eq!(lookup(&entries, "grok"), Some((1.0, 2.0)));
    }

    #[test]
    fn test_lookup_without_default_row() {
        let entries = vec![PriceEntry {
            id: "gpt-4".into(),
            input: 30.0,
            output: 60.0,
            vendor: String::new(),
        }];
        assert_eq!(lookup(&entries, "grok"), None);
    }
}
