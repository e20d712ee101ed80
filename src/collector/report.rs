//! Serde model of the upstream cumulative usage report
//!
//! The report is tolerant by construction: every field defaults, so a
//! partially-populated upstream (fresh start, no traffic yet) still parses.

use std::collections::HashMap;

use serde::Deserialize;

/// Top-level cumulative counters plus the per-endpoint/per-model tree
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageReport {
    #[serde(default)]
    pub total_requests: i64,
    #[serde(default, alias = "success")]
    pub success_count: i64,
    #[serde(default, alias = "failure")]
    pub failure_count: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub apis: HashMap<String, ApiUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiUsage {
    #[serde(default)]
    pub models: HashMap<String, ModelReport>,
}

/// Cumulative counters for one model under one endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelReport {
    #[serde(default)]
    pub total_requests: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub details: Vec<CallDetail>,
}

impl ModelReport {
    /// Sum input/output tokens across the details list
    pub fn token_sums(&self) -> (i64, i64) {
        self.details.iter().fold((0, 0), |(input, output), d| {
            (input + d.tokens.input, output + d.tokens.output)
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallDetail {
    #[serde(default)]
    pub tokens: TokenCounts,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenCounts {
    #[serde(default)]
    pub input: i64,
    #[serde(default)]
    pub output: i64,
}
