//! The daily breakdown document: per-model and per-endpoint usage maps
//!
//! Stored serialized in the `daily_usage.breakdown` column. Top-level daily
//! totals are always recomputable by summing the model map, which is what
//! keeps the aggregate row internally consistent no matter how many partial
//! passes touched it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    #[serde(default)]
    pub models: BTreeMap<String, ModelSlice>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointSlice>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSlice {
    #[serde(default)]
    pub requests: i64,
    #[serde(default)]
    pub tokens: i64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSlice {
    #[serde(default)]
    pub requests: i64,
    #[serde(default)]
    pub tokens: i64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub models: BTreeMap<String, EndpointModelSlice>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointModelSlice {
    #[serde(default)]
    pub requests: i64,
    #[serde(default)]
    pub tokens: i64,
    #[serde(default)]
    pub cost: f64,
}

/// Scalar sums over the model map
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BreakdownTotals {
    pub requests: i64,
    pub tokens: i64,
    pub cost: f64,
}

impl Breakdown {
    pub fn is_empty(&self) -> bool {
        self.models.is_empty() && self.endpoints.is_empty()
    }

    /// Fold one surviving per-key delta into both maps
    pub fn add_key(
        &mut self,
        endpoint: &str,
        model: &str,
        requests: i64,
        tokens: i64,
        cost: f64,
        input_tokens: i64,
        output_tokens: i64,
    ) {
        let slice = self.models.entry(model.to_string()).or_default();
        slice.requests += requests;
        slice.tokens += tokens;
        slice.cost += cost;
        slice.input_tokens += input_tokens;
        slice.output_tokens += output_tokens;

        let ep = self.endpoints.entry(endpoint.to_string()).or_default();
        ep.requests += requests;
        ep.tokens += tokens;
        ep.cost += cost;

        let ep_model = ep.models.entry(model.to_string()).or_default();
        ep_model.requests += requests;
        ep_model.tokens += tokens;
        ep_model.cost += cost;
    }

    /// Deep-merge another breakdown into this one, summing every leaf
    pub fn merge(&mut self, delta: &Breakdown) {
        for (model, slice) in &delta.models {
            let entry = self.models.entry(model.clone()).or_default();
            entry.requests += slice.requests;
            entry.tokens += slice.tokens;
            entry.cost += slice.cost;
            entry.input_tokens += slice.input_tokens;
            entry.output_tokens += slice.output_tokens;
        }

        for (endpoint, slice) in &delta.endpoints {
            let entry = self.endpoints.entry(endpoint.clone()).or_default();
            entry.requests += slice.requests;
            entry.tokens += slice.tokens;
            entry.cost += slice.cost;
            for (model, ep_model) in &slice.models {
                let nested = entry.models.entry(model.clone()).or_default();
                nested.requests += ep_model.requests;
                nested.tokens += ep_model.tokens;
                nested.cost += ep_model.cost;
            }
        }
    }

    /// Sum the model map; the authoritative source for daily totals
    pub fn totals(&self) -> BreakdownTotals {
        self.models
            .values()
            .fold(BreakdownTotals::default(), |mut acc, slice| {
                acc.requests += slice.requests;
                acc.tokens += slice.tokens;
                acc.cost += slice.cost;
                acc
            })
    }

    /// Parse a stored breakdown column. Empty or unparseable documents
    /// degrade to a fresh breakdown so one corrupt row cannot wedge the
    /// collector permanently.
    pub fn from_column(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Breakdown::default();
        }
        match serde_json::from_str(raw) {
            Ok(breakdown) => breakdown,
            Err(e) => {
                tracing::warn!("Discarding unparseable breakdown document: {}", e);
                Breakdown::default()
            }
        }
    }

    pub fn to_column(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
