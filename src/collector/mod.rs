//! The delta engine: snapshot ingestion, per-key deltas, daily aggregation

pub mod breakdown;
pub mod delta;
pub mod engine;
pub mod report;

pub use breakdown::{Breakdown, BreakdownTotals, EndpointSlice, ModelSlice};
pub use delta::{CorrectorSettings, DeltaOutcome, PricedKeyUsage, UsageTotals};
pub use engine::{DeltaEngine, PassSummary};
pub use report::UsageReport;
