//! Pass coordination: one logical writer driving collect-then-reconcile
//!
//! A single coordinator owns the upstream client, the delta engine and the
//! reconciler. `run_once` is guarded by a try-lock gate so a manual trigger
//! arriving while a pass is in flight is absorbed rather than queued. The
//! interval loop measures its delay from the end of the previous pass.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::collector::DeltaEngine;
use crate::error::Error;
use crate::reconciler::Reconciler;
use crate::upstream::UpstreamClient;

pub struct Coordinator {
    upstream: UpstreamClient,
    engine: DeltaEngine,
    reconciler: Reconciler,
    gate: tokio::sync::Mutex<()>,
    interval: Duration,
}

impl Coordinator {
    pub fn new(
        upstream: UpstreamClient,
        engine: DeltaEngine,
        reconciler: Reconciler,
        interval_seconds: u64,
    ) -> Self {
        Self {
            upstream,
            engine,
            reconciler,
            gate: tokio::sync::Mutex::new(()),
            interval: Duration::from_secs(interval_seconds.max(1)),
        }
    }

    /// Run one collect-then-reconcile pass.
    ///
    /// Returns false when a pass was already in flight and this call was
    /// coalesced into it.
    pub async fn run_once(&self) -> bool {
        let Ok(_guard) = self.gate.try_lock() else {
            tracing::debug!("Pass already in flight; trigger coalesced");
            return false;
        };

        self.collect().await;
        self.reconcile().await;
        true
    }

    async fn collect(&self) {
        let (report, raw) = match self.upstream.fetch_usage().await {
            Ok(fetched) => fetched,
            Err(Error::Upstream(e)) => {
                // Transient; the next tick retries against a larger report.
                tracing::warn!("Upstream unavailable, skipping collection: {}", e);
                return;
            }
            Err(e) => {
                tracing::error!("Upstream report rejected: {}", e);
                return;
            }
        };

        match self.engine.ingest(&report, &raw).await {
            Ok(summary) => {
                tracing::info!(
                    snapshot_id = summary.snapshot_id,
                    date = %summary.date,
                    requests = summary.requests,
                    tokens = summary.tokens,
                    cost = summary.cost,
                    restarted = summary.restarted,
                    skipped = summary.skipped_models,
                    "Collection pass complete"
                );
            }
            Err(e) => {
                tracing::error!("Snapshot ingest failed, pass rolled back: {}", e);
            }
        }
    }

    async fn reconcile(&self) {
        // Runs even when collection was skipped: windows keep advancing
        // during upstream outages.
        if let Err(e) = self.reconciler.run().await {
            tracing::error!("Reconciler pass failed: {}", e);
        }
    }

    /// Drive passes until cancelled: one immediately, then on the interval,
    /// measured from the end of each pass. Cancellation aborts the next
    /// tick, never a pass in progress.
    pub async fn run_loop(&self, shutdown: CancellationToken) {
        tracing::info!(
            "Collector loop started (interval {}s)",
            self.interval.as_secs()
        );
        self.run_once().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    self.run_once().await;
                }
            }
        }
        tracing::info!("Collector loop stopped");
    }
}
