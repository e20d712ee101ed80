//! Client for the upstream proxy's cumulative usage report

use std::time::Duration;

use crate::collector::report::UsageReport;
use crate::config::Config;
use crate::error::{Error, Result};

/// Fetches `{base_url}/v0/management/usage` and parses the cumulative
/// report. All failures are typed: network/non-2xx is transient, a body of
/// the wrong shape is a parse error (with the payload logged for diagnosis).
pub struct UpstreamClient {
    http_client: reqwest::Client,
    base_url: String,
    management_key: Option<String>,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_seconds))
            .build()
            .unwrap_or_default();

        Self {
            http_client,
            base_url: config.cliproxy_url.clone(),
            management_key: config.cliproxy_management_key.clone(),
        }
    }

    /// Fetch the current cumulative usage report.
    ///
    /// Returns the parsed report together with the raw body, which the
    /// collector persists verbatim on the snapshot row.
    pub async fn fetch_usage(&self) -> Result<(UsageReport, String)> {
        let url = format!("{}/v0/management/usage", self.base_url);

        let mut request = self.http_client.get(&url);
        if let Some(key) = &self.management_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("GET {url} failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Upstream(format!("Failed reading body from {url}: {e}")))?;

        if !status.is_success() {
            return Err(Error::Upstream(format!("{url} returned {status}: {body}")));
        }

        let report: UsageReport = serde_json::from_str(&body).map_err(|e| {
            tracing::error!(payload = %body, "Upstream usage payload did not parse");
            Error::Parse(format!("usage report: {e}"))
        })?;

        Ok((report, body))
    }
}
