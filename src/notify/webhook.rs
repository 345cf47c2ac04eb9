// =============================================================================
// Webhook channel — JSON POST of the alert record
// =============================================================================

use async_trait::async_trait;
use tracing::debug;

use super::channel::Notifier;
use crate::alerts::AlertRecord;

/// Delivers alerts as a JSON POST to a configured URL. Response bodies are
/// ignored; any non-2xx status is a delivery failure (the worker retries).
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, alert: &AlertRecord) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("webhook POST failed: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("webhook returned {status}");
        }

        debug!(asset = %alert.asset, status = %status, "webhook delivered");
        Ok(())
    }
}
