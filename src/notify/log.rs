// =============================================================================
// Log channel — structured-log delivery sink
// =============================================================================
//
// Always available: useful as a default channel and as the last resort when
// every external sink is down.

use async_trait::async_trait;
use tracing::info;

use super::channel::Notifier;
use crate::alerts::AlertRecord;

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, alert: &AlertRecord) -> anyhow::Result<()> {
        info!(
            asset = %alert.asset,
            direction = %alert.direction,
            confidence = alert.confidence,
            strength = %alert.strength,
            price = alert.price,
            position_size = alert.position_size,
            contributors = ?alert.contributors,
            cycle = %alert.cycle_id,
            "trading signal"
        );
        Ok(())
    }
}
