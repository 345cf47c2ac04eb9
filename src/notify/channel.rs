// =============================================================================
// Notification channel — filter, cooldown, dedup, delivery with retry
// =============================================================================
//
// Each channel runs as its own worker task with a private queue, so a slow
// or failing channel never blocks its siblings and deliveries to a given
// `(channel, asset)` stay in cycle order (single writer per channel).
//
// Per alert the worker applies, in order:
//   1. the channel filter (confidence / direction / asset predicate),
//   2. the per-asset cooldown (`min_interval_ms` between deliveries),
//   3. dedup against the last delivery's `(direction, rounded price)`,
//   4. delivery with bounded retries and exponential backoff.
//
// Cooldown and dedup state update only on successful delivery.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::alerts::AlertRecord;
use crate::clock::Clock;
use crate::health::ChannelStats;
use crate::types::Direction;

// ---------------------------------------------------------------------------
// Delivery sink
// ---------------------------------------------------------------------------

/// The external effect of a channel. Implementations must be safe to retry.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, alert: &AlertRecord) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Config-driven predicate over alerts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Minimum confidence to pass; 0 passes everything.
    #[serde(default)]
    pub min_confidence: f64,
    /// If set, only these directions pass.
    #[serde(default)]
    pub directions: Option<Vec<Direction>>,
    /// If set, only these assets pass.
    #[serde(default)]
    pub assets: Option<Vec<String>>,
}

impl FilterSpec {
    pub fn matches(&self, alert: &AlertRecord) -> bool {
        if alert.confidence < self.min_confidence {
            return false;
        }
        if let Some(directions) = &self.directions {
            if !directions.contains(&alert.direction) {
                return false;
            }
        }
        if let Some(assets) = &self.assets {
            if !assets.contains(&alert.asset) {
                return false;
            }
        }
        true
    }
}

fn default_min_interval_ms() -> i64 {
    60_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1_000
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_price_precision() -> i32 {
    2
}

/// Per-channel settings from the notifications config block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub id: String,
    #[serde(default)]
    pub filter: FilterSpec,
    /// Per-asset cooldown between successful deliveries.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Decimal places used by the dedup price key.
    #[serde(default = "default_price_precision")]
    pub price_precision: i32,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Dedup key of the last successful delivery for an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DedupKey {
    direction: Direction,
    price_key: i64,
}

pub struct ChannelWorker {
    settings: ChannelSettings,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    stats: Arc<ChannelStats>,
    last_delivered_ms: HashMap<String, i64>,
    last_dedup: HashMap<String, DedupKey>,
}

impl ChannelWorker {
    pub fn new(
        settings: ChannelSettings,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        stats: Arc<ChannelStats>,
    ) -> Self {
        Self {
            settings,
            notifier,
            clock,
            stats,
            last_delivered_ms: HashMap::new(),
            last_dedup: HashMap::new(),
        }
    }

    /// Drain the channel queue until shutdown (or the dispatcher drops the
    /// sender).
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<Arc<AlertRecord>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(channel = %self.settings.id, "notification channel worker started");
        loop {
            let alert = tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(alert) => alert,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            self.process(&alert).await;
        }
        info!(channel = %self.settings.id, "notification channel worker stopped");
    }

    /// Apply filter -> cooldown -> dedup -> deliver for one alert.
    pub(crate) async fn process(&mut self, alert: &AlertRecord) {
        let channel = self.settings.id.clone();

        if !self.settings.filter.matches(alert) {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %channel, asset = %alert.asset, "alert filtered out");
            return;
        }

        let now = self.clock.now_ms();
        if let Some(&last) = self.last_delivered_ms.get(&alert.asset) {
            if now - last < self.settings.min_interval_ms {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    channel = %channel,
                    asset = %alert.asset,
                    since_last_ms = now - last,
                    "alert skipped by cooldown"
                );
                return;
            }
        }

        let key = DedupKey {
            direction: alert.direction,
            price_key: round_price(alert.price, self.settings.price_precision),
        };
        if self.last_dedup.get(&alert.asset) == Some(&key) {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %channel, asset = %alert.asset, "duplicate alert skipped");
            return;
        }

        if self.deliver_with_retry(alert).await {
            let now = self.clock.now_ms();
            self.last_delivered_ms.insert(alert.asset.clone(), now);
            self.last_dedup.insert(alert.asset.clone(), key);
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %channel, asset = %alert.asset, "alert delivered");
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                channel = %channel,
                asset = %alert.asset,
                retries = self.settings.max_retries,
                "alert dropped after exhausting retries"
            );
        }
    }

    /// Up to `max_retries` attempts with exponential backoff. Each attempt
    /// is bounded by the channel timeout.
    async fn deliver_with_retry(&self, alert: &AlertRecord) -> bool {
        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let backoff = self.settings.retry_backoff_ms.saturating_mul(1 << (attempt - 1));
                self.clock.sleep_ms(backoff).await;
            }

            let timeout = std::time::Duration::from_millis(self.settings.timeout_ms);
            match tokio::time::timeout(timeout, self.notifier.deliver(alert)).await {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => {
                    debug!(
                        channel = %self.settings.id,
                        attempt,
                        error = %e,
                        "delivery attempt failed"
                    );
                }
                Err(_) => {
                    debug!(
                        channel = %self.settings.id,
                        attempt,
                        timeout_ms = self.settings.timeout_ms,
                        "delivery attempt timed out"
                    );
                }
            }
        }
        false
    }
}

/// Fixed-point price key for dedup comparisons.
fn round_price(price: f64, precision: i32) -> i64 {
    let factor = 10f64.powi(precision);
    (price * factor).round() as i64
}
