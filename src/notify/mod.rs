// =============================================================================
// Notification Dispatcher — bounded fan-out to channel workers
// =============================================================================
//
// One explicit concurrency shape, no fire-and-forget tasks: the aggregator
// side submits alerts into a bounded queue (blocking when full, which
// back-pressures the signal cycle), a fan-out task copies each alert into
// every channel's private bounded queue, and each channel worker applies its
// own filter/cooldown/dedup/retry pipeline. A failing channel fills only its
// own queue.

pub mod channel;
pub mod log;
pub mod webhook;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::alerts::AlertRecord;
use crate::clock::Clock;
use crate::health::DispatcherStats;
use self::channel::{ChannelSettings, ChannelWorker, Notifier};

/// A channel definition awaiting spawn.
pub struct ChannelDef {
    pub settings: ChannelSettings,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Default)]
pub struct NotificationDispatcher {
    channels: Vec<ChannelDef>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&mut self, settings: ChannelSettings, notifier: Arc<dyn Notifier>) {
        self.channels.push(ChannelDef { settings, notifier });
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Spawn the fan-out task and one worker per channel. Returns the handle
    /// producers submit alerts through.
    pub fn spawn(
        self,
        queue_capacity: usize,
        clock: Arc<dyn Clock>,
        stats: Arc<DispatcherStats>,
        shutdown: watch::Receiver<bool>,
    ) -> DispatcherHandle {
        let capacity = queue_capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<Arc<AlertRecord>>(capacity);

        let mut channel_txs = Vec::new();
        for def in self.channels {
            let (ch_tx, ch_rx) = mpsc::channel::<Arc<AlertRecord>>(capacity);
            let worker_stats = stats.register(def.settings.id.clone());
            let worker = ChannelWorker::new(
                def.settings.clone(),
                def.notifier,
                Arc::clone(&clock),
                worker_stats,
            );
            tokio::spawn(worker.run(ch_rx, shutdown.clone()));
            channel_txs.push((def.settings.id, ch_tx));
        }

        let mut fanout_shutdown = shutdown;
        tokio::spawn(async move {
            info!(channels = channel_txs.len(), "notification dispatcher started");
            loop {
                let alert = tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(alert) => alert,
                        None => break,
                    },
                    _ = fanout_shutdown.changed() => {
                        if *fanout_shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                for (channel_id, ch_tx) in &channel_txs {
                    if ch_tx.send(Arc::clone(&alert)).await.is_err() {
                        warn!(channel = %channel_id, "channel worker gone — alert not routed");
                    }
                }
            }
            info!("notification dispatcher stopped");
        });

        DispatcherHandle { tx }
    }
}

/// Producer-side handle. Submitting blocks once the queue is full, applying
/// backpressure up to the aggregator.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Arc<AlertRecord>>,
}

impl DispatcherHandle {
    pub async fn submit(&self, alert: AlertRecord) -> anyhow::Result<()> {
        self.tx
            .send(Arc::new(alert))
            .await
            .map_err(|_| anyhow::anyhow!("notification queue closed"))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::notify::channel::FilterSpec;
    use crate::types::{AggregationMethod, Direction, SignalContext, Strength};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn deliver(&self, alert: &AlertRecord) -> anyhow::Result<()> {
            self.seen.lock().push(alert.asset.clone());
            Ok(())
        }
    }

    fn alert(asset: &str, confidence: f64) -> AlertRecord {
        AlertRecord {
            timestamp_ms: 1_000,
            cycle_id: "cycle-1".into(),
            asset: asset.into(),
            direction: Direction::Long,
            confidence,
            strength: Strength::Moderate,
            price: 100.0,
            position_size: 0.5,
            stop_loss: None,
            take_profit: None,
            contributors: vec![],
            method: AggregationMethod::WeightedAverage,
            context: SignalContext::new(),
        }
    }

    fn settings(id: &str, min_confidence: f64) -> ChannelSettings {
        ChannelSettings {
            id: id.into(),
            filter: FilterSpec {
                min_confidence,
                directions: None,
                assets: None,
            },
            min_interval_ms: 0,
            max_retries: 0,
            retry_backoff_ms: 1,
            timeout_ms: 1_000,
            price_precision: 2,
        }
    }

    #[tokio::test]
    async fn fans_out_to_all_channels_independently() {
        let clock: Arc<dyn Clock> = Arc::new(SimClock::new(0));
        let stats = Arc::new(DispatcherStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let everything = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let picky = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });

        let mut dispatcher = NotificationDispatcher::new();
        dispatcher.add_channel(settings("everything", 0.0), everything.clone());
        dispatcher.add_channel(settings("picky", 0.9), picky.clone());
        assert_eq!(dispatcher.channel_count(), 2);

        let handle = dispatcher.spawn(8, clock, stats.clone(), shutdown_rx);
        handle.submit(alert("bitcoin", 0.5)).await.unwrap();
        handle.submit(alert("ethereum", 0.95)).await.unwrap();

        // Let the fan-out and workers drain on the current-thread runtime.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        assert_eq!(*everything.seen.lock(), vec!["bitcoin", "ethereum"]);
        // The picky channel filtered the low-confidence alert out.
        assert_eq!(*picky.seen.lock(), vec!["ethereum"]);

        let snaps = stats.snapshots();
        let picky_stats = snaps.iter().find(|s| s.channel_id == "picky").unwrap();
        assert_eq!(picky_stats.delivered, 1);
        assert_eq!(picky_stats.skipped, 1);

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn submit_fails_after_shutdown_closes_queue() {
        let clock: Arc<dyn Clock> = Arc::new(SimClock::new(0));
        let stats = Arc::new(DispatcherStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = NotificationDispatcher::new();
        let handle = dispatcher.spawn(2, clock, stats, shutdown_rx);

        shutdown_tx.send(true).unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        // The fan-out task has exited and dropped its receiver.
        assert!(handle.submit(alert("bitcoin", 0.5)).await.is_err());
    }

    #[test]
    fn channel_stats_start_at_zero() {
        let stats = DispatcherStats::default();
        let ch = stats.register("x");
        assert_eq!(ch.delivered.load(Ordering::Relaxed), 0);
    }
}
