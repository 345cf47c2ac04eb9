// =============================================================================
// Strategy Runner — one signal cycle, end to end
// =============================================================================
//
// Triggered by the scheduler at the signal-cycle cadence. The runner loads
// exactly the union of the series the enabled strategies declare, builds one
// immutable snapshot, pre-slices it per strategy window, and runs each
// strategy on the blocking pool. A strategy that errors (or emits an invalid
// signal) is excluded from the cycle and reported as an operational alert;
// the cycle continues with the remaining strategies.
//
// `SignalCycle` wires the runner output through the aggregator, the alert
// emitter, and the notification queue — the complete per-cycle pipeline the
// scheduler sees as a single task.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::alerts::{AlertEmitter, AlertRecord};
use crate::clock::Clock;
use crate::errors::StoreError;
use crate::health::OpsLog;
use crate::notify::DispatcherHandle;
use crate::scheduler::engine::CycleTask;
use crate::store::Store;
use crate::strategy::{MarketSnapshot, StrategyRegistry};
use crate::types::Signal;

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Everything one cycle produced, before aggregation.
#[derive(Debug)]
pub struct CycleOutput {
    pub cycle_id: String,
    pub started_ms: i64,
    pub signals: Vec<Signal>,
    /// `(strategy_id, error)` for strategies excluded this cycle.
    pub failed_strategies: Vec<(String, String)>,
}

pub struct StrategyRunner {
    store: Arc<Store>,
    registry: Arc<StrategyRegistry>,
    clock: Arc<dyn Clock>,
}

impl StrategyRunner {
    pub fn new(store: Arc<Store>, registry: Arc<StrategyRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            registry,
            clock,
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleOutput, StoreError> {
        let started_ms = self.clock.now_ms();
        let cycle_id = uuid::Uuid::new_v4().to_string();

        // Union of required series, each loaded once at the longest lookback
        // any strategy wants for it.
        let mut lookbacks: HashMap<String, i64> = HashMap::new();
        for strategy in self.registry.iter() {
            let window = strategy.window();
            for series in strategy.required_series() {
                let entry = lookbacks.entry(series).or_insert(0);
                *entry = (*entry).max(window.lookback_ms);
            }
        }

        let mut series_map = HashMap::new();
        for (series_id, lookback_ms) in &lookbacks {
            let observations =
                self.store
                    .range(series_id, started_ms - lookback_ms, started_ms)?;
            series_map.insert(series_id.clone(), observations);
        }
        let snapshot = MarketSnapshot::new(series_map);

        // Launch every strategy on the blocking pool, then collect in
        // registration order so the output batch is deterministic.
        let mut handles = Vec::new();
        for strategy in self.registry.iter() {
            let strategy = Arc::clone(strategy);
            let window = strategy.window();
            let required = strategy.required_series();
            let sliced = snapshot.slice(&required, started_ms - window.lookback_ms);

            let has_enough = required
                .iter()
                .any(|s| sliced.len(s) >= window.min_observations);
            if !has_enough {
                debug!(
                    strategy = %strategy.id(),
                    min_observations = window.min_observations,
                    "skipping strategy — insufficient observations in window"
                );
                continue;
            }

            let id = strategy.id().to_string();
            let handle = tokio::task::spawn_blocking(move || {
                let analysis = strategy.analyze(&sliced)?;
                strategy.signals(&analysis)
            });
            handles.push((id, handle));
        }

        let mut signals = Vec::new();
        let mut failed_strategies = Vec::new();
        for (strategy_id, handle) in handles {
            let result = match handle.await {
                Ok(r) => r,
                Err(join_err) => Err(anyhow::anyhow!("strategy task panicked: {join_err}")),
            };
            match result {
                Ok(batch) => {
                    if let Some(bad) = batch.iter().find_map(|s| s.validate().err()) {
                        failed_strategies
                            .push((strategy_id.clone(), format!("invalid signal: {bad}")));
                        continue;
                    }
                    signals.extend(batch);
                }
                Err(e) => failed_strategies.push((strategy_id, e.to_string())),
            }
        }

        debug!(
            cycle = %cycle_id,
            signals = signals.len(),
            failed = failed_strategies.len(),
            "strategy cycle complete"
        );

        Ok(CycleOutput {
            cycle_id,
            started_ms,
            signals,
            failed_strategies,
        })
    }
}

// ---------------------------------------------------------------------------
// Full cycle pipeline
// ---------------------------------------------------------------------------

/// Summary of the most recent cycle, published for the state endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: String,
    pub started_ms: i64,
    pub signal_count: usize,
    pub aggregated_count: usize,
    pub emitted_count: usize,
    pub failed_strategies: Vec<String>,
}

pub type SharedCycleSummary = Arc<RwLock<Option<CycleSummary>>>;

/// Runner -> Aggregator -> AlertEmitter -> notification queue, as one
/// scheduler task.
pub struct SignalCycle {
    runner: StrategyRunner,
    aggregator: Aggregator,
    emitter: AlertEmitter,
    dispatcher: DispatcherHandle,
    ops: Arc<OpsLog>,
    last_cycle: SharedCycleSummary,
}

impl SignalCycle {
    pub fn new(
        runner: StrategyRunner,
        aggregator: Aggregator,
        emitter: AlertEmitter,
        dispatcher: DispatcherHandle,
        ops: Arc<OpsLog>,
        last_cycle: SharedCycleSummary,
    ) -> Self {
        Self {
            runner,
            aggregator,
            emitter,
            dispatcher,
            ops,
            last_cycle,
        }
    }
}

#[async_trait]
impl CycleTask for SignalCycle {
    async fn run(&self) -> anyhow::Result<()> {
        let output = self.runner.run_cycle().await?;

        for (strategy_id, error) in &output.failed_strategies {
            warn!(strategy = %strategy_id, error = %error, "strategy excluded from cycle");
            self.ops
                .push(format!("strategy {strategy_id} excluded from cycle: {error}"));
        }

        let aggregated = self.aggregator.aggregate(&output.cycle_id, &output.signals);

        let mut emitted_count = 0usize;
        for signal in &aggregated {
            if let Err(violation) = signal.validate() {
                self.ops.push(format!(
                    "aggregated signal for {} violates invariants: {violation}",
                    signal.asset_id
                ));
                continue;
            }

            if self.emitter.emit(signal)?.is_some() {
                emitted_count += 1;
                self.dispatcher
                    .submit(AlertRecord::from_signal(signal))
                    .await?;
            }
        }

        info!(
            cycle = %output.cycle_id,
            signals = output.signals.len(),
            aggregated = aggregated.len(),
            emitted = emitted_count,
            "signal cycle complete"
        );

        *self.last_cycle.write() = Some(CycleSummary {
            cycle_id: output.cycle_id,
            started_ms: output.started_ms,
            signal_count: output.signals.len(),
            aggregated_count: aggregated.len(),
            emitted_count,
            failed_strategies: output
                .failed_strategies
                .into_iter()
                .map(|(id, _)| id)
                .collect(),
        });

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{AggregatorSettings, StrengthMultipliers};
    use crate::clock::SimClock;
    use crate::health::DispatcherStats;
    use crate::notify::channel::{ChannelSettings, FilterSpec, Notifier};
    use crate::notify::NotificationDispatcher;
    use crate::strategy::{Analysis, AssetAnalysis, Strategy, WindowSpec};
    use crate::types::{
        ohlcv_series, AggregationMethod, Direction, Observation, Ohlcv, SignalContext, Strength,
    };
    use std::collections::BTreeMap;
    use tokio::sync::watch;

    /// Minimal test strategy: always emits one signal for `bitcoin`, or
    /// errors when told to.
    struct StubStrategy {
        id: &'static str,
        direction: Direction,
        confidence: f64,
        fail: bool,
    }

    impl Strategy for StubStrategy {
        fn id(&self) -> &str {
            self.id
        }

        fn required_series(&self) -> Vec<String> {
            vec![ohlcv_series("bitcoin")]
        }

        fn window(&self) -> WindowSpec {
            WindowSpec {
                lookback_ms: 3_600_000,
                min_observations: 1,
            }
        }

        fn analyze(&self, data: &MarketSnapshot) -> anyhow::Result<Analysis> {
            let series = ohlcv_series("bitcoin");
            let latest = data
                .latest(&series)
                .ok_or_else(|| anyhow::anyhow!("no data"))?;
            let mut assets = BTreeMap::new();
            assets.insert(
                "bitcoin".to_string(),
                AssetAnalysis {
                    last_price: latest.value(),
                    last_volume: Some(10.0),
                    as_of_ms: latest.timestamp_ms,
                    indicators: BTreeMap::new(),
                },
            );
            Ok(Analysis {
                strategy_id: self.id.to_string(),
                assets,
            })
        }

        fn signals(&self, analysis: &Analysis) -> anyhow::Result<Vec<Signal>> {
            if self.fail {
                anyhow::bail!("synthetic strategy crash");
            }
            let a = &analysis.assets["bitcoin"];
            let (sl, tp) = match self.direction {
                Direction::Long => (Some(a.last_price * 0.98), Some(a.last_price * 1.04)),
                Direction::Short => (Some(a.last_price * 1.02), Some(a.last_price * 0.96)),
                Direction::Neutral => (None, None),
            };
            Ok(vec![Signal {
                strategy_id: self.id.to_string(),
                asset_id: "bitcoin".into(),
                direction: self.direction,
                confidence: self.confidence,
                strength: Strength::from_score(self.confidence, (0.33, 0.66)),
                timestamp_ms: a.as_of_ms,
                price_at_generation: Some(a.last_price),
                position_size: if self.direction == Direction::Neutral {
                    0.0
                } else {
                    self.confidence
                },
                stop_loss: sl,
                take_profit: tp,
                context: SignalContext::new(),
            }])
        }
    }

    fn seeded_store() -> Arc<Store> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let series = ohlcv_series("bitcoin");
        let observations: Vec<Observation> = (1..=10)
            .map(|i| {
                Observation::ohlcv(
                    series.clone(),
                    i * 60_000,
                    Ohlcv {
                        open: 100.0,
                        high: 101.0,
                        low: 99.0,
                        close: 100.0 + i as f64,
                        volume: 10.0,
                    },
                )
            })
            .collect();
        store.put(&observations).unwrap();
        store
    }

    fn registry(strategies: Vec<StubStrategy>) -> Arc<StrategyRegistry> {
        let mut registry = StrategyRegistry::new();
        for s in strategies {
            registry.register(Arc::new(s)).unwrap();
        }
        Arc::new(registry)
    }

    fn aggregator(weights: &[(&str, f64)]) -> Aggregator {
        let enabled: Vec<String> = weights.iter().map(|(k, _)| k.to_string()).collect();
        Aggregator::new(
            AggregatorSettings {
                method: AggregationMethod::WeightedAverage,
                weights: weights.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                neutral_threshold: 0.1,
                strength_breakpoints: (0.33, 0.66),
                strength_multipliers: StrengthMultipliers::default(),
                base_position: 1.0,
                max_position: 2.0,
            },
            &enabled,
        )
        .unwrap()
    }

    struct CollectingNotifier {
        seen: parking_lot::Mutex<Vec<AlertRecord>>,
    }

    #[async_trait]
    impl Notifier for CollectingNotifier {
        async fn deliver(&self, alert: &AlertRecord) -> anyhow::Result<()> {
            self.seen.lock().push(alert.clone());
            Ok(())
        }
    }

    fn alert_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("meridian-cycle-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn runner_collects_signals_from_all_strategies() {
        let clock: Arc<dyn Clock> = Arc::new(SimClock::new(3_600_000));
        let runner = StrategyRunner::new(
            seeded_store(),
            registry(vec![
                StubStrategy {
                    id: "alpha",
                    direction: Direction::Long,
                    confidence: 0.8,
                    fail: false,
                },
                StubStrategy {
                    id: "beta",
                    direction: Direction::Short,
                    confidence: 0.5,
                    fail: false,
                },
            ]),
            clock,
        );

        let output = runner.run_cycle().await.unwrap();
        assert_eq!(output.signals.len(), 2);
        assert!(output.failed_strategies.is_empty());
        // Registration order is preserved.
        assert_eq!(output.signals[0].strategy_id, "alpha");
        assert_eq!(output.signals[1].strategy_id, "beta");
    }

    #[tokio::test]
    async fn runner_skips_strategies_without_enough_data() {
        let clock: Arc<dyn Clock> = Arc::new(SimClock::new(3_600_000));
        let store = Arc::new(Store::open_in_memory().unwrap()); // empty
        let runner = StrategyRunner::new(
            store,
            registry(vec![StubStrategy {
                id: "alpha",
                direction: Direction::Long,
                confidence: 0.8,
                fail: false,
            }]),
            clock,
        );

        let output = runner.run_cycle().await.unwrap();
        assert!(output.signals.is_empty());
        assert!(output.failed_strategies.is_empty());
    }

    // -------------------------------------------------------------------------
    // E6 — a crashing strategy is isolated; the cycle continues
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn crashing_strategy_is_excluded_and_cycle_continues() {
        let clock: Arc<dyn Clock> = Arc::new(SimClock::new(3_600_000));
        let store = seeded_store();
        let ops = Arc::new(OpsLog::new(16));
        let last_cycle: SharedCycleSummary = Arc::new(RwLock::new(None));

        let runner = StrategyRunner::new(
            store,
            registry(vec![
                StubStrategy {
                    id: "alpha",
                    direction: Direction::Long,
                    confidence: 0.8,
                    fail: false,
                },
                StubStrategy {
                    id: "beta",
                    direction: Direction::Long,
                    confidence: 0.7,
                    fail: true, // crashes in signals()
                },
                StubStrategy {
                    id: "gamma",
                    direction: Direction::Long,
                    confidence: 0.6,
                    fail: false,
                },
            ]),
            Arc::clone(&clock),
        );

        let notifier = Arc::new(CollectingNotifier {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let mut dispatcher = NotificationDispatcher::new();
        dispatcher.add_channel(
            ChannelSettings {
                id: "collector".into(),
                filter: FilterSpec::default(),
                min_interval_ms: 0,
                max_retries: 0,
                retry_backoff_ms: 1,
                timeout_ms: 1_000,
                price_precision: 2,
            },
            notifier.clone(),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = dispatcher.spawn(
            8,
            Arc::clone(&clock),
            Arc::new(DispatcherStats::default()),
            shutdown_rx,
        );

        let dir = alert_dir();
        let cycle = SignalCycle::new(
            runner,
            aggregator(&[("alpha", 0.4), ("beta", 0.3), ("gamma", 0.3)]),
            AlertEmitter::new(&dir, 0.3).unwrap(),
            handle,
            ops.clone(),
            last_cycle.clone(),
        );

        cycle.run().await.unwrap();

        // The aggregate was computed from alpha and gamma only.
        let summary = last_cycle.read().clone().unwrap();
        assert_eq!(summary.signal_count, 2);
        assert_eq!(summary.aggregated_count, 1);
        assert_eq!(summary.emitted_count, 1);
        assert_eq!(summary.failed_strategies, vec!["beta"]);

        // An operational alert was recorded for the crash.
        assert!(ops
            .snapshot()
            .iter()
            .any(|r| r.message.contains("beta") && r.message.contains("excluded")));

        // One alert record on disk, and it reached the channel.
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        let seen = notifier.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].contributors, vec!["alpha", "gamma"]);

        // Nothing disables a crashed strategy: the next cycle invokes it
        // again (and it fails again, which is the point).
        drop(seen);
        cycle.run().await.unwrap();
        let summary = last_cycle.read().clone().unwrap();
        assert_eq!(summary.failed_strategies, vec!["beta"]);

        std::fs::remove_dir_all(&dir).ok();
    }

    // -------------------------------------------------------------------------
    // E4 tail — below-threshold aggregate produces no alert and no dispatch
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn below_threshold_cycle_emits_nothing() {
        let clock: Arc<dyn Clock> = Arc::new(SimClock::new(3_600_000));
        let ops = Arc::new(OpsLog::new(16));
        let last_cycle: SharedCycleSummary = Arc::new(RwLock::new(None));

        // A: LONG 0.5, B: SHORT 0.75 with weights 0.6/0.4 -> D = 0.
        let runner = StrategyRunner::new(
            seeded_store(),
            registry(vec![
                StubStrategy {
                    id: "alpha",
                    direction: Direction::Long,
                    confidence: 0.5,
                    fail: false,
                },
                StubStrategy {
                    id: "beta",
                    direction: Direction::Short,
                    confidence: 0.75,
                    fail: false,
                },
            ]),
            Arc::clone(&clock),
        );

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = NotificationDispatcher::new().spawn(
            8,
            Arc::clone(&clock),
            Arc::new(DispatcherStats::default()),
            shutdown_rx,
        );

        let dir = alert_dir();
        let cycle = SignalCycle::new(
            runner,
            aggregator(&[("alpha", 0.6), ("beta", 0.4)]),
            AlertEmitter::new(&dir, 0.3).unwrap(),
            handle,
            ops,
            last_cycle.clone(),
        );

        cycle.run().await.unwrap();

        let summary = last_cycle.read().clone().unwrap();
        assert_eq!(summary.aggregated_count, 1);
        assert_eq!(summary.emitted_count, 0);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);

        std::fs::remove_dir_all(&dir).ok();
    }
}
