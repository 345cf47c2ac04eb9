// =============================================================================
// Strategy contract and registry
// =============================================================================
//
// A strategy is pure: `analyze` reads a pre-sliced market snapshot and
// produces an Analysis; `signals` turns that Analysis into zero or more
// Signals. Neither may perform I/O — nothing with an I/O capability is ever
// passed in. A strategy with insufficient input returns no signals; a
// strategy with malformed configuration refuses to construct.
//
// Strategies are enumerated explicitly at startup via the registry, so the
// active set is auditable in one place.

pub mod mean_reversion;
pub mod momentum;
pub mod vol_breakout;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::types::{Direction, Observation, ObservationPayload, Ohlcv, Signal};

// ---------------------------------------------------------------------------
// Window and snapshot
// ---------------------------------------------------------------------------

/// How much history a strategy wants, and the minimum it can work with.
#[derive(Debug, Clone, Copy)]
pub struct WindowSpec {
    pub lookback_ms: i64,
    pub min_observations: usize,
}

/// Immutable market-data snapshot for one cycle, keyed by series id.
/// Observations are ordered by timestamp ascending (the store guarantees it).
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    series: HashMap<String, Vec<Observation>>,
}

impl MarketSnapshot {
    pub fn new(series: HashMap<String, Vec<Observation>>) -> Self {
        Self { series }
    }

    /// Restrict to `series_ids`, dropping observations older than `t_from`.
    /// This is how the runner pre-slices per strategy window.
    pub fn slice(&self, series_ids: &[String], t_from: i64) -> Self {
        let mut out = HashMap::new();
        for id in series_ids {
            if let Some(observations) = self.series.get(id) {
                let sliced: Vec<Observation> = observations
                    .iter()
                    .filter(|o| o.timestamp_ms >= t_from)
                    .cloned()
                    .collect();
                out.insert(id.clone(), sliced);
            }
        }
        Self { series: out }
    }

    pub fn series(&self, series_id: &str) -> &[Observation] {
        self.series.get(series_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self, series_id: &str) -> usize {
        self.series(series_id).len()
    }

    /// Close (or scalar) values, oldest first.
    pub fn closes(&self, series_id: &str) -> Vec<f64> {
        self.series(series_id).iter().map(Observation::value).collect()
    }

    /// OHLCV bars only, oldest first; scalar observations are skipped.
    pub fn bars(&self, series_id: &str) -> Vec<Ohlcv> {
        self.series(series_id)
            .iter()
            .filter_map(|o| match &o.payload {
                ObservationPayload::Ohlcv(bar) => Some(*bar),
                ObservationPayload::Scalar { .. } => None,
            })
            .collect()
    }

    pub fn latest(&self, series_id: &str) -> Option<&Observation> {
        self.series(series_id).last()
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Per-asset intermediate results from `analyze`.
#[derive(Debug, Clone, Serialize)]
pub struct AssetAnalysis {
    pub last_price: f64,
    pub last_volume: Option<f64>,
    /// Timestamp of the newest observation the analysis saw.
    pub as_of_ms: i64,
    /// Named indicator values feeding the signal decision.
    pub indicators: BTreeMap<String, f64>,
}

/// Output of one strategy's `analyze` pass over the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub strategy_id: String,
    pub assets: BTreeMap<String, AssetAnalysis>,
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

pub trait Strategy: Send + Sync {
    fn id(&self) -> &str;

    /// The exact series this strategy reads — the runner loads nothing else
    /// on its behalf.
    fn required_series(&self) -> Vec<String>;

    fn window(&self) -> WindowSpec;

    /// Pure computation over the pre-sliced snapshot.
    fn analyze(&self, data: &MarketSnapshot) -> anyhow::Result<Analysis>;

    /// Pure mapping from an Analysis to signals. Insufficient conviction is
    /// an empty vec or a NEUTRAL signal, never an error.
    fn signals(&self, analysis: &Analysis) -> anyhow::Result<Vec<Signal>>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub fn register(&mut self, strategy: Arc<dyn Strategy>) -> anyhow::Result<()> {
        if self.strategies.iter().any(|s| s.id() == strategy.id()) {
            anyhow::bail!("strategy '{}' registered twice", strategy.id());
        }
        self.strategies.push(strategy);
        Ok(())
    }

    /// Strategies in registration order (kept stable for deterministic
    /// cycles).
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Strategy>> {
        self.strategies.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Shared signal-construction helpers
// ---------------------------------------------------------------------------

/// Percentage-based protective levels on the correct side of `price`.
pub(crate) fn protective_levels(
    direction: Direction,
    price: f64,
    stop_loss_pct: f64,
    take_profit_pct: f64,
) -> (Option<f64>, Option<f64>) {
    match direction {
        Direction::Long => (
            Some(price * (1.0 - stop_loss_pct / 100.0)),
            Some(price * (1.0 + take_profit_pct / 100.0)),
        ),
        Direction::Short => (
            Some(price * (1.0 + stop_loss_pct / 100.0)),
            Some(price * (1.0 - take_profit_pct / 100.0)),
        ),
        Direction::Neutral => (None, None),
    }
}
