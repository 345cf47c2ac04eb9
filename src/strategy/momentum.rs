// =============================================================================
// Momentum strategy — ROC filtered by EMA trend agreement
// =============================================================================
//
// Goes with the move: a strong rate-of-change only counts when the fast EMA
// sits on the same side of the slow EMA. Confidence scales with ROC magnitude
// and saturates at `roc_full_confidence_pct`.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::indicators::{ema::latest_ema, rate_of_change};
use crate::strategy::{
    protective_levels, Analysis, AssetAnalysis, MarketSnapshot, Strategy, WindowSpec,
};
use crate::types::{ohlcv_series, Direction, Signal, Strength};

fn default_roc_period() -> usize {
    14
}
fn default_ema_fast() -> usize {
    9
}
fn default_ema_slow() -> usize {
    21
}
fn default_roc_threshold_pct() -> f64 {
    1.0
}
fn default_roc_full_confidence_pct() -> f64 {
    6.0
}
fn default_max_position() -> f64 {
    1.0
}
fn default_stop_loss_pct() -> f64 {
    2.0
}
fn default_take_profit_pct() -> f64 {
    4.0
}
fn default_lookback_ms() -> i64 {
    48 * 3_600_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumParams {
    #[serde(default = "default_roc_period")]
    pub roc_period: usize,
    #[serde(default = "default_ema_fast")]
    pub ema_fast: usize,
    #[serde(default = "default_ema_slow")]
    pub ema_slow: usize,
    /// Minimum |ROC| (percent) before the strategy takes a side.
    #[serde(default = "default_roc_threshold_pct")]
    pub roc_threshold_pct: f64,
    /// |ROC| (percent) at which confidence saturates at 1.0.
    #[serde(default = "default_roc_full_confidence_pct")]
    pub roc_full_confidence_pct: f64,
    #[serde(default = "default_max_position")]
    pub max_position: f64,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_lookback_ms")]
    pub lookback_ms: i64,
}

impl Default for MomentumParams {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

pub struct MomentumStrategy {
    params: MomentumParams,
    assets: Vec<String>,
}

impl MomentumStrategy {
    pub const ID: &'static str = "momentum";

    /// Malformed parameters fail here, at construction — never mid-cycle.
    pub fn new(params: MomentumParams, assets: Vec<String>) -> anyhow::Result<Self> {
        if params.roc_period == 0 || params.ema_fast == 0 || params.ema_slow == 0 {
            anyhow::bail!("momentum: indicator periods must be positive");
        }
        if params.ema_fast >= params.ema_slow {
            anyhow::bail!(
                "momentum: ema_fast ({}) must be shorter than ema_slow ({})",
                params.ema_fast,
                params.ema_slow
            );
        }
        if params.roc_threshold_pct <= 0.0
            || params.roc_full_confidence_pct <= params.roc_threshold_pct
        {
            anyhow::bail!("momentum: ROC thresholds must satisfy 0 < threshold < full_confidence");
        }
        if params.max_position < 0.0 || params.stop_loss_pct <= 0.0 || params.take_profit_pct <= 0.0
        {
            anyhow::bail!("momentum: position and protective percentages must be positive");
        }
        if assets.is_empty() {
            anyhow::bail!("momentum: at least one asset is required");
        }
        Ok(Self { params, assets })
    }
}

impl Strategy for MomentumStrategy {
    fn id(&self) -> &str {
        Self::ID
    }

    fn required_series(&self) -> Vec<String> {
        self.assets.iter().map(|a| ohlcv_series(a)).collect()
    }

    fn window(&self) -> WindowSpec {
        WindowSpec {
            lookback_ms: self.params.lookback_ms,
            min_observations: self.params.ema_slow.max(self.params.roc_period) + 2,
        }
    }

    fn analyze(&self, data: &MarketSnapshot) -> anyhow::Result<Analysis> {
        let mut assets = BTreeMap::new();

        for asset in &self.assets {
            let series = ohlcv_series(asset);
            let closes = data.closes(&series);
            if closes.len() < self.window().min_observations {
                continue; // insufficient input — contribute nothing
            }

            let (Some(roc), Some(fast), Some(slow)) = (
                rate_of_change(&closes, self.params.roc_period),
                latest_ema(&closes, self.params.ema_fast),
                latest_ema(&closes, self.params.ema_slow),
            ) else {
                continue;
            };

            let latest = data
                .latest(&series)
                .expect("non-empty closes imply a latest observation");
            let last_volume = match &latest.payload {
                crate::types::ObservationPayload::Ohlcv(bar) => Some(bar.volume),
                _ => None,
            };

            let mut indicators = BTreeMap::new();
            indicators.insert(format!("roc_{}", self.params.roc_period), roc);
            indicators.insert(format!("ema_{}", self.params.ema_fast), fast);
            indicators.insert(format!("ema_{}", self.params.ema_slow), slow);

            assets.insert(
                asset.clone(),
                AssetAnalysis {
                    last_price: latest.value(),
                    last_volume,
                    as_of_ms: latest.timestamp_ms,
                    indicators,
                },
            );
        }

        Ok(Analysis {
            strategy_id: Self::ID.to_string(),
            assets,
        })
    }

    fn signals(&self, analysis: &Analysis) -> anyhow::Result<Vec<Signal>> {
        let mut out = Vec::new();

        for (asset, a) in &analysis.assets {
            let roc = a.indicators[&format!("roc_{}", self.params.roc_period)];
            let fast = a.indicators[&format!("ema_{}", self.params.ema_fast)];
            let slow = a.indicators[&format!("ema_{}", self.params.ema_slow)];

            let trend_up = fast > slow;
            let direction = if roc >= self.params.roc_threshold_pct && trend_up {
                Direction::Long
            } else if roc <= -self.params.roc_threshold_pct && !trend_up {
                Direction::Short
            } else {
                Direction::Neutral
            };

            let confidence = if direction == Direction::Neutral {
                0.0
            } else {
                (roc.abs() / self.params.roc_full_confidence_pct).clamp(0.0, 1.0)
            };

            let (stop_loss, take_profit) = protective_levels(
                direction,
                a.last_price,
                self.params.stop_loss_pct,
                self.params.take_profit_pct,
            );

            let mut context = crate::types::SignalContext::new();
            for (k, v) in &a.indicators {
                context.insert(k.clone(), serde_json::json!(v));
            }
            if let Some(volume) = a.last_volume {
                context.insert("volume".to_string(), serde_json::json!(volume));
            }

            out.push(Signal {
                strategy_id: Self::ID.to_string(),
                asset_id: asset.clone(),
                direction,
                confidence,
                strength: Strength::from_score(confidence, (0.33, 0.66)),
                timestamp_ms: a.as_of_ms,
                price_at_generation: Some(a.last_price),
                position_size: if direction == Direction::Neutral {
                    0.0
                } else {
                    self.params.max_position * confidence
                },
                stop_loss,
                take_profit,
                context,
            });
        }

        Ok(out)
    }
}
