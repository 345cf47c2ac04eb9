// =============================================================================
// Volatility breakout strategy — Bollinger band escapes with ATR stops
// =============================================================================
//
// A close outside the bands is a breakout in that direction; confidence
// scales with how far past the band the close landed (%B). Protective levels
// are ATR multiples rather than fixed percentages, so stops widen with
// realised volatility.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::indicators::{average_true_range, bollinger_bands};
use crate::strategy::{Analysis, AssetAnalysis, MarketSnapshot, Strategy, WindowSpec};
use crate::types::{ohlcv_series, Direction, Signal, Strength};

fn default_band_period() -> usize {
    20
}
fn default_band_k() -> f64 {
    2.0
}
fn default_atr_period() -> usize {
    14
}
fn default_sl_atr_multiplier() -> f64 {
    1.5
}
fn default_tp_atr_multiplier() -> f64 {
    3.0
}
fn default_max_position() -> f64 {
    1.0
}
fn default_lookback_ms() -> i64 {
    36 * 3_600_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolBreakoutParams {
    #[serde(default = "default_band_period")]
    pub band_period: usize,
    #[serde(default = "default_band_k")]
    pub band_k: f64,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_sl_atr_multiplier")]
    pub sl_atr_multiplier: f64,
    #[serde(default = "default_tp_atr_multiplier")]
    pub tp_atr_multiplier: f64,
    #[serde(default = "default_max_position")]
    pub max_position: f64,
    #[serde(default = "default_lookback_ms")]
    pub lookback_ms: i64,
}

impl Default for VolBreakoutParams {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

pub struct VolBreakoutStrategy {
    params: VolBreakoutParams,
    assets: Vec<String>,
}

impl VolBreakoutStrategy {
    pub const ID: &'static str = "vol_breakout";

    pub fn new(params: VolBreakoutParams, assets: Vec<String>) -> anyhow::Result<Self> {
        if params.band_period < 2 || params.atr_period == 0 {
            anyhow::bail!("vol_breakout: indicator periods too short");
        }
        if params.band_k <= 0.0 {
            anyhow::bail!("vol_breakout: band_k must be positive");
        }
        if params.sl_atr_multiplier <= 0.0
            || params.tp_atr_multiplier <= params.sl_atr_multiplier
        {
            anyhow::bail!(
                "vol_breakout: ATR multipliers must satisfy 0 < sl < tp (got {} / {})",
                params.sl_atr_multiplier,
                params.tp_atr_multiplier
            );
        }
        if params.max_position < 0.0 {
            anyhow::bail!("vol_breakout: max_position must be non-negative");
        }
        if assets.is_empty() {
            anyhow::bail!("vol_breakout: at least one asset is required");
        }
        Ok(Self { params, assets })
    }
}

impl Strategy for VolBreakoutStrategy {
    fn id(&self) -> &str {
        Self::ID
    }

    fn required_series(&self) -> Vec<String> {
        self.assets.iter().map(|a| ohlcv_series(a)).collect()
    }

    fn window(&self) -> WindowSpec {
        WindowSpec {
            lookback_ms: self.params.lookback_ms,
            min_observations: self.params.band_period.max(self.params.atr_period + 1) + 2,
        }
    }

    fn analyze(&self, data: &MarketSnapshot) -> anyhow::Result<Analysis> {
        let mut assets = BTreeMap::new();

        for asset in &self.assets {
            let series = ohlcv_series(asset);
            let bars = data.bars(&series);
            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

            let (Some(bands), Some(atr)) = (
                bollinger_bands(&closes, self.params.band_period, self.params.band_k),
                average_true_range(&bars, self.params.atr_period),
            ) else {
                continue;
            };

            let latest = data.latest(&series).expect("bands imply observations");
            let last_volume = bars.last().map(|b| b.volume);

            let mut indicators = BTreeMap::new();
            indicators.insert("percent_b".to_string(), bands.percent_b);
            indicators.insert("band_width".to_string(), bands.width);
            indicators.insert(format!("atr_{}", self.params.atr_period), atr);

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
            let percent_b = a.indicators["percent_b"];
            let atr = a.indicators[&format!("atr_{}", self.params.atr_period)];
            let price = a.last_price;

            // Overshoot past the band, in band-widths: %B of 1.25 is a 0.25
            // overshoot. Full confidence at half a band-width beyond.
            let (direction, overshoot) = if percent_b > 1.0 {
                (Direction::Long, percent_b - 1.0)
            } else if percent_b < 0.0 {
                (Direction::Short, -percent_b)
            } else {
                (Direction::Neutral, 0.0)
            };
            let confidence = (overshoot * 2.0).clamp(0.0, 1.0);

            let (stop_loss, take_profit) = match direction {
                Direction::Long => (
                    Some(price - self.params.sl_atr_multiplier * atr),
                    Some(price + self.params.tp_atr_multiplier * atr),
                ),
                Direction::Short => (
                    Some(price + self.params.sl_atr_multiplier * atr),
                    Some(price - self.params.tp_atr_multiplier * atr),
                ),
                Direction::Neutral => (None, None),
            };

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
                price_at_generation: Some(price),
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
