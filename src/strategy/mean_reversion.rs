// =============================================================================
// Mean reversion strategy — RSI extremes
// =============================================================================
//
// Fades the move: oversold RSI buys, overbought RSI sells. Confidence grows
// linearly with the distance past the threshold.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::indicators::relative_strength_index;
use crate::strategy::{
    protective_levels, Analysis, AssetAnalysis, MarketSnapshot, Strategy, WindowSpec,
};
use crate::types::{ohlcv_series, Direction, Signal, Strength};

fn default_rsi_period() -> usize {
    14
}
fn default_oversold() -> f64 {
    30.0
}
fn default_overbought() -> f64 {
    70.0
}
fn default_max_position() -> f64 {
    1.0
}
fn default_stop_loss_pct() -> f64 {
    1.5
}
fn default_take_profit_pct() -> f64 {
    3.0
}
fn default_lookback_ms() -> i64 {
    24 * 3_600_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeanReversionParams {
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_oversold")]
    pub oversold: f64,
    #[serde(default = "default_overbought")]
    pub overbought: f64,
    #[serde(default = "default_max_position")]
    pub max_position: f64,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_lookback_ms")]
    pub lookback_ms: i64,
}

impl Default for MeanReversionParams {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

pub struct MeanReversionStrategy {
    params: MeanReversionParams,
    assets: Vec<String>,
}

impl MeanReversionStrategy {
    pub const ID: &'static str = "mean_reversion";

    pub fn new(params: MeanReversionParams, assets: Vec<String>) -> anyhow::Result<Self> {
        if params.rsi_period == 0 {
            anyhow::bail!("mean_reversion: rsi_period must be positive");
        }
        if !(0.0 < params.oversold
            && params.oversold < params.overbought
            && params.overbought < 100.0)
        {
            anyhow::bail!(
                "mean_reversion: thresholds must satisfy 0 < oversold < overbought < 100 \
                 (got {} / {})",
                params.oversold,
                params.overbought
            );
        }
        if params.max_position < 0.0 || params.stop_loss_pct <= 0.0 || params.take_profit_pct <= 0.0
        {
            anyhow::bail!("mean_reversion: position and protective percentages must be positive");
        }
        if assets.is_empty() {
            anyhow::bail!("mean_reversion: at least one asset is required");
        }
        Ok(Self { params, assets })
    }
}

impl Strategy for MeanReversionStrategy {
    fn id(&self) -> &str {
        Self::ID
    }

    fn required_series(&self) -> Vec<String> {
        self.assets.iter().map(|a| ohlcv_series(a)).collect()
    }

    fn window(&self) -> WindowSpec {
        WindowSpec {
            lookback_ms: self.params.lookback_ms,
            min_observations: self.params.rsi_period + 2,
        }
    }

    fn analyze(&self, data: &MarketSnapshot) -> anyhow::Result<Analysis> {
        let mut assets = BTreeMap::new();

        for asset in &self.assets {
            let series = ohlcv_series(asset);
            let closes = data.closes(&series);
            let Some(rsi) = relative_strength_index(&closes, self.params.rsi_period) else {
                continue;
            };
            let latest = data.latest(&series).expect("RSI implies observations");

            let last_volume = match &latest.payload {
                crate::types::ObservationPayload::Ohlcv(bar) => Some(bar.volume),
                _ => None,
            };

            let mut indicators = BTreeMap::new();
            indicators.insert(format!("rsi_{}", self.params.rsi_period), rsi);

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
            let rsi = a.indicators[&format!("rsi_{}", self.params.rsi_period)];

            // Distance past the threshold, normalised to the room available.
            let (direction, confidence) = if rsi <= self.params.oversold {
                (
                    Direction::Long,
                    ((self.params.oversold - rsi) / self.params.oversold).clamp(0.0, 1.0),
                )
            } else if rsi >= self.params.overbought {
                (
                    Direction::Short,
                    ((rsi - self.params.overbought) / (100.0 - self.params.overbought))
                        .clamp(0.0, 1.0),
                )
            } else {
                (Direction::Neutral, 0.0)
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

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Observation, Ohlcv};
    use std::collections::HashMap;

    fn snapshot_from_closes(closes: &[f64]) -> MarketSnapshot {
        let series = ohlcv_series("bitcoin");
        let observations = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                Observation::ohlcv(
                    series.clone(),
                    (i as i64 + 1) * 900_000,
                    Ohlcv {
                        open: c,
                        high: c + 0.5,
                        low: c - 0.5,
                        close: c,
                        volume: 50.0,
                    },
                )
            })
            .collect();
        MarketSnapshot::new(HashMap::from([(series, observations)]))
    }

    fn strategy() -> MeanReversionStrategy {
        MeanReversionStrategy::new(MeanReversionParams::default(), vec!["bitcoin".into()]).unwrap()
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut p = MeanReversionParams::default();
        p.oversold = 80.0; // above overbought
        assert!(MeanReversionStrategy::new(p, vec!["bitcoin".into()]).is_err());
    }

    #[test]
    fn crash_triggers_a_long() {
        // Straight sell-off drives RSI to ~0 -> maximum-confidence fade.
        let closes: Vec<f64> = (0..30).map(|i| 200.0 - 2.0 * i as f64).collect();
        let s = strategy();
        let signals = s
            .signals(&s.analyze(&snapshot_from_closes(&closes)).unwrap())
            .unwrap();

        assert_eq!(signals[0].direction, Direction::Long);
        assert!(signals[0].confidence > 0.9);
        assert!(signals[0].validate().is_ok());
    }

    #[test]
    fn melt_up_triggers_a_short() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + 2.0 * i as f64).collect();
        let s = strategy();
        let signals = s
            .signals(&s.analyze(&snapshot_from_closes(&closes)).unwrap())
            .unwrap();

        assert_eq!(signals[0].direction, Direction::Short);
        // SHORT protective levels flip sides.
        let price = signals[0].price_at_generation.unwrap();
        assert!(signals[0].stop_loss.unwrap() > price);
        assert!(signals[0].take_profit.unwrap() < price);
    }

    #[test]
    fn mid_range_rsi_is_neutral() {
        let closes: Vec<f64> = (0..30)
            .map(|i| 100.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let s = strategy();
        let signals = s
            .signals(&s.analyze(&snapshot_from_closes(&closes)).unwrap())
            .unwrap();

        assert_eq!(signals[0].direction, Direction::Neutral);
        assert_eq!(signals[0].position_size, 0.0);
    }

    #[test]
    fn short_history_contributes_nothing() {
        let s = strategy();
        let analysis = s.analyze(&snapshot_from_closes(&[100.0, 101.0])).unwrap();
        assert!(analysis.assets.is_empty());
    }
}
