// =============================================================================
// Shared types used across the Meridian signal pipeline
// =============================================================================
//
// Everything that crosses a component boundary lives here: collected
// observations, per-strategy signals, and the aggregated per-asset signal
// produced once per cycle. Signals are immutable once emitted; the only code
// that constructs an AggregatedSignal is the aggregator.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Series id conventions
// ---------------------------------------------------------------------------

/// Prefix that routes a series to the macro observation table.
pub const MACRO_SERIES_PREFIX: &str = "macro:";

/// Series id for an asset's OHLCV stream, e.g. `bitcoin:ohlcv`.
pub fn ohlcv_series(asset: &str) -> String {
    format!("{asset}:ohlcv")
}

/// Series id for a macro indicator, e.g. `macro:VIX`.
pub fn macro_series(indicator: &str) -> String {
    format!("{MACRO_SERIES_PREFIX}{indicator}")
}

/// If `series_id` names a macro series, return the indicator part.
pub fn macro_indicator(series_id: &str) -> Option<&str> {
    series_id.strip_prefix(MACRO_SERIES_PREFIX)
}

// ---------------------------------------------------------------------------
// Observations
// ---------------------------------------------------------------------------

/// One OHLCV bar as collected from a market-data provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// The semantic payload of a single observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservationPayload {
    /// A full OHLCV bar (asset price series).
    Ohlcv(Ohlcv),
    /// A scalar value (macro indicator series).
    Scalar { value: f64 },
}

/// A single durable time-series record.
///
/// `(series_id, timestamp_ms)` is unique in the store; re-inserting the same
/// key is a silent no-op. Timestamps are UTC epoch milliseconds everywhere —
/// providers that report seconds or date strings are normalised at ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub series_id: String,
    pub timestamp_ms: i64,
    pub payload: ObservationPayload,
}

impl Observation {
    pub fn ohlcv(series_id: impl Into<String>, timestamp_ms: i64, bar: Ohlcv) -> Self {
        Self {
            series_id: series_id.into(),
            timestamp_ms,
            payload: ObservationPayload::Ohlcv(bar),
        }
    }

    pub fn scalar(series_id: impl Into<String>, timestamp_ms: i64, value: f64) -> Self {
        Self {
            series_id: series_id.into(),
            timestamp_ms,
            payload: ObservationPayload::Scalar { value },
        }
    }

    /// Close price for OHLCV payloads, the raw value for scalars.
    pub fn value(&self) -> f64 {
        match &self.payload {
            ObservationPayload::Ohlcv(bar) => bar.close,
            ObservationPayload::Scalar { value } => *value,
        }
    }
}

// ---------------------------------------------------------------------------
// Direction / Strength
// ---------------------------------------------------------------------------

/// Trade direction of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    /// Sign used by the directional score: LONG = +1, SHORT = -1, NEUTRAL = 0.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
            Self::Neutral => 0.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Qualitative strength bucket derived from the directional score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strength {
    Weak,
    Moderate,
    Strong,
}

impl Strength {
    /// Map an absolute score onto a strength bucket using the configured
    /// breakpoints `(weak_below, moderate_below)`.
    pub fn from_score(score: f64, breakpoints: (f64, f64)) -> Self {
        let s = score.abs();
        if s < breakpoints.0 {
            Self::Weak
        } else if s < breakpoints.1 {
            Self::Moderate
        } else {
            Self::Strong
        }
    }
}

impl std::fmt::Display for Strength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Weak => write!(f, "WEAK"),
            Self::Moderate => write!(f, "MODERATE"),
            Self::Strong => write!(f, "STRONG"),
        }
    }
}

/// How per-strategy signals are combined into one signal per asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    WeightedAverage,
    MajorityVote,
    MaxConfidence,
}

impl std::fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WeightedAverage => write!(f, "weighted_average"),
            Self::MajorityVote => write!(f, "majority_vote"),
            Self::MaxConfidence => write!(f, "max_confidence"),
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Free-form keyed annotations attached to a signal (contributing indicator
/// values, observed volume, and so on). BTreeMap keeps serialisation order
/// stable.
pub type SignalContext = BTreeMap<String, serde_json::Value>;

/// Output of a single strategy for a single asset in one cycle.
///
/// Immutable once emitted. Invariants (checked by [`Signal::validate`]):
/// NEUTRAL implies `position_size == 0`; stop-loss and take-profit lie on the
/// correct side of `price_at_generation` for the direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub strategy_id: String,
    pub asset_id: String,
    pub direction: Direction,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    pub strength: Strength,
    pub timestamp_ms: i64,
    /// Price observed when the signal was generated, if the strategy had one.
    pub price_at_generation: Option<f64>,
    pub position_size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub context: SignalContext,
}

impl Signal {
    /// Check the signal invariants, returning a description of the first
    /// violation found.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) || !self.confidence.is_finite() {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        if self.position_size < 0.0 || !self.position_size.is_finite() {
            return Err(format!("negative position size {}", self.position_size));
        }
        if self.direction == Direction::Neutral && self.position_size != 0.0 {
            return Err("NEUTRAL signal with non-zero position size".to_string());
        }
        if let Some(price) = self.price_at_generation {
            if !price.is_finite() || price <= 0.0 {
                return Err(format!("invalid price_at_generation {price}"));
            }
            match self.direction {
                Direction::Long => {
                    if let Some(sl) = self.stop_loss {
                        if sl >= price {
                            return Err(format!("LONG stop_loss {sl} >= price {price}"));
                        }
                    }
                    if let Some(tp) = self.take_profit {
                        if tp <= price {
                            return Err(format!("LONG take_profit {tp} <= price {price}"));
                        }
                    }
                }
                Direction::Short => {
                    if let Some(sl) = self.stop_loss {
                        if sl <= price {
                            return Err(format!("SHORT stop_loss {sl} <= price {price}"));
                        }
                    }
                    if let Some(tp) = self.take_profit {
                        if tp >= price {
                            return Err(format!("SHORT take_profit {tp} >= price {price}"));
                        }
                    }
                }
                Direction::Neutral => {}
            }
        }
        Ok(())
    }
}

/// The single combined signal per asset per cycle, produced by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedSignal {
    pub cycle_id: String,
    pub asset_id: String,
    pub direction: Direction,
    pub confidence: f64,
    pub strength: Strength,
    pub timestamp_ms: i64,
    pub price_at_generation: Option<f64>,
    pub position_size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Ids of every strategy whose signal was in the asset group, sorted.
    pub contributors: Vec<String>,
    pub method: AggregationMethod,
    #[serde(default)]
    pub context: SignalContext,
}

impl AggregatedSignal {
    /// Same invariants as [`Signal::validate`], applied to the aggregate.
    pub fn validate(&self) -> Result<(), String> {
        let as_signal = Signal {
            strategy_id: String::new(),
            asset_id: self.asset_id.clone(),
            direction: self.direction,
            confidence: self.confidence,
            strength: self.strength,
            timestamp_ms: self.timestamp_ms,
            price_at_generation: self.price_at_generation,
            position_size: self.position_size,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            context: SignalContext::new(),
        };
        as_signal.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn base_signal() -> Signal {
        Signal {
            strategy_id: "momentum".into(),
            asset_id: "bitcoin".into(),
            direction: Direction::Long,
            confidence: 0.7,
            strength: Strength::Moderate,
            timestamp_ms: 1_700_000_000_000,
            price_at_generation: Some(40_000.0),
            position_size: 0.5,
            stop_loss: Some(39_200.0),
            take_profit: Some(41_600.0),
            context: SignalContext::new(),
        }
    }

    #[test]
    fn direction_signs() {
        assert_eq!(Direction::Long.sign(), 1.0);
        assert_eq!(Direction::Short.sign(), -1.0);
        assert_eq!(Direction::Neutral.sign(), 0.0);
    }

    #[test]
    fn strength_breakpoint_mapping() {
        let bp = (0.33, 0.66);
        assert_eq!(Strength::from_score(0.1, bp), Strength::Weak);
        assert_eq!(Strength::from_score(0.33, bp), Strength::Moderate);
        assert_eq!(Strength::from_score(0.5, bp), Strength::Moderate);
        assert_eq!(Strength::from_score(0.9, bp), Strength::Strong);
    }

    #[test]
    fn valid_long_signal_passes() {
        assert!(base_signal().validate().is_ok());
    }

    #[test]
    fn neutral_with_position_size_rejected() {
        let mut s = base_signal();
        s.direction = Direction::Neutral;
        s.stop_loss = None;
        s.take_profit = None;
        assert!(s.validate().is_err());

        s.position_size = 0.0;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn stop_loss_on_wrong_side_rejected() {
        let mut s = base_signal();
        s.stop_loss = Some(40_500.0); // above entry for a LONG
        assert!(s.validate().is_err());

        let mut s = base_signal();
        s.direction = Direction::Short;
        s.stop_loss = Some(40_800.0);
        s.take_profit = Some(38_000.0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn direction_serialises_uppercase() {
        let json = serde_json::to_string(&Direction::Long).unwrap();
        assert_eq!(json, r#""LONG""#);
        let json = serde_json::to_string(&Strength::Strong).unwrap();
        assert_eq!(json, r#""STRONG""#);
        let json = serde_json::to_string(&AggregationMethod::WeightedAverage).unwrap();
        assert_eq!(json, r#""weighted_average""#);
    }

    #[test]
    fn series_id_helpers() {
        assert_eq!(ohlcv_series("bitcoin"), "bitcoin:ohlcv");
        assert_eq!(macro_series("VIX"), "macro:VIX");
        assert_eq!(macro_indicator("macro:VIX"), Some("VIX"));
        assert_eq!(macro_indicator("bitcoin:ohlcv"), None);
    }

    #[test]
    fn observation_value_accessor() {
        let bar = Ohlcv {
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        };
        assert_eq!(Observation::ohlcv("bitcoin:ohlcv", 1, bar).value(), 1.5);
        assert_eq!(Observation::scalar("macro:VIX", 1, 18.2).value(), 18.2);
    }
}
