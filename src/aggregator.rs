// =============================================================================
// Signal Aggregator — one combined signal per asset per cycle
// =============================================================================
//
// Default method is the weighted directional score:
//
//   D = sum( w_s * confidence_s * sign(direction_s) )
//
// with weights normalised over the strategies that actually contributed to
// the asset's group. |D| below the neutral threshold flattens to NEUTRAL;
// otherwise |D| is the aggregate confidence and maps to a strength bucket
// via the configured breakpoints.
//
// Determinism: groups are BTreeMaps and each group is sorted by strategy id
// before any floating-point accumulation, so any permutation of the input
// batch produces bitwise-identical output.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::errors::AggregationError;
use crate::types::{
    AggregatedSignal, AggregationMethod, Direction, Signal, SignalContext, Strength,
};

/// Position-size multipliers per strength bucket.
#[derive(Debug, Clone, Copy)]
pub struct StrengthMultipliers {
    pub weak: f64,
    pub moderate: f64,
    pub strong: f64,
}

impl Default for StrengthMultipliers {
    fn default() -> Self {
        Self {
            weak: 0.5,
            moderate: 1.0,
            strong: 1.5,
        }
    }
}

impl StrengthMultipliers {
    fn for_strength(&self, strength: Strength) -> f64 {
        match strength {
            Strength::Weak => self.weak,
            Strength::Moderate => self.moderate,
            Strength::Strong => self.strong,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub method: AggregationMethod,
    /// Per-strategy weights; must cover the enabled strategy set exactly.
    pub weights: HashMap<String, f64>,
    pub neutral_threshold: f64,
    /// `(weak_below, moderate_below)` breakpoints over |D|.
    pub strength_breakpoints: (f64, f64),
    pub strength_multipliers: StrengthMultipliers,
    pub base_position: f64,
    pub max_position: f64,
}

#[derive(Debug)]
pub struct Aggregator {
    settings: AggregatorSettings,
}

impl Aggregator {
    /// Validate the settings against the enabled strategy set. Any
    /// inconsistency fails startup — the aggregator never errors mid-cycle.
    pub fn new(
        settings: AggregatorSettings,
        enabled_strategies: &[String],
    ) -> Result<Self, AggregationError> {
        for id in enabled_strategies {
            match settings.weights.get(id) {
                None => return Err(AggregationError::MissingWeight(id.clone())),
                Some(&w) if w <= 0.0 || !w.is_finite() => {
                    return Err(AggregationError::NonPositiveWeight(id.clone(), w))
                }
                Some(_) => {}
            }
        }
        for id in settings.weights.keys() {
            if !enabled_strategies.contains(id) {
                return Err(AggregationError::UnknownStrategy(id.clone()));
            }
        }

        if !(0.0..1.0).contains(&settings.neutral_threshold) {
            return Err(AggregationError::InvalidParameter(format!(
                "neutral_threshold {} outside [0, 1)",
                settings.neutral_threshold
            )));
        }
        let (weak, moderate) = settings.strength_breakpoints;
        if !(0.0 < weak && weak < moderate && moderate <= 1.0) {
            return Err(AggregationError::InvalidParameter(format!(
                "strength breakpoints ({weak}, {moderate}) must satisfy 0 < weak < moderate <= 1"
            )));
        }
        if settings.base_position < 0.0 || settings.max_position < 0.0 {
            return Err(AggregationError::InvalidParameter(
                "positions must be non-negative".to_string(),
            ));
        }
        let m = settings.strength_multipliers;
        if m.weak <= 0.0 || m.moderate <= 0.0 || m.strong <= 0.0 {
            return Err(AggregationError::InvalidParameter(
                "strength multipliers must be positive".to_string(),
            ));
        }

        Ok(Self { settings })
    }

    pub fn method(&self) -> AggregationMethod {
        self.settings.method
    }

    /// Combine one cycle's signals into at most one aggregate per asset,
    /// ordered by asset id.
    pub fn aggregate(&self, cycle_id: &str, signals: &[Signal]) -> Vec<AggregatedSignal> {
        let mut groups: BTreeMap<String, Vec<&Signal>> = BTreeMap::new();
        for signal in signals {
            if !self.settings.weights.contains_key(&signal.strategy_id) {
                warn!(
                    strategy = %signal.strategy_id,
                    "signal from unweighted strategy dropped"
                );
                continue;
            }
            groups.entry(signal.asset_id.clone()).or_default().push(signal);
        }

        groups
            .into_iter()
            .map(|(asset, mut group)| {
                group.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
                match self.settings.method {
                    AggregationMethod::WeightedAverage => {
                        self.weighted_average(cycle_id, &asset, &group)
                    }
                    AggregationMethod::MajorityVote => self.majority_vote(cycle_id, &asset, &group),
                    AggregationMethod::MaxConfidence => {
                        self.max_confidence(cycle_id, &asset, &group)
                    }
                }
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // weighted_average
    // -------------------------------------------------------------------------

    fn weighted_average(&self, cycle_id: &str, asset: &str, group: &[&Signal]) -> AggregatedSignal {
        let weight_sum: f64 = group
            .iter()
            .map(|s| self.settings.weights[&s.strategy_id])
            .sum();

        let mut score = 0.0;
        let mut contributions = SignalContext::new();
        for signal in group {
            let w = self.settings.weights[&signal.strategy_id] / weight_sum;
            let contribution = w * signal.confidence * signal.direction.sign();
            score += contribution;
            contributions.insert(signal.strategy_id.clone(), serde_json::json!(contribution));
        }

        let (direction, confidence) = if score.abs() < self.settings.neutral_threshold {
            (Direction::Neutral, score.abs())
        } else if score > 0.0 {
            (Direction::Long, score.abs())
        } else {
            (Direction::Short, score.abs())
        };

        self.build(cycle_id, asset, group, direction, confidence, contributions)
    }

    // -------------------------------------------------------------------------
    // majority_vote
    // -------------------------------------------------------------------------

    fn majority_vote(&self, cycle_id: &str, asset: &str, group: &[&Signal]) -> AggregatedSignal {
        let longs: Vec<&&Signal> = group
            .iter()
            .filter(|s| s.direction == Direction::Long)
            .collect();
        let shorts: Vec<&&Signal> = group
            .iter()
            .filter(|s| s.direction == Direction::Short)
            .collect();

        let (direction, winners) = if longs.len() > shorts.len() {
            (Direction::Long, longs)
        } else if shorts.len() > longs.len() {
            (Direction::Short, shorts)
        } else {
            (Direction::Neutral, Vec::new())
        };

        let confidence = if winners.is_empty() {
            0.0
        } else {
            winners.iter().map(|s| s.confidence).sum::<f64>() / winners.len() as f64
        };

        let mut context = SignalContext::new();
        context.insert("votes_long".to_string(), serde_json::json!(longs_count(group)));
        context.insert("votes_short".to_string(), serde_json::json!(shorts_count(group)));

        self.build(cycle_id, asset, group, direction, confidence, context)
    }

    // -------------------------------------------------------------------------
    // max_confidence
    // -------------------------------------------------------------------------

    fn max_confidence(&self, cycle_id: &str, asset: &str, group: &[&Signal]) -> AggregatedSignal {
        // Group is sorted by strategy id; only a strictly greater confidence
        // replaces the running winner, so ties resolve to the first id.
        let mut winner = group[0];
        for signal in &group[1..] {
            if signal.confidence > winner.confidence {
                winner = signal;
            }
        }

        let mut contributors: Vec<String> =
            group.iter().map(|s| s.strategy_id.clone()).collect();
        contributors.dedup();

        let mut context = SignalContext::new();
        context.insert(
            "selected_strategy".to_string(),
            serde_json::json!(winner.strategy_id),
        );

        AggregatedSignal {
            cycle_id: cycle_id.to_string(),
            asset_id: asset.to_string(),
            direction: winner.direction,
            confidence: winner.confidence,
            strength: winner.strength,
            timestamp_ms: latest_timestamp(group),
            price_at_generation: winner.price_at_generation,
            position_size: winner.position_size.min(self.settings.max_position),
            stop_loss: winner.stop_loss,
            take_profit: winner.take_profit,
            contributors,
            method: AggregationMethod::MaxConfidence,
            context,
        }
    }

    // -------------------------------------------------------------------------
    // Shared assembly
    // -------------------------------------------------------------------------

    fn build(
        &self,
        cycle_id: &str,
        asset: &str,
        group: &[&Signal],
        direction: Direction,
        confidence: f64,
        context: SignalContext,
    ) -> AggregatedSignal {
        let strength = Strength::from_score(confidence, self.settings.strength_breakpoints);

        let position_size = if direction == Direction::Neutral {
            0.0
        } else {
            (self.settings.base_position
                * confidence
                * self.settings.strength_multipliers.for_strength(strength))
            .min(self.settings.max_position)
            .max(0.0)
        };

        let price_at_generation = volume_weighted_price(group);

        // Protective levels: average only over contributors that agree with
        // the final direction (their levels already sit on the right side of
        // their own entry), then drop anything the aggregate price moved to
        // the wrong side of.
        let (stop_loss, take_profit) = if direction == Direction::Neutral {
            (None, None)
        } else {
            let aligned: Vec<&&Signal> =
                group.iter().filter(|s| s.direction == direction).collect();
            let sl = mean_of(aligned.iter().filter_map(|s| s.stop_loss));
            let tp = mean_of(aligned.iter().filter_map(|s| s.take_profit));
            constrain_levels(direction, price_at_generation, sl, tp)
        };

        let mut contributors: Vec<String> =
            group.iter().map(|s| s.strategy_id.clone()).collect();
        contributors.dedup();

        AggregatedSignal {
            cycle_id: cycle_id.to_string(),
            asset_id: asset.to_string(),
            direction,
            confidence,
            strength,
            timestamp_ms: latest_timestamp(group),
            price_at_generation,
            position_size,
            stop_loss,
            take_profit,
            contributors,
            method: self.settings.method,
            context,
        }
    }
}

// ---------------------------------------------------------------------------
// Group helpers
// ---------------------------------------------------------------------------

fn longs_count(group: &[&Signal]) -> usize {
    group.iter().filter(|s| s.direction == Direction::Long).count()
}

fn shorts_count(group: &[&Signal]) -> usize {
    group.iter().filter(|s| s.direction == Direction::Short).count()
}

fn latest_timestamp(group: &[&Signal]) -> i64 {
    group.iter().map(|s| s.timestamp_ms).max().unwrap_or(0)
}

/// Volume-weighted average of the contributors' prices, using the `volume`
/// context annotation. Contributors without a volume weigh in equally at the
/// group's mean volume; with a single priced contributor its price is used
/// as-is.
fn volume_weighted_price(group: &[&Signal]) -> Option<f64> {
    let priced: Vec<(&&Signal, f64)> = group
        .iter()
        .filter_map(|s| s.price_at_generation.map(|p| (s, p)))
        .collect();

    match priced.len() {
        0 => None,
        1 => Some(priced[0].1),
        _ => {
            let volumes: Vec<Option<f64>> = priced
                .iter()
                .map(|(s, _)| s.context.get("volume").and_then(|v| v.as_f64()))
                .collect();
            let known: Vec<f64> = volumes.iter().filter_map(|v| *v).collect();
            let fallback = if known.is_empty() {
                1.0
            } else {
                known.iter().sum::<f64>() / known.len() as f64
            };

            let mut weighted = 0.0;
            let mut total = 0.0;
            for ((_, price), volume) in priced.iter().zip(volumes.iter()) {
                let w = volume.unwrap_or(fallback).max(f64::MIN_POSITIVE);
                weighted += price * w;
                total += w;
            }
            Some(weighted / total)
        }
    }
}

fn mean_of(values: impl Iterator<Item = f64>) -> Option<f64> {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        None
    } else {
        Some(collected.iter().sum::<f64>() / collected.len() as f64)
    }
}

/// Drop any averaged level that ended up on the wrong side of the aggregate
/// price, so the §3 invariants hold by construction.
fn constrain_levels(
    direction: Direction,
    price: Option<f64>,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
) -> (Option<f64>, Option<f64>) {
    let Some(price) = price else {
        return (stop_loss, take_profit);
    };
    let sl = stop_loss.filter(|&sl| match direction {
        Direction::Long => sl < price,
        Direction::Short => sl > price,
        Direction::Neutral => false,
    });
    let tp = take_profit.filter(|&tp| match direction {
        Direction::Long => tp > price,
        Direction::Short => tp < price,
        Direction::Neutral => false,
    });
    (sl, tp)
}
