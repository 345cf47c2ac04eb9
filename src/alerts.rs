// =============================================================================
// Alert Emitter — one self-contained JSON record per emitted signal
// =============================================================================
//
// Aggregated signals whose confidence clears the emit threshold are written
// to the alert directory as
//
//   {category}_{asset}_{yyyymmdd_hhmmss}.{seq}.json
//
// where category is the lowercased direction and seq disambiguates writes
// that land in the same second. Files are written atomically (tmp + rename)
// so a crash can never leave a half-written record behind.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{AggregatedSignal, AggregationMethod, Direction, SignalContext, Strength};

/// The on-disk alert schema. Everything a downstream consumer needs is in
/// the record itself; no joins against the store are required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub timestamp_ms: i64,
    pub cycle_id: String,
    pub asset: String,
    pub direction: Direction,
    pub confidence: f64,
    pub strength: Strength,
    pub price: f64,
    pub position_size: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub contributors: Vec<String>,
    pub method: AggregationMethod,
    pub context: SignalContext,
}

impl AlertRecord {
    pub fn from_signal(signal: &AggregatedSignal) -> Self {
        Self {
            timestamp_ms: signal.timestamp_ms,
            cycle_id: signal.cycle_id.clone(),
            asset: signal.asset_id.clone(),
            direction: signal.direction,
            confidence: signal.confidence,
            strength: signal.strength,
            price: signal.price_at_generation.unwrap_or(0.0),
            position_size: signal.position_size,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            contributors: signal.contributors.clone(),
            method: signal.method,
            context: signal.context.clone(),
        }
    }
}

pub struct AlertEmitter {
    dir: PathBuf,
    emit_threshold: f64,
    /// `(last second stamp, sequence within that second)`.
    seq: Mutex<(String, u32)>,
}

impl AlertEmitter {
    pub fn new(dir: impl Into<PathBuf>, emit_threshold: f64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create alert directory {}", dir.display()))?;
        Ok(Self {
            dir,
            emit_threshold,
            seq: Mutex::new((String::new(), 0)),
        })
    }

    /// Write an alert record if the signal clears the emit threshold.
    /// Returns the path written, or `None` when the signal was below
    /// threshold.
    pub fn emit(&self, signal: &AggregatedSignal) -> Result<Option<PathBuf>> {
        if signal.confidence < self.emit_threshold {
            debug!(
                asset = %signal.asset_id,
                confidence = signal.confidence,
                threshold = self.emit_threshold,
                "signal below emit threshold — no alert record"
            );
            return Ok(None);
        }

        let record = AlertRecord::from_signal(signal);
        let stamp = Utc
            .timestamp_millis_opt(signal.timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y%m%d_%H%M%S")
            .to_string();

        let seq = {
            let mut guard = self.seq.lock();
            if guard.0 == stamp {
                guard.1 += 1;
            } else {
                *guard = (stamp.clone(), 0);
            }
            guard.1
        };

        let category = signal.direction.to_string().to_lowercase();
        let filename = format!("{category}_{}_{stamp}.{seq}.json", signal.asset_id);
        let path = self.dir.join(&filename);

        let body = serde_json::to_string_pretty(&record)
            .context("failed to serialise alert record")?;

        // Atomic write: tmp sibling, then rename.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &body)
            .with_context(|| format!("failed to write alert tmp file {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename alert file to {}", path.display()))?;

        info!(
            asset = %signal.asset_id,
            direction = %signal.direction,
            confidence = signal.confidence,
            file = %filename,
            "alert record written"
        );
        Ok(Some(path))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
