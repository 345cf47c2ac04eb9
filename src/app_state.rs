// =============================================================================
// Central Application State — Meridian pipeline
// =============================================================================
//
// The single explicit owner of every shared component: store, clock, rate
// budgets, the scheduler's published task view, dispatcher statistics, the
// operational alert log, and the last cycle summary. Constructed once in
// main and threaded into each component — there is no module-level global
// state anywhere in the pipeline.
//
// Thread safety:
//   - Atomic counter for version tracking.
//   - parking_lot::RwLock for mutable shared values.
//   - Components with interior mutability are shared via Arc.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::health::{DispatcherStats, HealthReporter, HealthSnapshot, OpsLog};
use crate::ratelimit::{RateBudgetSnapshot, RateBudgets};
use crate::runner::{CycleSummary, SharedCycleSummary};
use crate::scheduler::engine::SharedTaskView;
use crate::store::Store;

/// Central application state shared across all async tasks via
/// `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on meaningful state
    /// changes so pollers of `/state` can detect them cheaply.
    pub state_version: AtomicU64,

    pub config: Arc<RwLock<AppConfig>>,
    pub store: Arc<Store>,
    pub clock: Arc<dyn Clock>,
    pub budgets: Arc<RateBudgets>,

    pub task_view: SharedTaskView,
    pub dispatcher_stats: Arc<DispatcherStats>,
    pub ops: Arc<OpsLog>,
    pub last_cycle: SharedCycleSummary,

    pub health: HealthReporter,

    pub start_time: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        budgets: Arc<RateBudgets>,
        task_view: SharedTaskView,
        dispatcher_stats: Arc<DispatcherStats>,
        ops: Arc<OpsLog>,
        last_cycle: SharedCycleSummary,
        health: HealthReporter,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config,
            store,
            clock,
            budgets,
            task_view,
            dispatcher_stats,
            ops,
            last_cycle,
            health,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Build the full serialisable snapshot served by `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.config.read();

        let config_summary = ConfigSummary {
            tiers: config
                .scheduling
                .tiers
                .iter()
                .map(|t| TierSummary {
                    name: t.name.clone(),
                    interval_ms: t.interval_ms,
                    task_count: t.task_ids.len(),
                })
                .collect(),
            enabled_strategies: config.strategies.enabled.clone(),
            assets: config.strategies.assets.clone(),
            aggregation_method: config.aggregation.method.to_string(),
            emit_threshold: config.aggregation.emit_threshold,
            channels: config
                .notifications
                .channels
                .iter()
                .map(|c| c.settings.id.clone())
                .collect(),
        };

        StateSnapshot {
            state_version: self.state_version.load(Ordering::SeqCst),
            server_time_ms: self.clock.now_ms(),
            uptime_s: self.start_time.elapsed().as_secs(),
            config: config_summary,
            health: self.health.snapshot(),
            rate_budgets: self.budgets.snapshots(),
            last_cycle: self.last_cycle.read().clone(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TierSummary {
    pub name: String,
    pub interval_ms: i64,
    pub task_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub tiers: Vec<TierSummary>,
    pub enabled_strategies: Vec<String>,
    pub assets: Vec<String>,
    pub aggregation_method: String,
    pub emit_threshold: f64,
    pub channels: Vec<String>,
}

/// Full engine state snapshot for the operator API.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time_ms: i64,
    pub uptime_s: u64,
    pub config: ConfigSummary,
    pub health: HealthSnapshot,
    pub rate_budgets: Vec<RateBudgetSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle: Option<CycleSummary>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use std::collections::HashMap;

    fn state() -> AppState {
        let config = Arc::new(RwLock::new(AppConfig::default()));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SimClock::new(42_000));
        let budgets = Arc::new(RateBudgets::new());
        let task_view: SharedTaskView = Arc::new(RwLock::new(Vec::new()));
        let dispatcher_stats = Arc::new(DispatcherStats::default());
        let ops = Arc::new(OpsLog::new(8));
        let last_cycle: SharedCycleSummary = Arc::new(RwLock::new(None));

        let health = HealthReporter::new(
            store.clone(),
            clock.clone(),
            task_view.clone(),
            dispatcher_stats.clone(),
            ops.clone(),
            HashMap::new(),
        );

        AppState::new(
            config,
            store,
            clock,
            budgets,
            task_view,
            dispatcher_stats,
            ops,
            last_cycle,
            health,
        )
    }

    #[test]
    fn snapshot_reflects_config_and_clock() {
        let s = state();
        let snap = s.build_snapshot();

        assert_eq!(snap.server_time_ms, 42_000);
        assert_eq!(snap.config.tiers.len(), 4);
        assert_eq!(snap.config.enabled_strategies.len(), 3);
        assert_eq!(snap.config.channels, vec!["log"]);
        assert!(snap.last_cycle.is_none());
        assert_eq!(snap.health.status, "ok");
    }

    #[test]
    fn version_increments() {
        let s = state();
        let v0 = s.state_version.load(Ordering::SeqCst);
        s.increment_version();
        assert_eq!(s.state_version.load(Ordering::SeqCst), v0 + 1);
    }

    #[test]
    fn snapshot_serialises_to_json() {
        let snap = state().build_snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert!(json["config"]["aggregation_method"].is_string());
        assert!(json["health"]["status"].is_string());
        assert!(json.get("last_cycle").is_none()); // skipped when None
    }
}
