// =============================================================================
// Health Reporter — freshness and liveness of every component
// =============================================================================
//
// The reporter pulls from read-only views the components publish: per-series
// store health, the scheduler's task snapshot, dispatcher delivery counters,
// and the operational alert ring buffer. A failing provider shows up here as
// a lagging `latest_ts` long before anyone reads the logs.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::clock::Clock;
use crate::scheduler::engine::SharedTaskView;
use crate::scheduler::{TaskSnapshot, TaskStatus};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Operational alert log
// ---------------------------------------------------------------------------

/// A recorded operational event (fatal task failure, dropped notification).
#[derive(Debug, Clone, Serialize)]
pub struct OpsRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Ring buffer of recent operational alerts. Any component may push; the
/// health endpoint drains nothing — records age out by count.
pub struct OpsLog {
    records: RwLock<Vec<OpsRecord>>,
    capacity: usize,
}

impl OpsLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            capacity,
        }
    }

    pub fn push(&self, message: String) {
        let mut records = self.records.write();
        records.push(OpsRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        while records.len() > self.capacity {
            records.remove(0);
        }
    }

    pub fn snapshot(&self) -> Vec<OpsRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher counters
// ---------------------------------------------------------------------------

/// Lock-free delivery counters for one notification channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub delivered: AtomicU64,
    pub skipped: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatsSnapshot {
    pub channel_id: String,
    pub delivered: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Shared per-channel stats, registered by the dispatcher at startup.
#[derive(Default)]
pub struct DispatcherStats {
    channels: RwLock<Vec<(String, Arc<ChannelStats>)>>,
}

impl DispatcherStats {
    pub fn register(&self, channel_id: impl Into<String>) -> Arc<ChannelStats> {
        let stats = Arc::new(ChannelStats::default());
        self.channels
            .write()
            .push((channel_id.into(), stats.clone()));
        stats
    }

    pub fn snapshots(&self) -> Vec<ChannelStatsSnapshot> {
        self.channels
            .read()
            .iter()
            .map(|(id, s)| ChannelStatsSnapshot {
                channel_id: id.clone(),
                delivered: s.delivered.load(Ordering::Relaxed),
                skipped: s.skipped.load(Ordering::Relaxed),
                failed: s.failed.load(Ordering::Relaxed),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Health snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SeriesFreshness {
    pub count: u64,
    pub latest_ts: i64,
    pub age_ms: i64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// "ok" when nothing is disabled or stale, "degraded" otherwise.
    pub status: String,
    pub server_time_ms: i64,
    pub series: HashMap<String, SeriesFreshness>,
    pub tasks: Vec<TaskSnapshot>,
    pub channels: Vec<ChannelStatsSnapshot>,
    pub recent_alerts: Vec<OpsRecord>,
}

/// Builds [`HealthSnapshot`]s on demand for the operator API.
pub struct HealthReporter {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    task_view: SharedTaskView,
    dispatcher_stats: Arc<DispatcherStats>,
    ops: Arc<OpsLog>,
    /// Collection interval per series id, from the collector registry.
    series_intervals: HashMap<String, i64>,
    /// A series is stale once its latest observation is older than this
    /// multiple of its collection interval.
    stale_after_intervals: f64,
}

impl HealthReporter {
    pub fn new(
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        task_view: SharedTaskView,
        dispatcher_stats: Arc<DispatcherStats>,
        ops: Arc<OpsLog>,
        series_intervals: HashMap<String, i64>,
    ) -> Self {
        Self {
            store,
            clock,
            task_view,
            dispatcher_stats,
            ops,
            series_intervals,
            stale_after_intervals: 3.0,
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let now = self.clock.now_ms();
        let tasks = self.task_view.read().clone();

        let store_health = self.store.health().unwrap_or_default();
        let mut series = HashMap::new();
        for (series_id, h) in store_health {
            let interval_ms = self
                .series_intervals
                .get(&series_id)
                .copied()
                .unwrap_or(86_400_000);
            let age_ms = (now - h.latest_ts).max(0);
            let stale = age_ms as f64 > interval_ms as f64 * self.stale_after_intervals;
            series.insert(
                series_id,
                SeriesFreshness {
                    count: h.count,
                    latest_ts: h.latest_ts,
                    age_ms,
                    stale,
                },
            );
        }

        let any_disabled = tasks.iter().any(|t| t.status == TaskStatus::Disabled);
        let any_stale = series.values().any(|s| s.stale);
        let status = if any_disabled || any_stale {
            "degraded".to_string()
        } else {
            "ok".to_string()
        };

        HealthSnapshot {
            status,
            server_time_ms: now,
            series,
            tasks,
            channels: self.dispatcher_stats.snapshots(),
            recent_alerts: self.ops.snapshot(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::types::{Observation, Ohlcv};

    #[test]
    fn ops_log_caps_at_capacity() {
        let log = OpsLog::new(3);
        for i in 0..5 {
            log.push(format!("event {i}"));
        }
        let records = log.snapshot();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].message, "event 2");
        assert_eq!(records[2].message, "event 4");
    }

    #[test]
    fn dispatcher_stats_roundtrip() {
        let stats = DispatcherStats::default();
        let ch = stats.register("webhook");
        ch.delivered.fetch_add(2, Ordering::Relaxed);
        ch.skipped.fetch_add(1, Ordering::Relaxed);

        let snaps = stats.snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].channel_id, "webhook");
        assert_eq!(snaps[0].delivered, 2);
        assert_eq!(snaps[0].skipped, 1);
        assert_eq!(snaps[0].failed, 0);
    }

    #[test]
    fn snapshot_flags_stale_series_and_disabled_tasks() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .put(&[Observation::ohlcv(
                "bitcoin:ohlcv",
                1_000,
                Ohlcv {
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 1.0,
                },
            )])
            .unwrap();

        // Simulated "now" is far beyond the last observation.
        let clock = Arc::new(SimClock::new(10 * 86_400_000));
        let task_view: SharedTaskView = Arc::new(RwLock::new(vec![TaskSnapshot {
            task_id: "bitcoin_ohlcv".into(),
            tier: "high_frequency".into(),
            status: TaskStatus::Disabled,
            consecutive_failures: 4,
            last_run_ms: 1_000,
            last_success_ms: 1_000,
            disabled_until_ms: i64::MAX,
            next_eligible_ms: i64::MAX,
        }]));

        let reporter = HealthReporter::new(
            store,
            clock,
            task_view,
            Arc::new(DispatcherStats::default()),
            Arc::new(OpsLog::new(8)),
            HashMap::from([("bitcoin:ohlcv".to_string(), 900_000)]),
        );

        let snap = reporter.snapshot();
        assert_eq!(snap.status, "degraded");
        assert!(snap.series["bitcoin:ohlcv"].stale);
        assert_eq!(snap.tasks.len(), 1);
    }

    #[test]
    fn healthy_snapshot_reports_ok() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock = Arc::new(SimClock::new(5_000));
        let reporter = HealthReporter::new(
            store,
            clock,
            Arc::new(RwLock::new(Vec::new())),
            Arc::new(DispatcherStats::default()),
            Arc::new(OpsLog::new(8)),
            HashMap::new(),
        );

        let snap = reporter.snapshot();
        assert_eq!(snap.status, "ok");
        assert!(snap.series.is_empty());
        assert!(snap.recent_alerts.is_empty());
    }
}
