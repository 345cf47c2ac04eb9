// =============================================================================
// Scheduler Engine — multi-tier dispatch loop with resumable state
// =============================================================================
//
// One loop owns every TaskState. It wakes at the nearest next-eligible time
// (bounded by a max sleep), dispatches due tasks onto bounded per-tier worker
// pools, and drains a results channel to apply state transitions. Workers
// never touch TaskState; they report an outcome and the loop is the only
// writer. Every transition is persisted before the loop moves on, so a
// restart resumes from the last completed transition.
//
// Isolation guarantees:
//   - A task failure only ever changes that task's state.
//   - A tier's saturated rate budget stalls its own workers inside their
//     budget wait; other tiers dispatch independently.
//   - On shutdown every in-flight worker observes the cancellation signal at
//     its next suspension point and reports back within the budget.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::collector::{CollectorRegistry, CollectorSpec, FetchWindow};
use crate::errors::{FetchError, StoreError};
use crate::health::OpsLog;
use crate::ratelimit::{RateBudget, RateBudgets};
use crate::scheduler::task::{TaskState, TaskStatus};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Configuration and wiring types
// ---------------------------------------------------------------------------

/// Engine-level knobs (tiers are separate; see [`TierSpec`]).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on one scheduling sleep, so config reloads and clock
    /// drift correct themselves within a bounded delay.
    pub max_sleep_ms: u64,
    /// Cap on the exponential backoff delay.
    pub max_backoff_ms: i64,
    /// How far back the first fetch of an empty series reaches.
    pub initial_backfill_ms: i64,
    /// How long shutdown waits for in-flight workers.
    pub cancellation_budget_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_sleep_ms: 60_000,
            max_backoff_ms: 6 * 3_600_000,
            initial_backfill_ms: 7 * 86_400_000,
            cancellation_budget_ms: 5_000,
        }
    }
}

/// One tier as the engine sees it: a cadence, a membership list, and a bound
/// on concurrent workers. Tiers are pure data — adding one is a config edit.
#[derive(Debug, Clone)]
pub struct TierSpec {
    pub name: String,
    pub interval_ms: i64,
    pub task_ids: Vec<String>,
    pub max_workers: usize,
}

/// The strategy-run side of the pipeline, dispatched by the scheduler at the
/// signal-cycle cadence. Errors that downcast to a fatal [`StoreError`] park
/// the task; everything else is retried via backoff.
#[async_trait]
pub trait CycleTask: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

/// Task id that binds a tier entry to the [`CycleTask`] instead of a
/// collector.
pub const SIGNAL_CYCLE_TASK_ID: &str = "signal_cycle";

/// Read-only per-task view published for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub tier: String,
    pub status: TaskStatus,
    pub consecutive_failures: u32,
    pub last_run_ms: i64,
    pub last_success_ms: i64,
    pub disabled_until_ms: i64,
    pub next_eligible_ms: i64,
}

pub type SharedTaskView = Arc<RwLock<Vec<TaskSnapshot>>>;

// ---------------------------------------------------------------------------
// Worker results
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum WorkerOutcome {
    Success { inserted: usize },
    /// Rate-budget deadline missed — not a failure.
    Deferred,
    TransientFailure(String),
    FatalFailure(String),
    /// Shutdown observed mid-run; state is left untouched.
    Cancelled,
}

#[derive(Debug)]
struct TaskResult {
    task_id: String,
    outcome: WorkerOutcome,
}

enum TaskKind {
    Collect(Arc<CollectorSpec>),
    SignalCycle(Arc<dyn CycleTask>),
}

struct TaskEntry {
    state: TaskState,
    kind: TaskKind,
    in_flight: bool,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    cfg: SchedulerConfig,
    clock: Arc<dyn Clock>,
    store: Arc<Store>,
    budgets: Arc<RateBudgets>,
    ops: Arc<OpsLog>,
    entries: HashMap<String, TaskEntry>,
    tier_pools: HashMap<String, Arc<Semaphore>>,
    results_tx: mpsc::UnboundedSender<TaskResult>,
    results_rx: mpsc::UnboundedReceiver<TaskResult>,
    shutdown: watch::Receiver<bool>,
    task_view: SharedTaskView,
}

impl Scheduler {
    /// Wire up the engine from tier specs plus the collector registry and the
    /// optional cycle task. Persisted task states are adopted where the task
    /// still exists; tier shape (interval, membership) always comes from the
    /// current config.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: SchedulerConfig,
        clock: Arc<dyn Clock>,
        store: Arc<Store>,
        budgets: Arc<RateBudgets>,
        collectors: Arc<CollectorRegistry>,
        cycle: Option<Arc<dyn CycleTask>>,
        tiers: &[TierSpec],
        ops: Arc<OpsLog>,
        task_view: SharedTaskView,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let mut entries = HashMap::new();
        let mut tier_pools = HashMap::new();

        for tier in tiers {
            tier_pools.insert(
                tier.name.clone(),
                Arc::new(Semaphore::new(tier.max_workers.max(1))),
            );

            for task_id in &tier.task_ids {
                let kind = if task_id == SIGNAL_CYCLE_TASK_ID {
                    let cycle = cycle
                        .clone()
                        .ok_or_else(|| anyhow::anyhow!("tier '{}' lists {SIGNAL_CYCLE_TASK_ID} but no cycle task was provided", tier.name))?;
                    TaskKind::SignalCycle(cycle)
                } else {
                    let spec = collectors.get(task_id).ok_or_else(|| {
                        anyhow::anyhow!(
                            "tier '{}' lists unknown task '{}'",
                            tier.name,
                            task_id
                        )
                    })?;
                    if budgets.get(&spec.provider_id).is_none() {
                        anyhow::bail!(
                            "task '{}' draws from unknown rate budget '{}'",
                            task_id,
                            spec.provider_id
                        );
                    }
                    TaskKind::Collect(spec)
                };

                let state = TaskState::new(task_id.clone(), tier.name.clone(), tier.interval_ms);
                if entries
                    .insert(
                        task_id.clone(),
                        TaskEntry {
                            state,
                            kind,
                            in_flight: false,
                        },
                    )
                    .is_some()
                {
                    anyhow::bail!("task '{}' appears in more than one tier", task_id);
                }
            }
        }

        // Adopt persisted run history for tasks that still exist.
        for persisted in store.load_task_states()? {
            if let Some(entry) = entries.get_mut(&persisted.task_id) {
                entry.state.last_run_ms = persisted.last_run_ms;
                entry.state.last_success_ms = persisted.last_success_ms;
                entry.state.consecutive_failures = persisted.consecutive_failures;
                entry.state.disabled_until_ms = persisted.disabled_until_ms;
            }
        }

        let (results_tx, results_rx) = mpsc::unbounded_channel();

        Ok(Self {
            cfg,
            clock,
            store,
            budgets,
            ops,
            entries,
            tier_pools,
            results_tx,
            results_rx,
            shutdown,
            task_view,
        })
    }

    /// Run the dispatch loop until the shutdown signal fires, then drain
    /// in-flight workers within the cancellation budget.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(tasks = self.entries.len(), "scheduler started");

        // Make sure every task has a row before the first dispatch; a store
        // that cannot even record state is a startup failure.
        let initial: Vec<TaskState> = self.entries.values().map(|e| e.state.clone()).collect();
        for state in &initial {
            self.store.save_task_state(state)?;
        }
        self.publish_view();

        loop {
            while let Ok(result) = self.results_rx.try_recv() {
                self.apply_result(result);
            }

            if *self.shutdown.borrow() {
                break;
            }

            let now = self.clock.now_ms();
            let mut due: Vec<String> = self
                .entries
                .iter()
                .filter(|(_, e)| !e.in_flight && e.state.is_eligible(now))
                .map(|(id, _)| id.clone())
                .collect();
            due.sort();
            for task_id in due {
                self.dispatch(&task_id, now);
            }

            let now = self.clock.now_ms();
            let nearest = self
                .entries
                .values()
                .filter(|e| !e.in_flight && !e.state.is_disabled_forever())
                .map(|e| e.state.next_eligible_ms())
                .min();
            let sleep_ms = match nearest {
                Some(t) => ((t.saturating_sub(now)).max(1) as u64).min(self.cfg.max_sleep_ms),
                None => self.cfg.max_sleep_ms,
            };

            let clock = Arc::clone(&self.clock);
            tokio::select! {
                maybe = self.results_rx.recv() => {
                    if let Some(result) = maybe {
                        self.apply_result(result);
                    }
                }
                _ = self.shutdown.changed() => {}
                () = clock.sleep_ms(sleep_ms) => {}
            }
        }

        self.drain_in_flight().await;
        info!("scheduler stopped");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    fn dispatch(&mut self, task_id: &str, now: i64) {
        let Some(entry) = self.entries.get_mut(task_id) else {
            return;
        };

        entry.state.record_dispatch(now);
        entry.in_flight = true;
        debug!(task = task_id, tier = %entry.state.tier, "task dispatched");

        let pool = self
            .tier_pools
            .get(&entry.state.tier)
            .cloned()
            .unwrap_or_else(|| Arc::new(Semaphore::new(1)));
        let results_tx = self.results_tx.clone();
        let clock = Arc::clone(&self.clock);
        let store = Arc::clone(&self.store);
        let shutdown = self.shutdown.clone();
        let interval_ms = entry.state.interval_ms;
        let backfill_ms = self.cfg.initial_backfill_ms;
        let id = task_id.to_string();

        match &entry.kind {
            TaskKind::Collect(spec) => {
                let spec = Arc::clone(spec);
                let budget = self.budgets.get(&spec.provider_id);
                tokio::spawn(async move {
                    let outcome = collect_worker(
                        spec, budget, pool, store, clock, shutdown, now, interval_ms, backfill_ms,
                    )
                    .await;
                    let _ = results_tx.send(TaskResult {
                        task_id: id,
                        outcome,
                    });
                });
            }
            TaskKind::SignalCycle(cycle) => {
                let cycle = Arc::clone(cycle);
                tokio::spawn(async move {
                    let outcome = cycle_worker(cycle, pool, shutdown).await;
                    let _ = results_tx.send(TaskResult {
                        task_id: id,
                        outcome,
                    });
                });
            }
        }

        self.persist(task_id);
        self.publish_view();
    }

    // -------------------------------------------------------------------------
    // Result application — the only place TaskState mutates after dispatch
    // -------------------------------------------------------------------------

    fn apply_result(&mut self, result: TaskResult) {
        let now = self.clock.now_ms();
        let Some(entry) = self.entries.get_mut(&result.task_id) else {
            return;
        };
        entry.in_flight = false;

        match result.outcome {
            WorkerOutcome::Success { inserted } => {
                entry.state.record_success(now);
                debug!(task = %result.task_id, inserted, "task succeeded");
            }
            WorkerOutcome::Deferred => {
                entry.state.record_deferral(now);
                info!(
                    task = %result.task_id,
                    "rate budget deadline missed — deferred to next slot"
                );
            }
            WorkerOutcome::TransientFailure(msg) => {
                let until = entry
                    .state
                    .record_transient_failure(now, self.cfg.max_backoff_ms);
                warn!(
                    task = %result.task_id,
                    failures = entry.state.consecutive_failures,
                    disabled_until_ms = until,
                    error = %msg,
                    "transient task failure — backing off"
                );
            }
            WorkerOutcome::FatalFailure(msg) => {
                entry.state.record_fatal_failure();
                error!(
                    task = %result.task_id,
                    error = %msg,
                    "fatal task failure — disabled until operator action"
                );
                self.ops.push(format!(
                    "task {} disabled after fatal failure: {msg}",
                    result.task_id
                ));
            }
            WorkerOutcome::Cancelled => {
                debug!(task = %result.task_id, "task cancelled");
            }
        }

        self.persist(&result.task_id);
        self.publish_view();
    }

    /// Persist one task's state. Persistence problems are operational, not
    /// fatal to the loop: they are logged and surfaced via the ops log.
    fn persist(&self, task_id: &str) {
        if let Some(entry) = self.entries.get(task_id) {
            if let Err(e) = self.store.save_task_state(&entry.state) {
                error!(task = task_id, error = %e, "failed to persist task state");
                self.ops
                    .push(format!("task state persistence failed for {task_id}: {e}"));
            }
        }
    }

    fn publish_view(&self) {
        let now = self.clock.now_ms();
        let mut view: Vec<TaskSnapshot> = self
            .entries
            .values()
            .map(|e| TaskSnapshot {
                task_id: e.state.task_id.clone(),
                tier: e.state.tier.clone(),
                status: e.state.status(now, e.in_flight),
                consecutive_failures: e.state.consecutive_failures,
                last_run_ms: e.state.last_run_ms,
                last_success_ms: e.state.last_success_ms,
                disabled_until_ms: e.state.disabled_until_ms,
                next_eligible_ms: e.state.next_eligible_ms(),
            })
            .collect();
        view.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        *self.task_view.write() = view;
    }

    // -------------------------------------------------------------------------
    // Shutdown drain
    // -------------------------------------------------------------------------

    async fn drain_in_flight(&mut self) {
        let deadline = self.clock.now_ms() + self.cfg.cancellation_budget_ms as i64;

        while self.entries.values().any(|e| e.in_flight) {
            let now = self.clock.now_ms();
            if now >= deadline {
                let stuck: Vec<&str> = self
                    .entries
                    .values()
                    .filter(|e| e.in_flight)
                    .map(|e| e.state.task_id.as_str())
                    .collect();
                warn!(?stuck, "cancellation budget exhausted with workers in flight");
                break;
            }

            let clock = Arc::clone(&self.clock);
            let wait = ((deadline - now) as u64).min(100);
            tokio::select! {
                maybe = self.results_rx.recv() => {
                    match maybe {
                        Some(result) => self.apply_result(result),
                        None => break,
                    }
                }
                () = clock.sleep_ms(wait) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Wait until the shutdown flag flips to true (or the sender is gone).
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn collect_worker(
    spec: Arc<CollectorSpec>,
    budget: Option<Arc<RateBudget>>,
    pool: Arc<Semaphore>,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
    dispatched_ms: i64,
    interval_ms: i64,
    backfill_ms: i64,
) -> WorkerOutcome {
    let _permit = match pool.acquire_owned().await {
        Ok(p) => p,
        Err(_) => return WorkerOutcome::Cancelled,
    };

    // One token from the provider budget, but never longer than half an
    // interval past dispatch: beyond that the data would be stale on arrival
    // and the task is simply deferred to its next slot.
    if let Some(budget) = budget {
        let deadline = dispatched_ms + interval_ms / 2;
        let acquired = tokio::select! {
            a = budget.acquire(1.0, Some(deadline)) => a,
            _ = cancelled(&mut shutdown) => return WorkerOutcome::Cancelled,
        };
        if !acquired {
            return WorkerOutcome::Deferred;
        }
    }

    let t_lo = match store.latest_timestamp(&spec.series_id) {
        Ok(Some(ts)) => ts,
        Ok(None) => dispatched_ms - backfill_ms,
        Err(e) if e.is_transient() => return WorkerOutcome::TransientFailure(e.to_string()),
        Err(e) => return WorkerOutcome::FatalFailure(e.to_string()),
    };
    let window = FetchWindow {
        t_lo_ms: t_lo,
        t_hi_ms: clock.now_ms(),
    };

    let fetched = tokio::select! {
        r = spec.fetcher.fetch(window) => r,
        _ = cancelled(&mut shutdown) => return WorkerOutcome::Cancelled,
    };

    match fetched {
        Ok(observations) => match store.put(&observations) {
            Ok(inserted) => WorkerOutcome::Success { inserted },
            Err(e) if e.is_transient() => WorkerOutcome::TransientFailure(e.to_string()),
            Err(e) => WorkerOutcome::FatalFailure(e.to_string()),
        },
        Err(FetchError::Transient(e)) => WorkerOutcome::TransientFailure(e.to_string()),
        Err(FetchError::Fatal(e)) => WorkerOutcome::FatalFailure(e.to_string()),
    }
}

async fn cycle_worker(
    cycle: Arc<dyn CycleTask>,
    pool: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerOutcome {
    let _permit = match pool.acquire_owned().await {
        Ok(p) => p,
        Err(_) => return WorkerOutcome::Cancelled,
    };

    let result = tokio::select! {
        r = cycle.run() => r,
        _ = cancelled(&mut shutdown) => return WorkerOutcome::Cancelled,
    };

    match result {
        Ok(()) => WorkerOutcome::Success { inserted: 0 },
        Err(e) => {
            let fatal = e
                .downcast_ref::<StoreError>()
                .map(|s| !s.is_transient())
                .unwrap_or(false);
            if fatal {
                WorkerOutcome::FatalFailure(e.to_string())
            } else {
                WorkerOutcome::TransientFailure(e.to_string())
            }
        }
    }
}

// =============================================================================
// Tests — scheduling scenarios on the simulated clock
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::collector::testing::{ScriptStep, ScriptedFetcher};
    use crate::collector::Fetcher;

    const HF_INTERVAL: i64 = 900_000; // 15 min

    struct Harness {
        store: Arc<Store>,
        shutdown_tx: watch::Sender<bool>,
        task_view: SharedTaskView,
        handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    /// Build and spawn a scheduler with one tier per `(tier, interval,
    /// capacity, tasks)` tuple, all on a simulated clock capped at
    /// `limit_ms`.
    fn start(
        limit_ms: i64,
        tiers: Vec<(&str, i64, f64, Vec<(&str, Arc<dyn Fetcher>)>)>,
        preload: Vec<TaskState>,
    ) -> Harness {
        let clock = Arc::new(SimClock::with_limit(0, limit_ms));
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let store = Arc::new(Store::open_in_memory().unwrap());
        for state in &preload {
            store.save_task_state(state).unwrap();
        }

        let mut budgets = RateBudgets::new();
        let mut registry = CollectorRegistry::new();
        let mut tier_specs = Vec::new();

        for (tier, interval_ms, capacity, tasks) in tiers {
            let provider = format!("provider_{tier}");
            budgets.insert(RateBudget::new(&provider, capacity, 0.0, clock_dyn.clone()));

            let mut task_ids = Vec::new();
            for (task_id, fetcher) in tasks {
                registry
                    .register(CollectorSpec {
                        task_id: task_id.into(),
                        series_id: "bitcoin:ohlcv".into(),
                        tier: tier.into(),
                        interval_ms,
                        provider_id: provider.clone(),
                        fetcher,
                    })
                    .unwrap();
                task_ids.push(task_id.to_string());
            }

            tier_specs.push(TierSpec {
                name: tier.into(),
                interval_ms,
                task_ids,
                max_workers: 4,
            });
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task_view: SharedTaskView = Arc::new(RwLock::new(Vec::new()));

        let scheduler = Scheduler::new(
            SchedulerConfig {
                max_sleep_ms: 3_600_000,
                max_backoff_ms: 6 * 3_600_000,
                initial_backfill_ms: 86_400_000,
                cancellation_budget_ms: 5_000,
            },
            clock_dyn,
            store.clone(),
            Arc::new(budgets),
            Arc::new(registry),
            None,
            &tier_specs,
            Arc::new(OpsLog::new(16)),
            task_view.clone(),
            shutdown_rx,
        )
        .unwrap();

        let handle = tokio::spawn(scheduler.run());

        Harness {
            store,
            shutdown_tx,
            task_view,
            handle,
        }
    }

    /// Yield until `pred` holds or the cooperative loop clearly stalled.
    async fn wait_for(mut pred: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if pred() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached on the simulated clock");
    }

    async fn stop(h: Harness) {
        h.shutdown_tx.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
    }

    fn persisted(store: &Store, task_id: &str) -> TaskState {
        store
            .load_task_states()
            .unwrap()
            .into_iter()
            .find(|t| t.task_id == task_id)
            .expect("task state persisted")
    }

    // -------------------------------------------------------------------------
    // E1 — simple OHLCV collection: 3 fetches over 45 minutes
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn collects_on_the_tier_cadence() {
        let fetcher = ScriptedFetcher::new("bitcoin:ohlcv", vec![ScriptStep::OkAtWindowEnd]);
        let h = start(
            3 * HF_INTERVAL - 1, // parks just before the 4th slot
            vec![(
                "high_frequency",
                HF_INTERVAL,
                100.0,
                vec![("btc_ohlcv", fetcher.clone() as Arc<dyn Fetcher>)],
            )],
            vec![],
        );

        wait_for(|| fetcher.calls.lock().len() >= 3).await;
        // Clock is parked at the limit; no further fires can sneak in.
        assert_eq!(fetcher.call_times(), vec![0, HF_INTERVAL, 2 * HF_INTERVAL]);

        let store = h.store.clone();
        stop(h).await;

        let state = persisted(&store, "btc_ohlcv");
        assert_eq!(state.last_success_ms, 2 * HF_INTERVAL);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.disabled_until_ms, 0);

        // One stored bar per successful fetch.
        let rows = store.range("bitcoin:ohlcv", 0, i64::MAX).unwrap();
        assert_eq!(rows.len(), 3);
    }

    // -------------------------------------------------------------------------
    // E2 — transient failure backs off with jitter, then recovers
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn transient_failure_backs_off_then_recovers() {
        let fetcher = ScriptedFetcher::new(
            "bitcoin:ohlcv",
            vec![ScriptStep::Transient, ScriptStep::OkAtWindowEnd],
        );
        let h = start(
            4 * HF_INTERVAL,
            vec![(
                "high_frequency",
                HF_INTERVAL,
                100.0,
                vec![("btc_ohlcv", fetcher.clone() as Arc<dyn Fetcher>)],
            )],
            vec![],
        );

        wait_for(|| fetcher.calls.lock().len() >= 2).await;
        let store = h.store.clone();
        stop(h).await;

        let times = fetcher.call_times();
        assert_eq!(times[0], 0);
        // First backoff: interval * 2^1, jittered +/-25 %.
        let lo = (HF_INTERVAL as f64 * 2.0 * 0.75) as i64;
        let hi = (HF_INTERVAL as f64 * 2.0 * 1.25) as i64;
        assert!(
            times[1] >= lo && times[1] <= hi,
            "retry at {} outside jitter window [{lo}, {hi}]",
            times[1]
        );
        // Not eligible at the nominal next slot.
        assert!(times[1] > HF_INTERVAL);

        let state = persisted(&store, "btc_ohlcv");
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.disabled_until_ms, 0);
        // The last recorded fire is the one that succeeded.
        assert_eq!(state.last_success_ms, *times.last().unwrap());
    }

    // -------------------------------------------------------------------------
    // Fatal failure parks the task until operator action
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn fatal_failure_disables_task() {
        let fetcher = ScriptedFetcher::new("bitcoin:ohlcv", vec![ScriptStep::Fatal]);
        let h = start(
            10 * HF_INTERVAL,
            vec![(
                "high_frequency",
                HF_INTERVAL,
                100.0,
                vec![("btc_ohlcv", fetcher.clone() as Arc<dyn Fetcher>)],
            )],
            vec![],
        );

        wait_for(|| {
            h.task_view
                .read()
                .iter()
                .any(|t| t.status == TaskStatus::Disabled)
        })
        .await;

        // Exactly one attempt: a disabled task never refires.
        assert_eq!(fetcher.calls.lock().len(), 1);
        let store = h.store.clone();
        stop(h).await;
        let state = persisted(&store, "btc_ohlcv");
        assert_eq!(state.disabled_until_ms, crate::scheduler::task::DISABLED_FOREVER_MS);
    }

    // -------------------------------------------------------------------------
    // Property 2 — tier isolation: a starved budget never delays other tiers
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn starved_tier_does_not_delay_others() {
        let starved = ScriptedFetcher::new("bitcoin:ohlcv", vec![ScriptStep::OkAtWindowEnd]);
        let healthy = ScriptedFetcher::new("bitcoin:ohlcv", vec![ScriptStep::OkAtWindowEnd]);

        let h = start(
            2 * HF_INTERVAL - 1,
            vec![
                (
                    "starved_tier",
                    HF_INTERVAL,
                    0.0, // zero-capacity budget: every dispatch ends deferred
                    vec![("starved_task", starved.clone() as Arc<dyn Fetcher>)],
                ),
                (
                    "healthy_tier",
                    HF_INTERVAL,
                    100.0,
                    vec![("healthy_task", healthy.clone() as Arc<dyn Fetcher>)],
                ),
            ],
            vec![],
        );

        wait_for(|| healthy.calls.lock().len() >= 2).await;
        // The healthy tier fired exactly on cadence despite the starved one.
        assert_eq!(healthy.call_times(), vec![0, HF_INTERVAL]);
        // The starved task never reached its fetcher.
        assert_eq!(starved.calls.lock().len(), 0);

        let store = h.store.clone();
        stop(h).await;
        // Deferrals are not failures.
        let state = persisted(&store, "starved_task");
        assert_eq!(state.consecutive_failures, 0);
    }

    // -------------------------------------------------------------------------
    // Property 4 — no double-fire within a span
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn never_fires_more_than_once_per_interval() {
        let fetcher = ScriptedFetcher::new("bitcoin:ohlcv", vec![ScriptStep::OkAtWindowEnd]);
        let span = 7 * HF_INTERVAL - 1;
        let h = start(
            span,
            vec![(
                "high_frequency",
                HF_INTERVAL,
                100.0,
                vec![("btc_ohlcv", fetcher.clone() as Arc<dyn Fetcher>)],
            )],
            vec![],
        );

        wait_for(|| fetcher.calls.lock().len() >= 7).await;
        stop(h).await;

        let times = fetcher.call_times();
        let max_fires = (span as f64 / HF_INTERVAL as f64).ceil() as usize;
        assert!(times.len() <= max_fires, "{} fires > {max_fires}", times.len());
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= HF_INTERVAL);
        }
    }

    // -------------------------------------------------------------------------
    // E-restart / Property 5 — exactly one catch-up fire after an outage
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn single_catch_up_fire_after_outage() {
        // Persisted state from a previous run whose last success was ten
        // intervals before the simulated epoch — i.e. the process was down
        // for an outage spanning ten missed slots.
        let mut before_outage = TaskState::new("btc_ohlcv", "high_frequency", HF_INTERVAL);
        before_outage.last_run_ms = -(10 * HF_INTERVAL);
        before_outage.last_success_ms = -(10 * HF_INTERVAL);

        let fetcher = ScriptedFetcher::new("bitcoin:ohlcv", vec![ScriptStep::OkAtWindowEnd]);
        let h = start(
            HF_INTERVAL - 1, // parks before the next regular slot
            vec![(
                "high_frequency",
                HF_INTERVAL,
                100.0,
                vec![("btc_ohlcv", fetcher.clone() as Arc<dyn Fetcher>)],
            )],
            vec![before_outage],
        );

        wait_for(|| !fetcher.calls.lock().is_empty()).await;
        stop(h).await;

        // Exactly one catch-up fire at startup; the ten missed slots are not
        // replayed.
        assert_eq!(fetcher.call_times(), vec![0]);
    }

    // -------------------------------------------------------------------------
    // Property 10 — cancellation promptness and consistent persisted state
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn cancellation_is_prompt_and_state_consistent() {
        let fetcher = ScriptedFetcher::new("bitcoin:ohlcv", vec![ScriptStep::Hang]);
        let h = start(
            10 * HF_INTERVAL,
            vec![(
                "high_frequency",
                HF_INTERVAL,
                100.0,
                vec![("btc_ohlcv", fetcher.clone() as Arc<dyn Fetcher>)],
            )],
            vec![],
        );

        // Wait for the hanging fetch to be in flight.
        wait_for(|| !fetcher.calls.lock().is_empty()).await;

        let store = h.store.clone();
        h.shutdown_tx.send(true).unwrap();
        h.handle.await.unwrap().unwrap();

        // The dispatch transition was persisted; the hang left no partial
        // success or failure behind.
        let state = persisted(&store, "btc_ohlcv");
        assert_eq!(state.last_run_ms, 0);
        assert_eq!(state.last_success_ms, 0);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.disabled_until_ms, 0);
    }

    // -------------------------------------------------------------------------
    // Wiring validation
    // -------------------------------------------------------------------------
    #[tokio::test]
    async fn unknown_task_in_tier_fails_construction() {
        let clock: Arc<dyn Clock> = Arc::new(SimClock::new(0));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (_tx, rx) = watch::channel(false);

        let result = Scheduler::new(
            SchedulerConfig::default(),
            clock,
            store,
            Arc::new(RateBudgets::new()),
            Arc::new(CollectorRegistry::new()),
            None,
            &[TierSpec {
                name: "high_frequency".into(),
                interval_ms: HF_INTERVAL,
                task_ids: vec!["ghost_task".into()],
                max_workers: 2,
            }],
            Arc::new(OpsLog::new(16)),
            Arc::new(RwLock::new(Vec::new())),
            rx,
        );
        assert!(result.is_err());
    }
}
