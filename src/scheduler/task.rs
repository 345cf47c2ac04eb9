// =============================================================================
// Task State — per-task scheduling bookkeeping and backoff
// =============================================================================
//
// One record per scheduled task, mutated only by the scheduler loop and
// persisted after every transition. Eligibility is a pure function of the
// record so it can be tested without a running engine:
//
//   next_eligible = max(last_run, last_success + interval, disabled_until)
//
// State machine: idle -> pending_fetch -> running -> {idle | backoff |
// disabled}. A task leaves backoff on its own once `now >= disabled_until`;
// leaving `disabled` requires operator action (the record is reset manually).
// =============================================================================

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Sentinel for "disabled until operator intervention".
pub const DISABLED_FOREVER_MS: i64 = i64::MAX;

/// Observable status of a task, derived from its record plus whether the
/// engine currently has a worker in flight for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    PendingFetch,
    Running,
    Backoff,
    Disabled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::PendingFetch => write!(f, "pending_fetch"),
            Self::Running => write!(f, "running"),
            Self::Backoff => write!(f, "backoff"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Durable scheduling state for one task.
///
/// `disabled_until_ms == 0` means enabled; [`DISABLED_FOREVER_MS`] means an
/// operator must intervene; anything else is a backoff (or deferral) expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub tier: String,
    pub interval_ms: i64,
    #[serde(default)]
    pub last_run_ms: i64,
    #[serde(default)]
    pub last_success_ms: i64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub disabled_until_ms: i64,
}

impl TaskState {
    /// Fresh state for a task that has never run — eligible immediately.
    pub fn new(task_id: impl Into<String>, tier: impl Into<String>, interval_ms: i64) -> Self {
        Self {
            task_id: task_id.into(),
            tier: tier.into(),
            interval_ms,
            last_run_ms: 0,
            last_success_ms: 0,
            consecutive_failures: 0,
            disabled_until_ms: 0,
        }
    }

    /// The earliest instant this task may next be dispatched.
    pub fn next_eligible_ms(&self) -> i64 {
        let since_success = self.last_success_ms.saturating_add(self.interval_ms);
        self.last_run_ms
            .max(since_success)
            .max(self.disabled_until_ms)
    }

    pub fn is_eligible(&self, now_ms: i64) -> bool {
        !self.is_disabled_forever() && now_ms >= self.next_eligible_ms()
    }

    pub fn is_disabled_forever(&self) -> bool {
        self.disabled_until_ms == DISABLED_FOREVER_MS
    }

    /// Status as reported to the health surface.
    pub fn status(&self, now_ms: i64, in_flight: bool) -> TaskStatus {
        if in_flight {
            return TaskStatus::Running;
        }
        if self.is_disabled_forever() {
            return TaskStatus::Disabled;
        }
        if self.disabled_until_ms > now_ms {
            return TaskStatus::Backoff;
        }
        if self.is_eligible(now_ms) {
            TaskStatus::PendingFetch
        } else {
            TaskStatus::Idle
        }
    }

    // -------------------------------------------------------------------------
    // Transitions (called only by the scheduler loop)
    // -------------------------------------------------------------------------

    /// Mark the task as dispatched at `now`.
    pub fn record_dispatch(&mut self, now_ms: i64) {
        self.last_run_ms = now_ms;
    }

    /// Successful run: clear failures and any backoff.
    pub fn record_success(&mut self, now_ms: i64) {
        self.last_success_ms = now_ms;
        self.consecutive_failures = 0;
        self.disabled_until_ms = 0;
    }

    /// Transient failure: exponential backoff with +/-25 % jitter, capped at
    /// `max_backoff_ms`. Returns the chosen `disabled_until` instant.
    pub fn record_transient_failure(&mut self, now_ms: i64, max_backoff_ms: i64) -> i64 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let exp = self.consecutive_failures.min(20); // 2^20 is already huge
        let base = (self.interval_ms as f64) * f64::from(1u32 << exp);
        let capped = base.min(max_backoff_ms as f64);

        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        let delay = (capped * jitter).round() as i64;

        self.disabled_until_ms = now_ms.saturating_add(delay.max(1));
        self.disabled_until_ms
    }

    /// Fatal failure: park the task until an operator intervenes.
    pub fn record_fatal_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.disabled_until_ms = DISABLED_FOREVER_MS;
    }

    /// Deadline miss on the rate budget: push the task to its next slot
    /// without counting a failure.
    pub fn record_deferral(&mut self, now_ms: i64) {
        self.disabled_until_ms = now_ms.saturating_add(self.interval_ms);
    }
}
