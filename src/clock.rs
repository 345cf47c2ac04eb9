// =============================================================================
// Clock — injectable time source
// =============================================================================
//
// All components read wall-clock time and sleep through this trait, never
// through `Utc::now()` or `tokio::time::sleep` directly. The scheduler,
// rate budgets, and notification cooldowns are exercised in tests against
// `SimClock`, which advances virtual time instantly.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;

/// Injectable time source. `now_ms` is UTC epoch milliseconds.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
    async fn sleep_ms(&self, ms: u64);
}

// ---------------------------------------------------------------------------
// SystemClock
// ---------------------------------------------------------------------------

/// Production clock backed by the OS.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
    }
}

// ---------------------------------------------------------------------------
// SimClock
// ---------------------------------------------------------------------------

/// Simulated clock for deterministic tests.
///
/// `sleep_ms` advances virtual time instead of waiting, yielding to the
/// (current-thread) runtime before and after so that spawned tasks settle at
/// each instant. A sleep that would carry time past `limit_ms` clamps the
/// clock to the limit and then parks forever — callers waiting in a
/// `select!` still wake on their other branches (results, shutdown).
pub struct SimClock {
    now: AtomicI64,
    limit_ms: i64,
}

impl SimClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
            limit_ms: i64::MAX,
        }
    }

    /// Clock that refuses to advance past `limit_ms`.
    pub fn with_limit(start_ms: i64, limit_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
            limit_ms,
        }
    }

    /// Jump the clock forward without sleeping.
    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl Clock for SimClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep_ms(&self, ms: u64) {
        // Fix the wake-up target before yielding so concurrent sleepers
        // advancing the clock cannot push this sleep later than requested.
        let target = self.now.load(Ordering::SeqCst).saturating_add(ms as i64);

        Self::settle().await;

        if target > self.limit_ms {
            // Advance to the limit, then park: the simulation is over.
            self.now.fetch_max(self.limit_ms, Ordering::SeqCst);
            Self::settle().await;
            std::future::pending::<()>().await;
        }

        self.now.fetch_max(target, Ordering::SeqCst);
        Self::settle().await;
    }
}
