// =============================================================================
// Rate Budgets — token bucket per external provider
// =============================================================================
//
// Each provider gets one bucket shared by every task that calls it. Refill is
// computed lazily on access: tokens = min(capacity, tokens + elapsed * rate).
// `acquire` blocks (via the injected clock) until a token is available or the
// caller's deadline passes; the scheduler uses the deadline to defer a task
// to its next slot instead of counting a saturated budget as a failure.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::Clock;

/// Snapshot of one bucket for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RateBudgetSnapshot {
    pub provider_id: String,
    pub capacity: f64,
    pub tokens: f64,
    pub refill_per_sec: f64,
}

struct Bucket {
    tokens: f64,
    last_refill_ms: i64,
}

/// Token bucket for a single provider. Safe under concurrent callers; the
/// refill-and-decrement is a single short critical section.
pub struct RateBudget {
    provider_id: String,
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
}

impl RateBudget {
    pub fn new(
        provider_id: impl Into<String>,
        capacity: f64,
        refill_per_sec: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            provider_id: provider_id.into(),
            capacity,
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity, // start full
                last_refill_ms: now,
            }),
            clock,
        }
    }

    /// Non-blocking acquire. Returns `true` if `n` tokens were taken.
    pub fn try_acquire(&self, n: f64) -> bool {
        let now = self.clock.now_ms();
        let mut b = self.bucket.lock();
        Self::refill(&mut b, now, self.capacity, self.refill_per_sec);

        if b.tokens >= n {
            b.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Blocking acquire with an optional absolute deadline (epoch ms).
    ///
    /// Returns `true` once the tokens are taken, `false` if the deadline
    /// passed first. With no deadline this waits indefinitely.
    pub async fn acquire(&self, n: f64, deadline_ms: Option<i64>) -> bool {
        loop {
            if self.try_acquire(n) {
                return true;
            }

            let now = self.clock.now_ms();
            if let Some(deadline) = deadline_ms {
                if now >= deadline {
                    warn!(
                        provider = %self.provider_id,
                        "rate budget deadline passed while waiting for tokens"
                    );
                    return false;
                }
            }

            let wait_ms = self.ms_until_available(n, now);
            let wait_ms = match deadline_ms {
                Some(deadline) => wait_ms.min((deadline - now).max(1) as u64),
                None => wait_ms,
            };

            debug!(provider = %self.provider_id, wait_ms, "waiting on rate budget");
            self.clock.sleep_ms(wait_ms).await;
        }
    }

    /// Milliseconds until `n` tokens could be available, assuming no other
    /// consumers. Used as a sleep hint only; the acquire loop re-checks.
    fn ms_until_available(&self, n: f64, now: i64) -> u64 {
        let b = self.bucket.lock();
        let mut tokens = b.tokens;
        let elapsed = (now - b.last_refill_ms).max(0) as f64;
        tokens = (tokens + elapsed / 1_000.0 * self.refill_per_sec).min(self.capacity);

        if tokens >= n {
            return 1;
        }
        if self.refill_per_sec <= 0.0 {
            // Nothing will ever refill; sleep in coarse chunks so the
            // deadline check still runs.
            return 60_000;
        }
        let missing = n - tokens;
        ((missing / self.refill_per_sec) * 1_000.0).ceil().max(1.0) as u64
    }

    fn refill(b: &mut Bucket, now: i64, capacity: f64, refill_per_sec: f64) {
        let elapsed_ms = (now - b.last_refill_ms).max(0);
        if elapsed_ms > 0 {
            let added = elapsed_ms as f64 / 1_000.0 * refill_per_sec;
            b.tokens = (b.tokens + added).min(capacity);
            b.last_refill_ms = now;
        }
    }

    pub fn snapshot(&self) -> RateBudgetSnapshot {
        let now = self.clock.now_ms();
        let mut b = self.bucket.lock();
        Self::refill(&mut b, now, self.capacity, self.refill_per_sec);
        RateBudgetSnapshot {
            provider_id: self.provider_id.clone(),
            capacity: self.capacity,
            tokens: b.tokens,
            refill_per_sec: self.refill_per_sec,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All provider buckets, keyed by provider id.
pub struct RateBudgets {
    budgets: HashMap<String, Arc<RateBudget>>,
}

impl RateBudgets {
    pub fn new() -> Self {
        Self {
            budgets: HashMap::new(),
        }
    }

    pub fn insert(&mut self, budget: RateBudget) {
        self.budgets
            .insert(budget.provider_id.clone(), Arc::new(budget));
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<RateBudget>> {
        self.budgets.get(provider_id).cloned()
    }

    pub fn snapshots(&self) -> Vec<RateBudgetSnapshot> {
        let mut snaps: Vec<_> = self.budgets.values().map(|b| b.snapshot()).collect();
        snaps.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snaps
    }
}

impl Default for RateBudgets {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;

    fn budget(capacity: f64, rate: f64) -> (Arc<SimClock>, RateBudget) {
        let clock = Arc::new(SimClock::new(0));
        let b = RateBudget::new("test", capacity, rate, clock.clone());
        (clock, b)
    }

    #[test]
    fn starts_full_and_drains() {
        let (_clock, b) = budget(3.0, 1.0);
        assert!(b.try_acquire(1.0));
        assert!(b.try_acquire(1.0));
        assert!(b.try_acquire(1.0));
        assert!(!b.try_acquire(1.0));
    }

    #[test]
    fn refills_lazily_and_caps_at_capacity() {
        let (clock, b) = budget(2.0, 1.0);
        assert!(b.try_acquire(2.0));
        assert!(!b.try_acquire(1.0));

        // 1 token/sec: after 1500 ms there are 1.5 tokens.
        clock.advance(1_500);
        assert!(b.try_acquire(1.0));
        assert!(!b.try_acquire(1.0));

        // A long idle period must not overfill.
        clock.advance(3_600_000);
        let snap = b.snapshot();
        assert!((snap.tokens - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn acquire_blocks_until_refill() {
        let (clock, b) = budget(1.0, 2.0); // 2 tokens/sec
        assert!(b.try_acquire(1.0));

        let got = b.acquire(1.0, None).await;
        assert!(got);
        // One token at 2/sec needs 500 ms of virtual time.
        assert!(clock.now_ms() >= 500);
    }

    #[tokio::test]
    async fn acquire_respects_deadline() {
        let (clock, b) = budget(1.0, 0.1); // 10 s per token
        assert!(b.try_acquire(1.0));

        let got = b.acquire(1.0, Some(2_000)).await;
        assert!(!got);
        assert!(clock.now_ms() >= 2_000);
        assert!(clock.now_ms() < 10_000);
    }

    #[test]
    fn registry_lookup() {
        let clock: Arc<dyn Clock> = Arc::new(SimClock::new(0));
        let mut budgets = RateBudgets::new();
        budgets.insert(RateBudget::new("exchange", 10.0, 1.0, clock.clone()));
        budgets.insert(RateBudget::new("fred", 5.0, 0.5, clock));

        assert!(budgets.get("exchange").is_some());
        assert!(budgets.get("nope").is_none());
        assert_eq!(budgets.snapshots().len(), 2);
    }
}
