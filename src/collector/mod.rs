// =============================================================================
// Collectors — registry of "fetch window -> observations" tasks
// =============================================================================
//
// A collector binds a task id to a series, a tier, a provider budget, and a
// fetch function. The fetch function is the only thing that talks to the
// outside world; it returns a tagged result (observations, transient error,
// or fatal error) and never panics its way into the scheduler.
//
// The registry is populated explicitly at startup so the set of collection
// tasks is auditable in one place — there is no directory scanning and no
// instantiation by name.
// =============================================================================

pub mod exchange;
pub mod fred;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::FetchError;
use crate::types::Observation;

/// The `[t_lo, t_hi]` window (epoch ms, inclusive) a fetch must cover.
///
/// Fetchers tolerate partial coverage: they return what the provider has for
/// the window and only error on total failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub t_lo_ms: i64,
    pub t_hi_ms: i64,
}

/// An external data source for one series.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, window: FetchWindow) -> Result<Vec<Observation>, FetchError>;
}

/// One registered collection task.
pub struct CollectorSpec {
    pub task_id: String,
    pub series_id: String,
    pub tier: String,
    pub interval_ms: i64,
    pub provider_id: String,
    pub fetcher: Arc<dyn Fetcher>,
}

/// Registration table mapping task ids to collector specs.
pub struct CollectorRegistry {
    by_task: HashMap<String, Arc<CollectorSpec>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self {
            by_task: HashMap::new(),
        }
    }

    /// Register a collector. Duplicate task ids are a wiring bug and fail
    /// startup.
    pub fn register(&mut self, spec: CollectorSpec) -> anyhow::Result<()> {
        let task_id = spec.task_id.clone();
        if self.by_task.insert(task_id.clone(), Arc::new(spec)).is_some() {
            anyhow::bail!("collector task '{task_id}' registered twice");
        }
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<CollectorSpec>> {
        self.by_task.get(task_id).cloned()
    }

    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_task.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.by_task.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_task.is_empty()
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Test support
// =============================================================================
#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// What a [`ScriptedFetcher`] should do on one call.
    #[derive(Clone)]
    pub enum ScriptStep {
        /// Return one OHLCV observation stamped at the window's upper bound.
        OkAtWindowEnd,
        /// Return a transient error.
        Transient,
        /// Return a fatal error.
        Fatal,
        /// Never complete (for cancellation tests).
        Hang,
    }

    /// Deterministic fetcher for scheduler tests: plays a script of outcomes
    /// (repeating the last step once exhausted) and records every window it
    /// was called with.
    pub struct ScriptedFetcher {
        series_id: String,
        script: Mutex<Vec<ScriptStep>>,
        cursor: Mutex<usize>,
        pub calls: Mutex<Vec<FetchWindow>>,
    }

    impl ScriptedFetcher {
        pub fn new(series_id: impl Into<String>, script: Vec<ScriptStep>) -> Arc<Self> {
            Arc::new(Self {
                series_id: series_id.into(),
                script: Mutex::new(script),
                cursor: Mutex::new(0),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn call_times(&self) -> Vec<i64> {
            self.calls.lock().iter().map(|w| w.t_hi_ms).collect()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, window: FetchWindow) -> Result<Vec<Observation>, FetchError> {
            self.calls.lock().push(window);

            // Guards must not live across the Hang await below.
            let step = {
                let script = self.script.lock();
                let mut cursor = self.cursor.lock();
                let step = script
                    .get(*cursor)
                    .or_else(|| script.last())
                    .cloned()
                    .unwrap_or(ScriptStep::OkAtWindowEnd);
                *cursor += 1;
                step
            };

            match step {
                ScriptStep::OkAtWindowEnd => Ok(vec![Observation::ohlcv(
                    self.series_id.clone(),
                    window.t_hi_ms.max(1),
                    crate::types::Ohlcv {
                        open: 100.0,
                        high: 101.0,
                        low: 99.0,
                        close: 100.5,
                        volume: 10.0,
                    },
                )]),
                ScriptStep::Transient => {
                    Err(FetchError::transient(anyhow::anyhow!("scripted 503")))
                }
                ScriptStep::Fatal => Err(FetchError::fatal(anyhow::anyhow!("scripted 401"))),
                ScriptStep::Hang => std::future::pending().await,
            }
        }
    }
}
