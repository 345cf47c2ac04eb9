// =============================================================================
// Meridian — market-data collection and trading-signal pipeline
// =============================================================================
//
// Startup wires every component into an explicit AppState, registers the
// collectors, strategies, and notification channels enumerated in the config,
// and hands control to the scheduler loop. Ctrl-C cancels everything: workers
// observe the shutdown signal, the scheduler flushes task state, and the
// process exits 0. A bad config or inaccessible store exits 1 before anything
// is scheduled; a fatal error mid-run exits 2.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod alerts;
mod api;
mod app_state;
mod clock;
mod collector;
mod config;
mod errors;
mod health;
mod indicators;
mod notify;
mod ratelimit;
mod runner;
mod scheduler;
mod store;
mod strategy;
mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::Aggregator;
use crate::alerts::AlertEmitter;
use crate::app_state::AppState;
use crate::clock::{Clock, SystemClock};
use crate::collector::exchange::ExchangeOhlcvFetcher;
use crate::collector::fred::FredScalarFetcher;
use crate::collector::{CollectorRegistry, CollectorSpec, Fetcher};
use crate::config::{AppConfig, ChannelKind, CollectorKind};
use crate::health::{DispatcherStats, HealthReporter, OpsLog};
use crate::notify::log::LogNotifier;
use crate::notify::webhook::WebhookNotifier;
use crate::notify::NotificationDispatcher;
use crate::ratelimit::{RateBudget, RateBudgets};
use crate::runner::{SharedCycleSummary, SignalCycle, StrategyRunner};
use crate::scheduler::engine::{CycleTask, SharedTaskView, SIGNAL_CYCLE_TASK_ID};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::strategy::mean_reversion::MeanReversionStrategy;
use crate::strategy::momentum::MomentumStrategy;
use crate::strategy::vol_breakout::VolBreakoutStrategy;
use crate::strategy::StrategyRegistry;

/// How the run ended, mapped to the process exit code.
enum RunError {
    /// Bad config, inaccessible store, wiring error — exit 1.
    Startup(anyhow::Error),
    /// Fatal failure after startup — exit 2.
    Runtime(anyhow::Error),
}

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian pipeline starting up");

    let code = match run().await {
        Ok(()) => {
            info!("Meridian shut down complete");
            0
        }
        Err(RunError::Startup(e)) => {
            error!(error = format!("{e:#}"), "unrecoverable startup error");
            1
        }
        Err(RunError::Runtime(e)) => {
            error!(error = format!("{e:#}"), "fatal error during run");
            2
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<(), RunError> {
    // ── 1. Configuration ─────────────────────────────────────────────────
    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "meridian_config.json".into());

    let config = if Path::new(&config_path).exists() {
        AppConfig::load(&config_path).map_err(RunError::Startup)?
    } else {
        warn!(path = %config_path, "config file not found — using defaults");
        AppConfig::default()
    };
    config
        .validate()
        .context("configuration rejected")
        .map_err(RunError::Startup)?;

    // ── 2. Store ─────────────────────────────────────────────────────────
    let store = Arc::new(
        Store::open(&config.store_path)
            .map_err(|e| RunError::Startup(anyhow::anyhow!("cannot open store: {e}")))?,
    );
    let legacy_path = Path::new(&config.store_path)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("task_state.json");
    store
        .fold_in_legacy_file(&legacy_path)
        .map_err(|e| RunError::Startup(anyhow::anyhow!("legacy task state migration: {e}")))?;

    // ── 3. Clock and rate budgets ────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut budgets = RateBudgets::new();
    for (provider_id, provider) in &config.providers {
        budgets.insert(RateBudget::new(
            provider_id.clone(),
            provider.capacity,
            provider.refill_per_sec,
            Arc::clone(&clock),
        ));
    }
    let budgets = Arc::new(budgets);

    // ── 4. Collector registration ────────────────────────────────────────
    let mut collectors = CollectorRegistry::new();
    for entry in &config.collectors {
        let provider = &config.providers[&entry.provider];

        let fetcher: Arc<dyn Fetcher> = match entry.kind {
            CollectorKind::ExchangeOhlcv => Arc::new(
                ExchangeOhlcvFetcher::new(
                    provider.base_url.clone(),
                    entry.symbol.clone().expect("validated"),
                    entry.bar_interval.clone().expect("validated"),
                    entry.series_id.clone(),
                    provider.timeout_ms,
                )
                .context("building exchange fetcher")
                .map_err(RunError::Startup)?,
            ),
            CollectorKind::FredScalar => {
                let api_key = provider
                    .api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
                    .unwrap_or_else(|| {
                        warn!(task = %entry.task_id, "no API key in environment — provider may reject requests");
                        String::new()
                    });
                Arc::new(
                    FredScalarFetcher::new(
                        provider.base_url.clone(),
                        entry.indicator.clone().expect("validated"),
                        api_key,
                        entry.series_id.clone(),
                        provider.timeout_ms,
                    )
                    .context("building macro fetcher")
                    .map_err(RunError::Startup)?,
                )
            }
        };

        let tier = config
            .scheduling
            .tiers
            .iter()
            .find(|t| t.task_ids.contains(&entry.task_id));
        let Some(tier) = tier else {
            continue; // validated with a warning: defined but not scheduled
        };

        collectors
            .register(CollectorSpec {
                task_id: entry.task_id.clone(),
                series_id: entry.series_id.clone(),
                tier: tier.name.clone(),
                interval_ms: tier.interval_ms,
                provider_id: entry.provider.clone(),
                fetcher,
            })
            .map_err(RunError::Startup)?;
    }
    let collectors = Arc::new(collectors);
    info!(count = collectors.len(), "collectors registered");

    // ── 5. Strategy registration ─────────────────────────────────────────
    let mut strategies = StrategyRegistry::new();
    let assets = config.strategies.assets.clone();
    for id in &config.strategies.enabled {
        let result = match id.as_str() {
            MomentumStrategy::ID => MomentumStrategy::new(
                config.strategies.momentum.clone(),
                assets.clone(),
            )
            .map(|s| Arc::new(s) as Arc<dyn strategy::Strategy>),
            MeanReversionStrategy::ID => MeanReversionStrategy::new(
                config.strategies.mean_reversion.clone(),
                assets.clone(),
            )
            .map(|s| Arc::new(s) as Arc<dyn strategy::Strategy>),
            VolBreakoutStrategy::ID => VolBreakoutStrategy::new(
                config.strategies.vol_breakout.clone(),
                assets.clone(),
            )
            .map(|s| Arc::new(s) as Arc<dyn strategy::Strategy>),
            other => Err(anyhow::anyhow!("unknown strategy '{other}'")),
        };
        strategies
            .register(result.map_err(RunError::Startup)?)
            .map_err(RunError::Startup)?;
    }
    let strategies = Arc::new(strategies);
    info!(enabled = ?strategies.ids(), "strategies registered");

    // ── 6. Aggregator and alert emitter ──────────────────────────────────
    let aggregator = Aggregator::new(config.aggregator_settings(), &config.strategies.enabled)
        .context("aggregation config inconsistent")
        .map_err(RunError::Startup)?;
    let emitter = AlertEmitter::new(&config.alerts_dir, config.aggregation.emit_threshold)
        .map_err(RunError::Startup)?;

    // ── 7. Notification dispatcher ───────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher_stats = Arc::new(DispatcherStats::default());

    let mut dispatcher = NotificationDispatcher::new();
    for channel in &config.notifications.channels {
        match channel.kind {
            ChannelKind::Log => {
                dispatcher.add_channel(channel.settings.clone(), Arc::new(LogNotifier));
            }
            ChannelKind::Webhook => {
                let notifier = WebhookNotifier::new(
                    channel.url.clone().expect("validated"),
                    channel.settings.timeout_ms,
                )
                .context("building webhook channel")
                .map_err(RunError::Startup)?;
                dispatcher.add_channel(channel.settings.clone(), Arc::new(notifier));
            }
        }
    }
    info!(channels = dispatcher.channel_count(), "notification channels registered");
    let dispatcher_handle = dispatcher.spawn(
        config.notifications.queue_capacity,
        Arc::clone(&clock),
        Arc::clone(&dispatcher_stats),
        shutdown_rx.clone(),
    );

    // ── 8. Signal cycle pipeline ─────────────────────────────────────────
    let ops = Arc::new(OpsLog::new(100));
    let last_cycle: SharedCycleSummary = Arc::new(RwLock::new(None));

    let wants_cycle = config
        .scheduling
        .tiers
        .iter()
        .any(|t| t.task_ids.iter().any(|id| id == SIGNAL_CYCLE_TASK_ID));
    let cycle: Option<Arc<dyn CycleTask>> = if wants_cycle {
        Some(Arc::new(SignalCycle::new(
            StrategyRunner::new(
                Arc::clone(&store),
                Arc::clone(&strategies),
                Arc::clone(&clock),
            ),
            aggregator,
            emitter,
            dispatcher_handle,
            Arc::clone(&ops),
            Arc::clone(&last_cycle),
        )))
    } else {
        warn!("no tier schedules the signal cycle — collection only");
        None
    };

    // ── 9. Application state and API server ──────────────────────────────
    let task_view: SharedTaskView = Arc::new(RwLock::new(Vec::new()));
    let health = HealthReporter::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        Arc::clone(&task_view),
        Arc::clone(&dispatcher_stats),
        Arc::clone(&ops),
        config.series_intervals(),
    );

    let bind_addr = std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| config.bind_addr.clone());
    let state = Arc::new(AppState::new(
        Arc::new(RwLock::new(config.clone())),
        Arc::clone(&store),
        Arc::clone(&clock),
        Arc::clone(&budgets),
        Arc::clone(&task_view),
        dispatcher_stats,
        Arc::clone(&ops),
        last_cycle,
        health,
    ));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot bind API server to {bind_addr}"))
        .map_err(RunError::Startup)?;
    info!(addr = %bind_addr, "API server listening");
    let api_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::rest::router(api_state)).await {
            error!(error = %e, "API server terminated");
        }
    });

    // ── 10. Scheduler ────────────────────────────────────────────────────
    let engine = Scheduler::new(
        config.scheduler_config(),
        Arc::clone(&clock),
        Arc::clone(&store),
        budgets,
        collectors,
        cycle,
        &config.tier_specs(),
        Arc::clone(&ops),
        task_view,
        shutdown_rx,
    )
    .map_err(RunError::Startup)?;

    let mut scheduler_handle = tokio::spawn(engine.run());
    info!("all subsystems running — press Ctrl+C to stop");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received — stopping gracefully");
            let _ = shutdown_tx.send(true);
            match scheduler_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(RunError::Runtime(e)),
                Err(join) => {
                    return Err(RunError::Runtime(anyhow::anyhow!(
                        "scheduler task panicked: {join}"
                    )))
                }
            }
        }
        result = &mut scheduler_handle => {
            // The loop only returns on its own if something went fatally
            // wrong before any shutdown was requested.
            return match result {
                Ok(Ok(())) => Err(RunError::Runtime(anyhow::anyhow!(
                    "scheduler loop exited unexpectedly"
                ))),
                Ok(Err(e)) => Err(RunError::Runtime(e)),
                Err(join) => Err(RunError::Runtime(anyhow::anyhow!(
                    "scheduler task panicked: {join}"
                ))),
            };
        }
    }

    if let Err(e) = state.config.read().save(&config_path) {
        warn!(error = %e, "failed to save config on shutdown");
    }

    Ok(())
}
