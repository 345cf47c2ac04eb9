// =============================================================================
// Configuration — every tunable of the pipeline, with atomic save
// =============================================================================
//
// One JSON file drives the whole engine: tiers and their task membership,
// provider rate budgets, enabled strategies and their weights, aggregation
// parameters, and notification channels. Every field carries a serde default
// so an older config file keeps loading after new fields are added.
//
// `validate()` is called once at startup; a config that fails validation
// terminates the process with exit code 1 before anything is scheduled.
// Persistence uses the tmp + rename pattern so a crash mid-save can never
// corrupt the file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::aggregator::{AggregatorSettings, StrengthMultipliers};
use crate::notify::channel::ChannelSettings;
use crate::scheduler::engine::SIGNAL_CYCLE_TASK_ID;
use crate::scheduler::{SchedulerConfig, TierSpec};
use crate::strategy::mean_reversion::MeanReversionParams;
use crate::strategy::momentum::MomentumParams;
use crate::strategy::vol_breakout::VolBreakoutParams;
use crate::types::AggregationMethod;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_store_path() -> String {
    "meridian.db".to_string()
}

fn default_alerts_dir() -> String {
    "alerts".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_max_sleep_ms() -> u64 {
    60_000
}

fn default_max_backoff_ms() -> i64 {
    6 * 3_600_000
}

fn default_initial_backfill_ms() -> i64 {
    7 * 86_400_000
}

fn default_cancellation_budget_ms() -> u64 {
    5_000
}

fn default_max_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_emit_threshold() -> f64 {
    0.3
}

fn default_neutral_threshold() -> f64 {
    0.1
}

fn default_strength_breakpoints() -> [f64; 2] {
    [0.33, 0.66]
}

fn default_strength_multipliers() -> [f64; 3] {
    [0.5, 1.0, 1.5]
}

fn default_base_position() -> f64 {
    1.0
}

fn default_max_position() -> f64 {
    2.0
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            name: "high_frequency".into(),
            interval_ms: 900_000, // 15 min
            task_ids: vec!["btc_ohlcv".into(), "eth_ohlcv".into()],
            max_workers: default_max_workers(),
        },
        TierConfig {
            name: "hourly".into(),
            interval_ms: 3_600_000,
            task_ids: vec!["sol_ohlcv".into()],
            max_workers: default_max_workers(),
        },
        TierConfig {
            name: "macro".into(),
            interval_ms: 86_400_000,
            task_ids: vec!["vix_macro".into()],
            max_workers: 2,
        },
        TierConfig {
            name: "signal_cycle".into(),
            interval_ms: 3_600_000,
            task_ids: vec![SIGNAL_CYCLE_TASK_ID.into()],
            max_workers: 1,
        },
    ]
}

fn default_providers() -> HashMap<String, ProviderConfig> {
    HashMap::from([
        (
            "exchange".to_string(),
            ProviderConfig {
                capacity: 10.0,
                refill_per_sec: 0.5,
                timeout_ms: 10_000,
                base_url: "https://api.binance.com".into(),
                api_key_env: None,
            },
        ),
        (
            "fred".to_string(),
            ProviderConfig {
                capacity: 5.0,
                refill_per_sec: 0.2,
                timeout_ms: 10_000,
                base_url: "https://api.stlouisfed.org".into(),
                api_key_env: Some("FRED_API_KEY".into()),
            },
        ),
    ])
}

fn default_collectors() -> Vec<CollectorConfig> {
    vec![
        CollectorConfig {
            task_id: "btc_ohlcv".into(),
            series_id: "bitcoin:ohlcv".into(),
            provider: "exchange".into(),
            kind: CollectorKind::ExchangeOhlcv,
            symbol: Some("BTCUSDT".into()),
            bar_interval: Some("15m".into()),
            indicator: None,
        },
        CollectorConfig {
            task_id: "eth_ohlcv".into(),
            series_id: "ethereum:ohlcv".into(),
            provider: "exchange".into(),
            kind: CollectorKind::ExchangeOhlcv,
            symbol: Some("ETHUSDT".into()),
            bar_interval: Some("15m".into()),
            indicator: None,
        },
        CollectorConfig {
            task_id: "sol_ohlcv".into(),
            series_id: "solana:ohlcv".into(),
            provider: "exchange".into(),
            kind: CollectorKind::ExchangeOhlcv,
            symbol: Some("SOLUSDT".into()),
            bar_interval: Some("1h".into()),
            indicator: None,
        },
        CollectorConfig {
            task_id: "vix_macro".into(),
            series_id: "macro:VIX".into(),
            provider: "fred".into(),
            kind: CollectorKind::FredScalar,
            symbol: None,
            bar_interval: None,
            indicator: Some("VIXCLS".into()),
        },
    ]
}

fn default_enabled_strategies() -> Vec<String> {
    vec![
        "momentum".into(),
        "mean_reversion".into(),
        "vol_breakout".into(),
    ]
}

fn default_assets() -> Vec<String> {
    vec!["bitcoin".into(), "ethereum".into()]
}

fn default_weights() -> HashMap<String, f64> {
    HashMap::from([
        ("momentum".to_string(), 0.4),
        ("mean_reversion".to_string(), 0.3),
        ("vol_breakout".to_string(), 0.3),
    ])
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![ChannelConfig {
        kind: ChannelKind::Log,
        url: None,
        settings: ChannelSettings {
            id: "log".into(),
            filter: Default::default(),
            min_interval_ms: 60_000,
            max_retries: 1,
            retry_backoff_ms: 1_000,
            timeout_ms: 5_000,
            price_precision: 2,
        },
    }]
}

// =============================================================================
// Config tree
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub interval_ms: i64,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: i64,
    #[serde(default = "default_initial_backfill_ms")]
    pub initial_backfill_ms: i64,
    #[serde(default = "default_cancellation_budget_ms")]
    pub cancellation_budget_ms: u64,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub base_url: String,
    /// Environment variable holding the provider API key, if one is needed.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    ExchangeOhlcv,
    FredScalar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub task_id: String,
    pub series_id: String,
    pub provider: String,
    pub kind: CollectorKind,
    /// Exchange symbol (ExchangeOhlcv only).
    #[serde(default)]
    pub symbol: Option<String>,
    /// Kline interval string (ExchangeOhlcv only).
    #[serde(default)]
    pub bar_interval: Option<String>,
    /// Provider-side series code (FredScalar only).
    #[serde(default)]
    pub indicator: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategiesConfig {
    #[serde(default = "default_enabled_strategies")]
    pub enabled: Vec<String>,
    #[serde(default = "default_assets")]
    pub assets: Vec<String>,
    #[serde(default)]
    pub momentum: MomentumParams,
    #[serde(default)]
    pub mean_reversion: MeanReversionParams,
    #[serde(default)]
    pub vol_breakout: VolBreakoutParams,
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_method")]
    pub method: AggregationMethod,
    #[serde(default = "default_weights")]
    pub weights: HashMap<String, f64>,
    #[serde(default = "default_neutral_threshold")]
    pub neutral_threshold: f64,
    #[serde(default = "default_strength_breakpoints")]
    pub strength_breakpoints: [f64; 2],
    #[serde(default = "default_strength_multipliers")]
    pub strength_multipliers: [f64; 3],
    #[serde(default = "default_base_position")]
    pub base_position: f64,
    #[serde(default = "default_max_position")]
    pub max_position: f64,
    #[serde(default = "default_emit_threshold")]
    pub emit_threshold: f64,
}

fn default_method() -> AggregationMethod {
    AggregationMethod::WeightedAverage
}

impl Default for AggregationConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Log,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    /// Target URL (Webhook only).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(flatten)]
    pub settings: ChannelSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

/// Top-level configuration for the Meridian pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_alerts_dir")]
    pub alerts_dir: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default = "default_providers")]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default = "default_collectors")]
    pub collectors: Vec<CollectorConfig>,
    #[serde(default)]
    pub strategies: StrategiesConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialise")
    }
}

impl AppConfig {
    // -------------------------------------------------------------------------
    // Load / save
    // -------------------------------------------------------------------------

    /// Load configuration from a JSON file at `path`. A missing file is an
    /// error so the caller can decide to fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            tiers = config.scheduling.tiers.len(),
            collectors = config.collectors.len(),
            strategies = ?config.strategies.enabled,
            "config loaded"
        );
        Ok(config)
    }

    /// Persist to `path` with an atomic tmp + rename write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config")?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Validation — fail fast, before anything is scheduled
    // -------------------------------------------------------------------------

    pub fn validate(&self) -> Result<()> {
        if self.scheduling.tiers.is_empty() {
            anyhow::bail!("at least one tier must be configured");
        }

        let mut tier_names = std::collections::HashSet::new();
        let mut task_ids = std::collections::HashSet::new();
        for tier in &self.scheduling.tiers {
            if tier.interval_ms <= 0 {
                anyhow::bail!("tier '{}' has non-positive interval", tier.name);
            }
            if !tier_names.insert(&tier.name) {
                anyhow::bail!("tier '{}' defined twice", tier.name);
            }
            for task_id in &tier.task_ids {
                if !task_ids.insert(task_id.clone()) {
                    anyhow::bail!("task '{}' appears in more than one tier", task_id);
                }
            }
        }

        let collector_ids: std::collections::HashSet<&String> =
            self.collectors.iter().map(|c| &c.task_id).collect();
        for tier in &self.scheduling.tiers {
            for task_id in &tier.task_ids {
                if task_id != SIGNAL_CYCLE_TASK_ID && !collector_ids.contains(task_id) {
                    anyhow::bail!(
                        "tier '{}' references task '{}' with no collector definition",
                        tier.name,
                        task_id
                    );
                }
            }
        }

        for collector in &self.collectors {
            if !task_ids.contains(&collector.task_id) {
                warn!(
                    task = %collector.task_id,
                    "collector defined but not a member of any tier — it will never run"
                );
            }
            if !self.providers.contains_key(&collector.provider) {
                anyhow::bail!(
                    "collector '{}' references unknown provider '{}'",
                    collector.task_id,
                    collector.provider
                );
            }
            match collector.kind {
                CollectorKind::ExchangeOhlcv => {
                    if collector.symbol.is_none() || collector.bar_interval.is_none() {
                        anyhow::bail!(
                            "collector '{}' (exchange_ohlcv) needs symbol and bar_interval",
                            collector.task_id
                        );
                    }
                }
                CollectorKind::FredScalar => {
                    if collector.indicator.is_none() {
                        anyhow::bail!(
                            "collector '{}' (fred_scalar) needs an indicator",
                            collector.task_id
                        );
                    }
                }
            }
        }

        for (provider_id, provider) in &self.providers {
            if provider.capacity <= 0.0 || provider.refill_per_sec < 0.0 {
                anyhow::bail!("provider '{provider_id}' has an invalid rate budget");
            }
        }

        const KNOWN_STRATEGIES: &[&str] = &["momentum", "mean_reversion", "vol_breakout"];
        for id in &self.strategies.enabled {
            if !KNOWN_STRATEGIES.contains(&id.as_str()) {
                anyhow::bail!("unknown strategy '{id}' enabled");
            }
        }
        if self.strategies.assets.is_empty() {
            anyhow::bail!("strategies.assets must not be empty");
        }

        if !(0.0..=1.0).contains(&self.aggregation.emit_threshold) {
            anyhow::bail!(
                "emit_threshold {} outside [0, 1]",
                self.aggregation.emit_threshold
            );
        }

        if self.notifications.queue_capacity == 0 {
            anyhow::bail!("notification queue capacity must be positive");
        }
        let mut channel_ids = std::collections::HashSet::new();
        for channel in &self.notifications.channels {
            if !channel_ids.insert(&channel.settings.id) {
                anyhow::bail!("channel '{}' defined twice", channel.settings.id);
            }
            if channel.kind == ChannelKind::Webhook && channel.url.is_none() {
                anyhow::bail!("webhook channel '{}' has no url", channel.settings.id);
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Conversions into component settings
    // -------------------------------------------------------------------------

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_sleep_ms: self.scheduling.max_sleep_ms,
            max_backoff_ms: self.scheduling.max_backoff_ms,
            initial_backfill_ms: self.scheduling.initial_backfill_ms,
            cancellation_budget_ms: self.scheduling.cancellation_budget_ms,
        }
    }

    pub fn tier_specs(&self) -> Vec<TierSpec> {
        self.scheduling
            .tiers
            .iter()
            .map(|t| TierSpec {
                name: t.name.clone(),
                interval_ms: t.interval_ms,
                task_ids: t.task_ids.clone(),
                max_workers: t.max_workers,
            })
            .collect()
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        let [weak, moderate, strong] = self.aggregation.strength_multipliers;
        AggregatorSettings {
            method: self.aggregation.method,
            weights: self.aggregation.weights.clone(),
            neutral_threshold: self.aggregation.neutral_threshold,
            strength_breakpoints: (
                self.aggregation.strength_breakpoints[0],
                self.aggregation.strength_breakpoints[1],
            ),
            strength_multipliers: StrengthMultipliers {
                weak,
                moderate,
                strong,
            },
            base_position: self.aggregation.base_position,
            max_position: self.aggregation.max_position,
        }
    }

    /// The interval each series is collected at, for freshness reporting.
    pub fn series_intervals(&self) -> HashMap<String, i64> {
        let mut out = HashMap::new();
        for tier in &self.scheduling.tiers {
            for task_id in &tier.task_ids {
                if let Some(collector) = self.collectors.iter().find(|c| &c.task_id == task_id) {
                    out.insert(collector.series_id.clone(), tier.interval_ms);
                }
            }
        }
        out
    }
}
