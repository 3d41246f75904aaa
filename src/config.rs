// =============================================================================
// Engine Configuration — frozen per process lifetime
// =============================================================================
//
// Every tunable the engine recognises lives here. The struct is loaded once at
// bootstrap (JSON file + env overrides) and never mutated afterwards; changing
// a value requires a process restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default = "...")]` so that adding new
// fields never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_tick_period_ms() -> u64 {
    1000
}

fn default_monitor_period_ms() -> u64 {
    5000
}

fn default_reconcile_period_ms() -> u64 {
    30_000
}

fn default_warmup_days() -> u32 {
    3
}

fn default_warmup_symbols_min() -> usize {
    5
}

fn default_warmup_bars_min() -> usize {
    50
}

fn default_max_signals_per_cycle() -> usize {
    5
}

fn default_inter_order_delay_ms() -> u64 {
    1500
}

fn default_rate_limit_orders_per_sec() -> f64 {
    7.0
}

fn default_rate_limit_burst() -> f64 {
    9.0
}

fn default_rate_limit_acquire_timeout_ms() -> u64 {
    2000
}

fn default_options_exposure_cap_pct() -> f64 {
    50.0
}

fn default_total_exposure_cap_pct() -> f64 {
    70.0
}

fn default_total_exposure_soft_pct() -> f64 {
    80.0
}

fn default_per_trade_risk_pct() -> f64 {
    2.0
}

fn default_per_position_option_pct() -> f64 {
    5.0
}

fn default_per_position_equity_pct() -> f64 {
    2.0
}

fn default_daily_loss_brake_pct() -> f64 {
    2.0
}

fn default_emergency_loss_pct() -> f64 {
    3.0
}

fn default_square_off_urgent() -> String {
    "15:15".to_string()
}

fn default_square_off_mandatory() -> String {
    "15:20".to_string()
}

fn default_stale_tick_ms() -> u64 {
    30_000
}

fn default_feed_heartbeat_ms() -> u64 {
    300_000
}

fn default_takeover_grace_ms() -> u64 {
    15_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_fill_confirm_timeout_ms() -> u64 {
    5000
}

fn default_order_cooldown_ms() -> u64 {
    30_000
}

fn default_min_quality() -> f64 {
    0.60
}

fn default_dedup_ttl_secs() -> u64 {
    86_400
}

fn default_benchmark_symbol() -> String {
    "NIFTY 50".to_string()
}

fn default_universe() -> Vec<String> {
    vec![
        "RELIANCE".to_string(),
        "INFY".to_string(),
        "HDFCBANK".to_string(),
        "TCS".to_string(),
        "BHARTIARTL".to_string(),
    ]
}

fn default_capital() -> f64 {
    500_000.0
}

fn default_default_iv() -> f64 {
    0.18
}

fn default_index_option_lot_size() -> u32 {
    75
}

fn default_chain_refresh_ms() -> u64 {
    60_000
}

fn default_risk_free_rate() -> f64 {
    0.065
}

fn default_trade_log_path() -> String {
    "trades.jsonl".to_string()
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Vajra engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Universe ------------------------------------------------------------

    /// Symbols the orchestrator watches and trades.
    #[serde(default = "default_universe")]
    pub universe: Vec<String>,

    /// Benchmark index symbol driving the market-regime computation.
    #[serde(default = "default_benchmark_symbol")]
    pub benchmark_symbol: String,

    /// Session starting capital used for exposure and risk percentages.
    #[serde(default = "default_capital")]
    pub capital: f64,

    // --- Cadence -------------------------------------------------------------

    /// Orchestrator tick period in milliseconds.
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,

    /// Position monitor loop period in milliseconds.
    #[serde(default = "default_monitor_period_ms")]
    pub monitor_period_ms: u64,

    /// Broker reconciliation period in milliseconds.
    #[serde(default = "default_reconcile_period_ms")]
    pub reconcile_period_ms: u64,

    // --- Warm-up -------------------------------------------------------------

    /// Days of daily history pulled at startup for the warm-up preload.
    #[serde(default = "default_warmup_days")]
    pub warmup_days: u32,

    /// Minimum number of successfully preloaded symbols required before the
    /// orchestrator reports ready.
    #[serde(default = "default_warmup_symbols_min")]
    pub warmup_symbols_min: usize,

    /// Minimum bars per ring before strategies act on a symbol.
    #[serde(default = "default_warmup_bars_min")]
    pub warmup_bars_min: usize,

    // --- Submission throttling ----------------------------------------------

    /// Maximum entry submissions per orchestrator tick.
    #[serde(default = "default_max_signals_per_cycle")]
    pub max_signals_per_cycle: usize,

    /// Delay between consecutive submissions within one batch.
    #[serde(default = "default_inter_order_delay_ms")]
    pub inter_order_delay_ms: u64,

    /// Per-(symbol, action) cooldown after any submission.
    #[serde(default = "default_order_cooldown_ms")]
    pub order_cooldown_ms: u64,

    // --- Broker rate limit ---------------------------------------------------

    /// Sustained order operations per second (soft limit).
    #[serde(default = "default_rate_limit_orders_per_sec")]
    pub rate_limit_orders_per_sec: f64,

    /// Bucket burst capacity (hard limit).
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: f64,

    /// How long a caller may block waiting for a token.
    #[serde(default = "default_rate_limit_acquire_timeout_ms")]
    pub rate_limit_acquire_timeout_ms: u64,

    /// Confirmation window for an entry fill before protective orders are
    /// placed against a partial.
    #[serde(default = "default_fill_confirm_timeout_ms")]
    pub fill_confirm_timeout_ms: u64,

    // --- Portfolio limits ----------------------------------------------------

    /// Cap on summed option notionals as a percentage of capital.
    #[serde(default = "default_options_exposure_cap_pct")]
    pub options_exposure_cap_pct: f64,

    /// Hard cap on total notional exposure as a percentage of capital.
    #[serde(default = "default_total_exposure_cap_pct")]
    pub total_exposure_cap_pct: f64,

    /// Soft warning threshold above the hard cap.
    #[serde(default = "default_total_exposure_soft_pct")]
    pub total_exposure_soft_pct: f64,

    /// Per-trade risk (entry − stop distance × quantity) cap.
    #[serde(default = "default_per_trade_risk_pct")]
    pub per_trade_risk_pct: f64,

    /// Single-position notional cap for options.
    #[serde(default = "default_per_position_option_pct")]
    pub per_position_option_pct: f64,

    /// Single-position notional cap for equities.
    #[serde(default = "default_per_position_equity_pct")]
    pub per_position_equity_pct: f64,

    /// Daily realized+unrealized loss level that blocks all new entries.
    #[serde(default = "default_daily_loss_brake_pct")]
    pub daily_loss_brake_pct: f64,

    /// Account-level unrealized loss that triggers emergency flattening.
    #[serde(default = "default_emergency_loss_pct")]
    pub emergency_loss_pct: f64,

    // --- Session clock -------------------------------------------------------

    /// IST time after which positions enter urgent-close mode ("HH:MM").
    #[serde(default = "default_square_off_urgent")]
    pub square_off_urgent: String,

    /// IST time of the mandatory square-off ("HH:MM").
    #[serde(default = "default_square_off_mandatory")]
    pub square_off_mandatory: String,

    // --- Data freshness ------------------------------------------------------

    /// Age beyond which a cached tick is unusable.
    #[serde(default = "default_stale_tick_ms")]
    pub stale_tick_ms: u64,

    /// Feed silence that forces a reconnect during market hours.
    #[serde(default = "default_feed_heartbeat_ms")]
    pub feed_heartbeat_ms: u64,

    /// Wait after opening a takeover session before reconnecting.
    #[serde(default = "default_takeover_grace_ms")]
    pub takeover_grace_ms: u64,

    // --- Lifecycle -----------------------------------------------------------

    /// Start the feed ingestor dormant; connect only on explicit command.
    #[serde(default)]
    pub skip_auto_init: bool,

    /// Flatten all positions when the process shuts down.
    #[serde(default)]
    pub flatten_on_shutdown: bool,

    /// How long shutdown waits for in-flight broker submissions.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    // --- Signal pipeline -----------------------------------------------------

    /// Base composite-quality threshold for the deduplicator.
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,

    /// TTL applied to dedup execution records.
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,

    // --- Options pricing -----------------------------------------------------

    /// Implied-vol fallback when no live chain quote is available.
    #[serde(default = "default_default_iv")]
    pub default_iv: f64,

    /// Annualised risk-free rate for Black-Scholes.
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,

    /// Lot size registered for index-option contracts discovered via the
    /// chain.
    #[serde(default = "default_index_option_lot_size")]
    pub index_option_lot_size: u32,

    /// Option-chain cache refresh period.
    #[serde(default = "default_chain_refresh_ms")]
    pub chain_refresh_ms: u64,

    // --- Sinks ---------------------------------------------------------------

    /// Path of the JSONL trade-record sink.
    #[serde(default = "default_trade_log_path")]
    pub trade_log_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises via defaults")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            universe = ?config.universe,
            benchmark = %config.benchmark_symbol,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Reject configurations that cannot produce a functioning engine.
    /// A failure here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.capital <= 0.0 {
            anyhow::bail!("capital must be positive, got {}", self.capital);
        }
        if self.universe.is_empty() {
            anyhow::bail!("universe must contain at least one symbol");
        }
        if self.rate_limit_burst < self.rate_limit_orders_per_sec {
            anyhow::bail!(
                "rate_limit_burst ({}) must be >= rate_limit_orders_per_sec ({})",
                self.rate_limit_burst,
                self.rate_limit_orders_per_sec
            );
        }
        if self.total_exposure_soft_pct < self.total_exposure_cap_pct {
            anyhow::bail!(
                "total_exposure_soft_pct ({}) must be >= total_exposure_cap_pct ({})",
                self.total_exposure_soft_pct,
                self.total_exposure_cap_pct
            );
        }
        crate::session::parse_hhmm(&self.square_off_urgent)
            .with_context(|| format!("invalid square_off_urgent '{}'", self.square_off_urgent))?;
        crate::session::parse_hhmm(&self.square_off_mandatory).with_context(|| {
            format!("invalid square_off_mandatory '{}'", self.square_off_mandatory)
        })?;
        Ok(())
    }
}
