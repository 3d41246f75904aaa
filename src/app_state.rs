// =============================================================================
// Central Application State — Vajra Intraday Engine
// =============================================================================
//
// Ties the subsystems together behind one `Arc` for the control surface.
// Each subsystem manages its own interior mutability; AppState only
// aggregates handles and builds the status snapshot.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::engine::orchestrator::CycleStatsSnapshot;
use crate::engine::reconcile::Reconciler;
use crate::engine::{Orchestrator, PositionMonitor, TradeEngine};
use crate::feed::FeedIngestor;
use crate::market_data::MarketDataCache;
use crate::portfolio::{Position, PositionTracker};
use crate::regime::{RegimeEngine, RegimeSnapshot};
use crate::strategy::{ChainCache, StrategyWeights};

/// Shared handles for the API layer and background tasks.
pub struct AppState {
    pub config: EngineConfig,
    pub cache: Arc<MarketDataCache>,
    pub regime: Arc<RegimeEngine>,
    pub tracker: Arc<PositionTracker>,
    pub engine: Arc<TradeEngine>,
    pub monitor: Arc<PositionMonitor>,
    pub ingestor: Arc<FeedIngestor>,
    pub orchestrator: Arc<Orchestrator>,
    pub reconciler: Arc<Reconciler>,
    pub weights: Arc<StrategyWeights>,
    pub chains: Arc<ChainCache>,
    pub start_time: Instant,
}

/// Full engine status served by `GET /api/v1/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub engine_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_ready_reason: Option<String>,
    pub feed_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_last_event_age_ms: Option<u64>,
    pub urgent_close: bool,
    /// Milliseconds since the last tick, per registered symbol; `null` when
    /// no tick has arrived yet.
    pub tick_ages_ms: HashMap<String, Option<u64>>,
    pub positions: Vec<Position>,
    pub realized_today: f64,
    pub cycle_stats: CycleStatsSnapshot,
    pub regime: RegimeSnapshot,
    pub strategy_weights: HashMap<String, f64>,
    pub reconcile_passes: u64,
    pub reconcile_divergences: u64,
    pub uptime_secs: u64,
    pub server_time: i64,
}

impl AppState {
    /// Build the status snapshot. Always responds, whatever state the
    /// subsystems are in.
    pub fn build_status(&self) -> StatusSnapshot {
        let now = Utc::now();
        StatusSnapshot {
            engine_state: self.orchestrator.engine_state().to_string(),
            not_ready_reason: self.orchestrator.not_ready_reason(),
            feed_state: self.ingestor.state().to_string(),
            feed_last_event_age_ms: self
                .ingestor
                .last_event_age()
                .map(|age| age.as_millis() as u64),
            urgent_close: self.monitor.is_urgent(),
            tick_ages_ms: self.cache.tick_ages_ms(now),
            positions: self.tracker.snapshot(),
            realized_today: self.tracker.realized_today(),
            cycle_stats: self.orchestrator.stats.snapshot(),
            regime: self.regime.current(),
            strategy_weights: self.weights.snapshot(),
            reconcile_passes: self.reconciler.passes(),
            reconcile_divergences: self.reconciler.divergences_seen(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: now.timestamp_millis(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("engine_state", &self.orchestrator.engine_state())
            .field("feed_state", &self.ingestor.state())
            .field("positions", &self.tracker.len())
            .finish()
    }
}
