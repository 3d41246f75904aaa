// =============================================================================
// Orchestrator — the per-second decision loop
// =============================================================================
//
// Per tick:
//   1. Health gate: feed connected, benchmark tick fresh, engine started,
//      not in urgent-close. Failing the gate skips strategy execution (the
//      position monitor keeps running) and logs a heartbeat.
//   2. Snapshot the universe, update the regime.
//   3. Run every strategy over the snapshot — sync_positions, then
//      manage_existing, then on_tick — in a scoped parallel pool, joined
//      before any signal is routed. Results are consumed in configured
//      strategy order, preserving each strategy's own emission order.
//   4. Apply the adaptive controller's confidence weights to entry signals.
//   5. Route through the deduplicator, then the portfolio gate, then hand
//      the approved batch to the trade engine.
//   6. Publish per-tick counters.
//
// Shutdown: stop accepting signals, let in-flight broker submissions drain
// within `drain_timeout`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::feed::FeedIngestor;
use crate::market_data::MarketDataCache;
use crate::portfolio::{GateContext, GateDecision, PortfolioGate, PositionTracker};
use crate::regime::RegimeEngine;
use crate::signals::{Signal, SignalDeduplicator};
use crate::strategy::{ChainCache, Strategy, StrategyCtx, StrategyWeights};
use crate::types::{EngineState, InstrumentKind};

use super::monitor::PositionMonitor;
use super::trade_engine::TradeEngine;

/// Monotonic per-tick counters, cheap to read from the status endpoint.
#[derive(Debug, Default)]
pub struct CycleStats {
    pub cycles: AtomicU64,
    pub signals_proposed: AtomicU64,
    pub signals_filtered: AtomicU64,
    pub signals_rejected: AtomicU64,
    pub signals_submitted: AtomicU64,
}

/// Serializable snapshot of [`CycleStats`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CycleStatsSnapshot {
    pub cycles: u64,
    pub signals_proposed: u64,
    pub signals_filtered: u64,
    pub signals_rejected: u64,
    pub signals_submitted: u64,
}

impl CycleStats {
    pub fn snapshot(&self) -> CycleStatsSnapshot {
        CycleStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            signals_proposed: self.signals_proposed.load(Ordering::Relaxed),
            signals_filtered: self.signals_filtered.load(Ordering::Relaxed),
            signals_rejected: self.signals_rejected.load(Ordering::Relaxed),
            signals_submitted: self.signals_submitted.load(Ordering::Relaxed),
        }
    }
}

pub struct Orchestrator {
    config: EngineConfig,
    cache: Arc<MarketDataCache>,
    regime: Arc<RegimeEngine>,
    dedup: Arc<SignalDeduplicator>,
    gate: PortfolioGate,
    engine: Arc<TradeEngine>,
    tracker: Arc<PositionTracker>,
    weights: Arc<StrategyWeights>,
    chains: Arc<ChainCache>,
    ingestor: Arc<FeedIngestor>,
    monitor: Arc<PositionMonitor>,

    /// Strategies in priority order; locked only for the duration of one
    /// synchronous tick pass.
    strategies: Vec<Mutex<Box<dyn Strategy>>>,

    trading_enabled: AtomicBool,
    state: RwLock<EngineState>,
    not_ready_reason: RwLock<Option<String>>,
    pub stats: Arc<CycleStats>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        cache: Arc<MarketDataCache>,
        regime: Arc<RegimeEngine>,
        dedup: Arc<SignalDeduplicator>,
        gate: PortfolioGate,
        engine: Arc<TradeEngine>,
        tracker: Arc<PositionTracker>,
        weights: Arc<StrategyWeights>,
        chains: Arc<ChainCache>,
        ingestor: Arc<FeedIngestor>,
        monitor: Arc<PositionMonitor>,
        strategies: Vec<Box<dyn Strategy>>,
    ) -> Self {
        Self {
            config,
            cache,
            regime,
            dedup,
            gate,
            engine,
            tracker,
            weights,
            chains,
            ingestor,
            monitor,
            strategies: strategies.into_iter().map(Mutex::new).collect(),
            trading_enabled: AtomicBool::new(false),
            state: RwLock::new(EngineState::Stopped),
            not_ready_reason: RwLock::new(None),
            stats: Arc::new(CycleStats::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Control surface
    // -------------------------------------------------------------------------

    /// Start the loop. Refuses with a diagnostic while any subsystem is
    /// NOT_READY.
    pub fn start(&self) -> Result<(), String> {
        if let Some(reason) = self.not_ready_reason.read().clone() {
            warn!(reason = %reason, "start refused — subsystem not ready");
            return Err(reason);
        }
        self.trading_enabled.store(true, Ordering::SeqCst);
        info!("orchestrator started");
        Ok(())
    }

    pub fn stop(&self) {
        self.trading_enabled.store(false, Ordering::SeqCst);
        *self.state.write() = EngineState::Stopped;
        info!("orchestrator stopped");
    }

    pub fn engine_state(&self) -> EngineState {
        *self.state.read()
    }

    /// Mark a fatal readiness failure (benchmark preload, auth). Clears when
    /// `None`.
    pub fn set_not_ready(&self, reason: Option<String>) {
        *self.not_ready_reason.write() = reason;
    }

    pub fn not_ready_reason(&self) -> Option<String> {
        self.not_ready_reason.read().clone()
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.tick_period_ms);
        info!(period_ms = period.as_millis() as u64, "orchestrator loop running");
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = shutdown.changed() => break,
            }
        }

        // Drain: no new signals, wait out in-flight submissions.
        self.engine.stop_accepting();
        let drain_deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.drain_timeout_ms);
        while self.engine.in_flight() > 0 && tokio::time::Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if self.engine.in_flight() > 0 {
            warn!("drain timeout expired with submissions still in flight");
        }
        info!("orchestrator loop stopped");
    }

    /// One tick (public for the scenario tests).
    pub async fn tick(&self, now: DateTime<Utc>) {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        if !self.trading_enabled.load(Ordering::SeqCst) {
            debug!("heartbeat: orchestrator stopped");
            return;
        }

        // --- 1. Health gate ---------------------------------------------------
        if let Some(reason) = self.health_block(now) {
            *self.state.write() = EngineState::NotReady;
            debug!(reason = %reason, "heartbeat: degraded — strategies skipped");
            return;
        }
        *self.state.write() = EngineState::Running;

        // --- 2. Snapshot + regime ---------------------------------------------
        let snapshot = self.cache.snapshot(&self.config.universe);
        let regime = self.regime.update(&self.cache);

        // --- 3. Strategies in a scoped pool -----------------------------------
        let ctx = StrategyCtx {
            snapshot: &snapshot,
            cache: &self.cache,
            config: &self.config,
            capital: self.config.capital,
            now,
            chains: &self.chains,
        };
        let positions = self.tracker.snapshot();

        let mut per_strategy: Vec<(Vec<Signal>, Vec<Signal>)> =
            Vec::with_capacity(self.strategies.len());
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .strategies
                .iter()
                .map(|slot| {
                    let ctx = &ctx;
                    let positions = &positions;
                    scope.spawn(move || {
                        let mut strategy = slot.lock();
                        let own: Vec<_> = positions
                            .iter()
                            .filter(|p| p.strategy_id == strategy.id())
                            .cloned()
                            .collect();
                        strategy.sync_positions(&own);
                        let management = strategy.manage_existing(ctx);
                        let entries = strategy.on_tick(ctx, &regime);
                        (management, entries)
                    })
                })
                .collect();
            for handle in handles {
                // A panicking strategy yields an empty result for this tick;
                // it must never take the orchestrator down.
                per_strategy.push(handle.join().unwrap_or_default());
            }
        });

        // --- 4. Collect in priority order, weight entry confidence ------------
        let mut batch: Vec<Signal> = Vec::new();
        for (slot, (management, entries)) in self.strategies.iter().zip(per_strategy) {
            let strategy_id = slot.lock().id().to_string();
            let weight = self.weights.get(&strategy_id);
            batch.extend(management);
            for mut signal in entries {
                signal.confidence = (signal.confidence * weight).clamp(0.0, 10.0);
                batch.push(signal);
            }
        }
        if batch.is_empty() {
            return;
        }
        self.stats
            .signals_proposed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        // --- 5. Dedup → gate → engine ------------------------------------------
        let outcome = self
            .dedup
            .filter(now.date_naive(), batch, &self.cache, regime)
            .await;
        self.stats
            .signals_filtered
            .fetch_add(outcome.dropped.len() as u64, Ordering::Relaxed);

        let daily_pnl = self.daily_pnl();
        let position_kinds = |symbol: &str| {
            self.cache
                .meta(symbol)
                .map(|m| m.kind)
                .unwrap_or(InstrumentKind::Equity)
        };

        let mut approved: Vec<Signal> = Vec::new();
        for mut signal in outcome.passed {
            let Some(meta) = self.cache.meta(&signal.symbol) else {
                self.stats.signals_rejected.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let ctx = GateContext {
                positions: &positions,
                meta: &meta,
                capital: self.config.capital,
                daily_pnl,
                regime,
                now,
                position_kinds: &position_kinds,
            };
            match self.gate.evaluate(&signal, &ctx) {
                GateDecision::Accept { quantity, reason } => {
                    if let Some(reason) = reason {
                        debug!(symbol = %signal.symbol, reason = %reason, "gate resized/flagged signal");
                    }
                    signal.quantity = quantity;
                    approved.push(signal);
                }
                GateDecision::Reject(reason) => {
                    debug!(symbol = %signal.symbol, reason = %reason, "gate rejected signal");
                    self.stats.signals_rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if approved.is_empty() {
            return;
        }
        let submitted = self.engine.submit_batch(approved).await;
        self.stats
            .signals_submitted
            .fetch_add(submitted.submitted as u64, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    fn health_block(&self, _now: DateTime<Utc>) -> Option<String> {
        if let Some(reason) = self.not_ready_reason.read().clone() {
            return Some(reason);
        }
        if !self.ingestor.is_connected() {
            return Some(format!("feed {}", self.ingestor.state()));
        }
        if self.cache.fresh(&self.config.benchmark_symbol).is_none() {
            return Some("benchmark tick stale or missing".to_string());
        }
        if self.monitor.is_urgent() {
            return Some("urgent close mode — entries frozen".to_string());
        }
        None
    }

    /// Realized plus unrealized PnL for the day.
    fn daily_pnl(&self) -> f64 {
        let unrealized: f64 = self
            .tracker
            .snapshot()
            .iter()
            .filter_map(|p| self.cache.fresh(&p.symbol).map(|t| p.unrealized_at(t.ltp)))
            .sum();
        self.tracker.realized_today() + unrealized
    }

    /// Per-symbol tick ages for the status endpoint.
    pub fn tick_ages(&self, now: DateTime<Utc>) -> HashMap<String, Option<u64>> {
        self.cache.tick_ages_ms(now)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.engine_state())
            .field("strategies", &self.strategies.len())
            .field("trading_enabled", &self.trading_enabled.load(Ordering::SeqCst))
            .finish()
    }
}
