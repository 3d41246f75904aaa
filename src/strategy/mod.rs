// =============================================================================
// Strategy seam — capability trait, shared context, and confidence weights
// =============================================================================
//
// Strategies are plain state machines behind one trait: no I/O inside
// `on_tick`, no errors thrown to the orchestrator. Each owns its private
// state struct; the shared helpers live in `toolkit` as free functions and
// are composed, not inherited.
// =============================================================================

pub mod adaptive;
pub mod black_scholes;
pub mod microstructure;
pub mod momentum;
pub mod options_scalper;
pub mod toolkit;

pub use adaptive::AdaptiveController;
pub use microstructure::MicrostructureScalper;
pub use momentum::MomentumStrategy;
pub use options_scalper::{ChainCache, OptionsScalper};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::config::EngineConfig;
use crate::market_data::{HistoryReq, MarketDataCache, Tick};
use crate::portfolio::Position;
use crate::regime::RegimeSnapshot;
use crate::signals::Signal;

/// Read-only view handed to every strategy each tick. Built once per cycle
/// by the orchestrator.
pub struct StrategyCtx<'a> {
    /// Point-in-time consistent latest ticks for the universe.
    pub snapshot: &'a HashMap<String, Arc<Tick>>,
    /// History reads only; strategies never write the cache.
    pub cache: &'a MarketDataCache,
    pub config: &'a EngineConfig,
    pub capital: f64,
    pub now: DateTime<Utc>,
    /// Cached option chains for the F&O underlyings.
    pub chains: &'a ChainCache,
}

/// The capability set every strategy implements.
pub trait Strategy: Send {
    fn id(&self) -> &'static str;

    /// History each symbol must have before `on_tick` acts on it.
    fn warmup_requirements(&self) -> Vec<HistoryReq>;

    /// Mirror reality before the tick: the tracker's snapshot, filtered to
    /// this strategy's positions by the caller.
    fn sync_positions(&mut self, positions: &[Position]);

    /// Manage already-open positions. Every emitted signal must carry
    /// `management_action = true` (and `closing_action` for full exits).
    fn manage_existing(&mut self, ctx: &StrategyCtx<'_>) -> Vec<Signal>;

    /// Propose entries for this tick. Must not perform I/O.
    fn on_tick(&mut self, ctx: &StrategyCtx<'_>, regime: &RegimeSnapshot) -> Vec<Signal>;
}

/// Confidence multipliers published by the adaptive controller and applied
/// by the orchestrator to sibling-strategy signals.
pub struct StrategyWeights {
    weights: RwLock<HashMap<String, f64>>,
}

/// Multipliers outside this band are clamped on write.
pub const WEIGHT_FLOOR: f64 = 0.5;
pub const WEIGHT_CEIL: f64 = 1.5;

impl StrategyWeights {
    pub fn new() -> Self {
        Self {
            weights: RwLock::new(HashMap::new()),
        }
    }

    /// Multiplier for a strategy; 1.0 when none has been published.
    pub fn get(&self, strategy_id: &str) -> f64 {
        self.weights
            .read()
            .get(strategy_id)
            .copied()
            .unwrap_or(1.0)
    }

    pub fn set(&self, strategy_id: &str, weight: f64) {
        self.weights
            .write()
            .insert(strategy_id.to_string(), weight.clamp(WEIGHT_FLOOR, WEIGHT_CEIL));
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.weights.read().clone()
    }
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StrategyWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.weights.read().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_default_to_unity_and_clamp() {
        let weights = StrategyWeights::new();
        assert!((weights.get("momentum") - 1.0).abs() < 1e-12);

        weights.set("momentum", 2.0);
        assert!((weights.get("momentum") - WEIGHT_CEIL).abs() < 1e-12);

        weights.set("micro", 0.1);
        assert!((weights.get("micro") - WEIGHT_FLOOR).abs() < 1e-12);
    }
}
