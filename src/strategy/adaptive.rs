// =============================================================================
// V4 — Regime-adaptive controller
// =============================================================================
//
// Emits no orders of its own. It runs a discrete state estimator over
// (bias, strength bucket, move zone) and publishes confidence multipliers
// for the other strategies through the shared weights table:
//
//   - strong directional states favour the momentum strategy
//   - weak / ranging states favour the mean-reversion scalper
//   - stretched zones lean further toward fading
//
// Cold start: until `warmup_observations` regime samples accrue, the
// controller publishes nothing (all multipliers stay 1.0). On crossing the
// threshold the estimator is re-trained once from the preloaded benchmark
// history, so the first published weights reflect more than the live
// samples. Rarely-visited states are shrunk toward 1.0 by an occupancy
// posterior.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::indicators::atr::calculate_atr_frac;
use crate::indicators::roc::calculate_roc;
use crate::market_data::{Bar, BarInterval, HistoryReq};
use crate::portfolio::Position;
use crate::regime::{Bias, MoveZone, RegimeSnapshot};
use crate::signals::Signal;

use super::{microstructure, momentum, options_scalper, Strategy, StrategyCtx, StrategyWeights};

pub const STRATEGY_ID: &str = "adaptive";

/// Live regime samples required before the controller speaks.
const DEFAULT_WARMUP_OBSERVATIONS: u64 = 30;
/// Laplace-style smoothing mass: a state needs this many visits before its
/// profile applies at half strength.
const OCCUPANCY_SMOOTHING: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StrengthBucket {
    Weak,
    Moderate,
    Strong,
}

impl StrengthBucket {
    fn of(strength: f64) -> Self {
        if strength >= 6.0 {
            Self::Strong
        } else if strength >= 3.0 {
            Self::Moderate
        } else {
            Self::Weak
        }
    }
}

/// One cell of the discrete state space (3 x 3 x 4 = 36 states).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct State {
    bias: Bias,
    strength: StrengthBucket,
    zone: MoveZone,
}

impl State {
    fn of(regime: &RegimeSnapshot) -> Self {
        Self {
            bias: regime.bias,
            strength: StrengthBucket::of(regime.strength),
            zone: regime.move_zone,
        }
    }

    /// Raw multiplier profile for (momentum, options, microstructure).
    fn profile(self) -> (f64, f64, f64) {
        let mut profile = match (self.strength, self.bias) {
            (StrengthBucket::Strong, Bias::Bullish | Bias::Bearish) => (1.35, 1.10, 0.75),
            (StrengthBucket::Moderate, Bias::Bullish | Bias::Bearish) => (1.15, 1.05, 0.90),
            (StrengthBucket::Weak, _) | (_, Bias::Neutral) => (0.80, 0.95, 1.25),
        };
        // Stretched tape: directional continuation gets less credit, fading
        // more.
        match self.zone {
            MoveZone::Extended => {
                profile.0 -= 0.10;
                profile.2 += 0.05;
            }
            MoveZone::Extreme => {
                profile.0 -= 0.20;
                profile.2 += 0.15;
            }
            _ => {}
        }
        profile
    }
}

/// Empirical state-occupancy estimator.
struct StateEstimator {
    counts: HashMap<State, u64>,
    total: u64,
}

impl StateEstimator {
    fn new() -> Self {
        Self {
            counts: HashMap::new(),
            total: 0,
        }
    }

    fn observe(&mut self, state: State) {
        *self.counts.entry(state).or_insert(0) += 1;
        self.total += 1;
    }

    /// Posterior confidence in a state's profile: count / (count + K).
    fn occupancy(&self, state: State) -> f64 {
        let count = self.counts.get(&state).copied().unwrap_or(0) as f64;
        count / (count + OCCUPANCY_SMOOTHING)
    }

    /// Seed counts from preloaded benchmark bars: classify each rolling
    /// window the same way live updates would.
    fn train_from_bars(&mut self, bars: &[Bar]) {
        const WINDOW: usize = 20;
        if bars.len() < WINDOW + 1 {
            return;
        }
        let day_open = bars[0].open;
        for end in WINDOW..bars.len() {
            let window = &bars[end - WINDOW..=end];
            let closes: Vec<f64> = window.iter().map(|b| b.close).collect();
            let Some(roc) = calculate_roc(&closes, 10) else {
                continue;
            };
            let atr_frac = calculate_atr_frac(window, 10).unwrap_or(0.0);
            if atr_frac <= 0.0 {
                continue;
            }

            let ratio = roc.abs() / atr_frac;
            let strength = (ratio * 2.5).clamp(0.0, 10.0);
            let bias = if strength < 1.0 {
                Bias::Neutral
            } else if roc > 0.0 {
                Bias::Bullish
            } else {
                Bias::Bearish
            };

            let Some(last) = window.last() else { continue };
            let day_move_frac = if day_open > 0.0 {
                (last.close - day_open).abs() / day_open
            } else {
                0.0
            };
            let stretch = if atr_frac > 0.0 {
                day_move_frac / (atr_frac * (WINDOW as f64).sqrt())
            } else {
                0.0
            };
            let zone = if stretch < 0.5 {
                MoveZone::Early
            } else if stretch < 1.0 {
                MoveZone::Normal
            } else if stretch < 1.5 {
                MoveZone::Extended
            } else {
                MoveZone::Extreme
            };

            self.observe(State {
                bias,
                strength: StrengthBucket::of(strength),
                zone,
            });
        }
    }
}

/// The controller itself.
pub struct AdaptiveController {
    weights: Arc<StrategyWeights>,
    estimator: StateEstimator,
    warmup_observations: u64,
    live_observations: u64,
    trained: bool,
}

impl AdaptiveController {
    pub fn new(weights: Arc<StrategyWeights>) -> Self {
        Self {
            weights,
            estimator: StateEstimator::new(),
            warmup_observations: DEFAULT_WARMUP_OBSERVATIONS,
            live_observations: 0,
            trained: false,
        }
    }

    #[cfg(test)]
    fn with_warmup(weights: Arc<StrategyWeights>, warmup: u64) -> Self {
        let mut controller = Self::new(weights);
        controller.warmup_observations = warmup;
        controller
    }

    /// Blend a profile multiplier toward 1.0 by the state's occupancy.
    fn blend(raw: f64, occupancy: f64) -> f64 {
        1.0 + (raw - 1.0) * occupancy
    }

    fn publish(&self, state: State) {
        let occupancy = self.estimator.occupancy(state);
        let (momentum_raw, options_raw, micro_raw) = state.profile();

        self.weights
            .set(momentum::STRATEGY_ID, Self::blend(momentum_raw, occupancy));
        self.weights.set(
            options_scalper::STRATEGY_ID,
            Self::blend(options_raw, occupancy),
        );
        self.weights
            .set(microstructure::STRATEGY_ID, Self::blend(micro_raw, occupancy));

        debug!(
            occupancy = format!("{occupancy:.2}"),
            momentum = format!("{:.2}", self.weights.get(momentum::STRATEGY_ID)),
            options = format!("{:.2}", self.weights.get(options_scalper::STRATEGY_ID)),
            micro = format!("{:.2}", self.weights.get(microstructure::STRATEGY_ID)),
            "strategy weights published"
        );
    }
}

impl Strategy for AdaptiveController {
    fn id(&self) -> &'static str {
        STRATEGY_ID
    }

    fn warmup_requirements(&self) -> Vec<HistoryReq> {
        vec![HistoryReq {
            interval: BarInterval::M1,
            bars: 50,
        }]
    }

    fn sync_positions(&mut self, _positions: &[Position]) {}

    fn manage_existing(&mut self, _ctx: &StrategyCtx<'_>) -> Vec<Signal> {
        Vec::new()
    }

    fn on_tick(&mut self, ctx: &StrategyCtx<'_>, regime: &RegimeSnapshot) -> Vec<Signal> {
        let state = State::of(regime);
        self.estimator.observe(state);
        self.live_observations += 1;

        // Cold start: observe silently.
        if self.live_observations < self.warmup_observations {
            return Vec::new();
        }

        // Crossing the warm-up line: one-shot retrain from preloaded history
        // before the first publication.
        if !self.trained {
            if let Ok(bars) =
                ctx.cache
                    .history(&ctx.config.benchmark_symbol, BarInterval::M1, 200)
            {
                self.estimator.train_from_bars(&bars);
                info!(
                    states = self.estimator.counts.len(),
                    samples = self.estimator.total,
                    "adaptive estimator trained from benchmark history"
                );
            }
            self.trained = true;
        }

        self.publish(state);
        Vec::new()
    }
}

impl std::fmt::Debug for AdaptiveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveController")
            .field("live_observations", &self.live_observations)
            .field("trained", &self.trained)
            .field("states_seen", &self.estimator.counts.len())
            .finish()
    }
}
