// =============================================================================
// Market Regime — benchmark bias, strength, and move zone
// =============================================================================
//
// Recomputed every orchestrator tick from the benchmark index (NIFTY) tick and
// 1-minute history. Strategies and the portfolio gate read the result; nothing
// else writes it.
//
// Outputs:
//   bias      — sign of an EMA-smoothed short-horizon momentum measure
//   strength  — momentum magnitude normalised by per-bar ATR, mapped to [0,10]
//   move_zone — today's cumulative move as a fraction of the daily ATR:
//                 < 0.5·ATR  EARLY
//                 0.5–1·ATR  NORMAL
//                 1–1.5·ATR  EXTENDED
//                 > 1.5·ATR  EXTREME
//   actions   — per-zone guidance for chase-side and fade-side entries:
//
//     zone      | chase side                     | fade side
//     ----------+--------------------------------+---------------------------
//     EARLY     | TREND_FOLLOW                   | CAUTION
//     NORMAL    | TREND_FOLLOW                   | CAUTION
//     EXTENDED  | CAUTION  (confidence >= 9.0)   | FADE
//     EXTREME   | BLOCK_CHASE (confidence >= 9.5)| FADE (size boost 1.1–1.3x)
// =============================================================================

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::atr::calculate_atr_frac;
use crate::indicators::ema::calculate_ema;
use crate::market_data::{BarInterval, MarketDataCache};
use crate::types::TradeAction;

/// Bars of benchmark history consumed per update.
const MOMENTUM_WINDOW: usize = 40;
/// EMA span applied to 1-bar returns.
const MOMENTUM_SPAN: usize = 10;
/// Five-minute bars in one NSE session; used to scale bar ATR to a daily ATR
/// estimate when no daily history was provided.
const BARS_PER_SESSION_5M: f64 = 75.0;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for Bias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "BULLISH"),
            Self::Bearish => write!(f, "BEARISH"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveZone {
    Early,
    Normal,
    Extended,
    Extreme,
}

impl std::fmt::Display for MoveZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Early => write!(f, "EARLY"),
            Self::Normal => write!(f, "NORMAL"),
            Self::Extended => write!(f, "EXTENDED"),
            Self::Extreme => write!(f, "EXTREME"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MrAction {
    TrendFollow,
    Caution,
    Fade,
    BlockChase,
}

impl std::fmt::Display for MrAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrendFollow => write!(f, "TREND_FOLLOW"),
            Self::Caution => write!(f, "CAUTION"),
            Self::Fade => write!(f, "FADE"),
            Self::BlockChase => write!(f, "BLOCK_CHASE"),
        }
    }
}

/// Complete regime snapshot consumed by strategies and the portfolio gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub bias: Bias,
    /// Momentum strength in [0, 10].
    pub strength: f64,
    pub move_zone: MoveZone,
    pub chase_action: MrAction,
    pub fade_action: MrAction,
}

impl Default for RegimeSnapshot {
    fn default() -> Self {
        Self {
            bias: Bias::Neutral,
            strength: 0.0,
            move_zone: MoveZone::Early,
            chase_action: MrAction::TrendFollow,
            fade_action: MrAction::Caution,
        }
    }
}

impl RegimeSnapshot {
    /// True when `action` trades in the same direction the benchmark is
    /// already moving (chasing). Neutral bias has no chase side.
    pub fn is_chase(&self, action: TradeAction) -> bool {
        match (self.bias, action) {
            (Bias::Bullish, TradeAction::Buy) | (Bias::Bearish, TradeAction::Sell) => true,
            _ => false,
        }
    }

    /// Minimum confidence the zone demands of a chase-side entry, if any.
    pub fn chase_confidence_floor(&self) -> Option<f64> {
        match self.move_zone {
            MoveZone::Early | MoveZone::Normal => None,
            MoveZone::Extended => Some(9.0),
            MoveZone::Extreme => Some(9.5),
        }
    }

    /// Size multiplier for fade-side entries in the EXTREME zone, scaled by
    /// strength within [1.1, 1.3]. 1.0 everywhere else.
    pub fn fade_boost(&self) -> f64 {
        if self.move_zone != MoveZone::Extreme {
            return 1.0;
        }
        1.1 + 0.2 * (self.strength / 10.0).clamp(0.0, 1.0)
    }

    /// Regime-alignment check for entries: a long entry is blocked when the
    /// bias is firmly bearish (strength >= 3), symmetrically for shorts.
    pub fn allows_entry(&self, action: TradeAction) -> bool {
        match (action, self.bias) {
            (TradeAction::Buy, Bias::Bearish) | (TradeAction::Sell, Bias::Bullish) => {
                self.strength < 3.0
            }
            _ => true,
        }
    }
}

// =============================================================================
// RegimeEngine
// =============================================================================

/// Thread-safe regime computer caching the latest snapshot.
pub struct RegimeEngine {
    benchmark: String,
    state: RwLock<Option<RegimeSnapshot>>,
    /// Daily ATR in index points, set from preloaded daily history. When
    /// absent, estimated from the 5-minute ATR.
    daily_atr: RwLock<Option<f64>>,
}

impl RegimeEngine {
    pub fn new(benchmark: impl Into<String>) -> Self {
        Self {
            benchmark: benchmark.into(),
            state: RwLock::new(None),
            daily_atr: RwLock::new(None),
        }
    }

    pub fn benchmark(&self) -> &str {
        &self.benchmark
    }

    /// Provide the daily ATR computed from the warm-up preload.
    pub fn set_daily_atr(&self, atr_points: f64) {
        if atr_points > 0.0 {
            *self.daily_atr.write() = Some(atr_points);
        }
    }

    /// Recompute the regime from the cache. Returns the previous snapshot
    /// (or the neutral default) when benchmark data is missing or stale.
    pub fn update(&self, cache: &MarketDataCache) -> RegimeSnapshot {
        let Some(tick) = cache.fresh(&self.benchmark) else {
            return self.current();
        };
        let bars_1m = match cache.history(&self.benchmark, BarInterval::M1, MOMENTUM_WINDOW) {
            Ok(b) => b,
            Err(_) => return self.current(),
        };
        if bars_1m.len() < MOMENTUM_SPAN + 2 {
            return self.current();
        }

        // --- Momentum: EMA-smoothed 1-bar returns ---------------------------
        let closes: Vec<f64> = bars_1m.iter().map(|b| b.close).collect();
        let returns: Vec<f64> = closes
            .windows(2)
            .map(|w| if w[0] > 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
            .collect();
        let momentum = calculate_ema(&returns, MOMENTUM_SPAN)
            .last()
            .copied()
            .unwrap_or(0.0);

        // --- Bar ATR for normalisation --------------------------------------
        let bar_atr_frac = calculate_atr_frac(&bars_1m, 14).unwrap_or(0.0);

        let (bias, strength) = classify_bias(momentum, bar_atr_frac);

        // --- Move zone: today's move vs daily ATR ---------------------------
        let daily_atr = self.daily_atr.read().unwrap_or_else(|| {
            let frac_5m = cache
                .history(&self.benchmark, BarInterval::M5, 20)
                .ok()
                .and_then(|bars| calculate_atr_frac(&bars, 14))
                .unwrap_or(0.0);
            frac_5m * BARS_PER_SESSION_5M.sqrt() * tick.ltp
        });
        let day_move = (tick.ltp - tick.close_prev).abs();
        let move_zone = classify_zone(day_move, daily_atr);

        let (chase_action, fade_action) = zone_actions(move_zone);

        let snapshot = RegimeSnapshot {
            bias,
            strength,
            move_zone,
            chase_action,
            fade_action,
        };

        debug!(
            bias = %bias,
            strength = format!("{strength:.1}"),
            zone = %move_zone,
            momentum = format!("{momentum:.5}"),
            day_move = format!("{day_move:.1}"),
            "regime updated"
        );

        *self.state.write() = Some(snapshot);
        snapshot
    }

    /// Latest snapshot without recomputation; neutral default before the
    /// first successful update.
    pub fn current(&self) -> RegimeSnapshot {
        self.state.read().unwrap_or_default()
    }
}

impl std::fmt::Debug for RegimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegimeEngine")
            .field("benchmark", &self.benchmark)
            .field("state", &*self.state.read())
            .finish()
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Map smoothed momentum and per-bar ATR into (bias, strength).
fn classify_bias(momentum: f64, bar_atr_frac: f64) -> (Bias, f64) {
    if bar_atr_frac <= 0.0 || !momentum.is_finite() {
        return (Bias::Neutral, 0.0);
    }
    // Momentum measured in units of per-bar ATR; 4 ATRs of sustained drift
    // saturates the scale.
    let ratio = momentum.abs() / bar_atr_frac;
    let strength = (ratio * 2.5).clamp(0.0, 10.0);

    if strength < 1.0 {
        return (Bias::Neutral, strength);
    }
    if momentum > 0.0 {
        (Bias::Bullish, strength)
    } else {
        (Bias::Bearish, strength)
    }
}

/// Partition today's move into the four zones.
fn classify_zone(day_move: f64, daily_atr: f64) -> MoveZone {
    if daily_atr <= 0.0 {
        return MoveZone::Early;
    }
    let ratio = day_move / daily_atr;
    if ratio < 0.5 {
        MoveZone::Early
    } else if ratio < 1.0 {
        MoveZone::Normal
    } else if ratio < 1.5 {
        MoveZone::Extended
    } else {
        MoveZone::Extreme
    }
}

/// Per-zone (chase, fade) action pair.
fn zone_actions(zone: MoveZone) -> (MrAction, MrAction) {
    match zone {
        MoveZone::Early | MoveZone::Normal => (MrAction::TrendFollow, MrAction::Caution),
        MoveZone::Extended => (MrAction::Caution, MrAction::Fade),
        MoveZone::Extreme => (MrAction::BlockChase, MrAction::Fade),
    }
}
