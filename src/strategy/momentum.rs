// =============================================================================
// V1 — Momentum / trend-following strategy
// =============================================================================
//
// Entry pipeline per symbol:
//   1. Multi-timeframe momentum: 1-minute and 5-minute rate-of-change must
//      agree on direction.
//   2. HP-filter trend: the smoothed 5-minute trend slope must confirm.
//   3. RSI guard: buys need RSI in (50, 75) — trending but not exhausted;
//      sells mirror in (25, 50).
//   4. MACD histogram sign must match the direction.
//
// Stops are ATR-anchored (1.5 x ATR-5m, floored at 0.35% of entry), the
// quantity targets the standard 0.8–1.0% capital risk, and the target uses
// the regime-dependent reward:risk.
//
// Management: a hard 5-minute momentum reversal against an open position
// emits a closing signal; routine trailing and partial booking belong to the
// position monitor.
// =============================================================================

use tracing::debug;

use crate::indicators::atr::calculate_atr;
use crate::indicators::hp_filter::hp_trend;
use crate::indicators::macd::calculate_macd_standard;
use crate::indicators::roc::calculate_roc;
use crate::indicators::rsi::latest_rsi;
use crate::market_data::{BarInterval, HistoryReq};
use crate::portfolio::Position;
use crate::regime::RegimeSnapshot;
use crate::signals::Signal;
use crate::types::{InstrumentKind, TradeAction};

use super::toolkit;
use super::{Strategy, StrategyCtx};

pub const STRATEGY_ID: &str = "momentum";

/// ROC threshold on the 5-minute frame that counts as a reversal against an
/// open position.
const REVERSAL_ROC: f64 = 0.004;
/// ATR multiple for the initial stop.
const STOP_ATR_MULT: f64 = 1.5;
/// Stop floor as a fraction of entry; keeps stops tradeable on quiet names.
const STOP_FLOOR_FRAC: f64 = 0.0035;

#[derive(Default)]
pub struct MomentumStrategy {
    positions: Vec<Position>,
}

impl MomentumStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    fn has_position(&self, symbol: &str) -> bool {
        self.positions.iter().any(|p| p.symbol == symbol)
    }

    /// Direction both timeframes agree on, if any.
    fn momentum_direction(roc_1m: f64, roc_5m: f64) -> Option<TradeAction> {
        if roc_1m > 0.0 && roc_5m > 0.0 {
            Some(TradeAction::Buy)
        } else if roc_1m < 0.0 && roc_5m < 0.0 {
            Some(TradeAction::Sell)
        } else {
            None
        }
    }

    fn rsi_permits(action: TradeAction, rsi: f64) -> bool {
        match action {
            TradeAction::Buy => rsi > 50.0 && rsi < 75.0,
            TradeAction::Sell => rsi < 50.0 && rsi > 25.0,
        }
    }

    /// Conviction from the magnitude of the agreeing evidence.
    fn confidence(roc_5m: f64, hp_slope: f64, histogram: f64) -> f64 {
        let mut conf = 6.0;
        conf += (roc_5m.abs() * 800.0).min(1.5);
        conf += (hp_slope.abs() * 600.0).min(1.0);
        if histogram.abs() > 0.0 {
            conf += 0.5;
        }
        conf.min(9.5)
    }
}

impl Strategy for MomentumStrategy {
    fn id(&self) -> &'static str {
        STRATEGY_ID
    }

    fn warmup_requirements(&self) -> Vec<HistoryReq> {
        vec![
            HistoryReq {
                interval: BarInterval::M1,
                bars: 30,
            },
            HistoryReq {
                interval: BarInterval::M5,
                bars: 50,
            },
        ]
    }

    fn sync_positions(&mut self, positions: &[Position]) {
        self.positions = positions.to_vec();
    }

    fn manage_existing(&mut self, ctx: &StrategyCtx<'_>) -> Vec<Signal> {
        let mut signals = Vec::new();

        for position in &self.positions {
            let Ok(bars_5m) = ctx.cache.history(&position.symbol, BarInterval::M5, 50) else {
                continue;
            };
            let closes: Vec<f64> = bars_5m.iter().map(|b| b.close).collect();
            let Some(roc_5m) = calculate_roc(&closes, 6) else {
                continue;
            };

            let against = position.side.direction() * roc_5m;
            if against <= -REVERSAL_ROC {
                let Some(tick) = ctx.snapshot.get(&position.symbol) else {
                    continue;
                };
                debug!(
                    symbol = %position.symbol,
                    roc_5m = format!("{roc_5m:.4}"),
                    "momentum reversal — closing position"
                );
                signals.push(Signal::management(
                    position.symbol.clone(),
                    position.side.exit_action(),
                    tick.ltp,
                    position.quantity,
                    STRATEGY_ID,
                    position.tag.clone(),
                    true,
                    ctx.now,
                ));
            }
        }

        signals
    }

    fn on_tick(&mut self, ctx: &StrategyCtx<'_>, regime: &RegimeSnapshot) -> Vec<Signal> {
        let mut signals = Vec::new();

        for (symbol, tick) in ctx.snapshot {
            let Some(meta) = ctx.cache.meta(symbol) else {
                continue;
            };
            if meta.kind != InstrumentKind::Equity || symbol == &ctx.config.benchmark_symbol {
                continue;
            }
            if self.has_position(symbol) {
                continue;
            }

            let Ok(bars_1m) = ctx.cache.history(symbol, BarInterval::M1, 30) else {
                continue;
            };
            let Ok(bars_5m) = ctx.cache.history(symbol, BarInterval::M5, 50) else {
                continue;
            };
            if bars_1m.len() < 15 || bars_5m.len() < 35 {
                continue;
            }

            let closes_1m: Vec<f64> = bars_1m.iter().map(|b| b.close).collect();
            let closes_5m: Vec<f64> = bars_5m.iter().map(|b| b.close).collect();

            // --- 1. Multi-timeframe momentum --------------------------------
            let (Some(roc_1m), Some(roc_5m)) = (
                calculate_roc(&closes_1m, 10),
                calculate_roc(&closes_5m, 6),
            ) else {
                continue;
            };
            let Some(action) = Self::momentum_direction(roc_1m, roc_5m) else {
                continue;
            };
            let direction = match action {
                TradeAction::Buy => 1.0,
                TradeAction::Sell => -1.0,
            };

            // --- 2. HP trend confirmation -----------------------------------
            let Some(hp_slope) = hp_trend(&closes_5m, 400.0, 5) else {
                continue;
            };
            if hp_slope * direction <= 0.0 {
                continue;
            }

            // --- 3. RSI guard -----------------------------------------------
            let Some(rsi) = latest_rsi(&closes_5m, 14) else {
                continue;
            };
            if !Self::rsi_permits(action, rsi) {
                continue;
            }

            // --- 4. MACD confirmation ---------------------------------------
            let Some(macd) = calculate_macd_standard(&closes_5m) else {
                continue;
            };
            if macd.histogram * direction <= 0.0 {
                continue;
            }

            // --- Levels and sizing ------------------------------------------
            let entry = tick.ltp;
            let atr = calculate_atr(&bars_5m, 14).unwrap_or(0.0);
            let stop_distance = (atr * STOP_ATR_MULT).max(entry * STOP_FLOOR_FRAC);
            let stop = meta.round_to_tick(entry - direction * stop_distance);
            let target = toolkit::target_from(
                entry,
                stop,
                action,
                toolkit::reward_risk_for(regime),
                &meta,
            );
            let quantity = toolkit::risk_based_quantity(ctx.capital, entry, stop, &meta);
            if quantity == 0 {
                continue;
            }

            let signal = Signal::entry(
                symbol.clone(),
                action,
                entry,
                stop,
                target,
                quantity,
                Self::confidence(roc_5m, hp_slope, macd.histogram),
                STRATEGY_ID,
                ctx.now,
            );
            if signal.validate_levels().is_ok() {
                debug!(
                    symbol = %symbol,
                    action = %action,
                    entry,
                    stop,
                    target,
                    qty = quantity,
                    "momentum entry proposed"
                );
                signals.push(signal);
            }
        }

        signals
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn momentum_direction_requires_agreement() {
        assert_eq!(
            MomentumStrategy::momentum_direction(0.002, 0.004),
            Some(TradeAction::Buy)
        );
        assert_eq!(
            MomentumStrategy::momentum_direction(-0.002, -0.004),
            Some(TradeAction::Sell)
        );
        assert_eq!(MomentumStrategy::momentum_direction(0.002, -0.004), None);
    }

    #[test]
    fn rsi_guard_bands() {
        assert!(MomentumStrategy::rsi_permits(TradeAction::Buy, 60.0));
        assert!(!MomentumStrategy::rsi_permits(TradeAction::Buy, 80.0));
        assert!(!MomentumStrategy::rsi_permits(TradeAction::Buy, 45.0));
        assert!(MomentumStrategy::rsi_permits(TradeAction::Sell, 40.0));
        assert!(!MomentumStrategy::rsi_permits(TradeAction::Sell, 20.0));
    }

    #[test]
    fn confidence_bounded() {
        let conf = MomentumStrategy::confidence(0.05, 0.05, 1.0);
        assert!((conf - 9.5).abs() < 1e-9);
        let weak = MomentumStrategy::confidence(0.0005, 0.0002, 0.1);
        assert!(weak >= 6.0 && weak < 8.0);
    }
}
