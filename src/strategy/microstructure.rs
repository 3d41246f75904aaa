// =============================================================================
// V3 — Microstructure / mean-reversion scalper
// =============================================================================
//
// Fades statistically stretched moves when order flow hints at exhaustion:
//
//   - z-score of the last price against its 20-bar 1-minute distribution
//     must be beyond ±Z_ENTRY
//   - the order-flow imbalance proxy (where the last trade printed inside
//     the bid-ask band) must lean back toward the mean
//
// Positions close when price reverts through the rolling mean. Stops sit
// beyond the local extreme so noise does not shake the position out.
// =============================================================================

use tracing::debug;

use crate::market_data::{Bar, BarInterval, HistoryReq, Tick};
use crate::portfolio::Position;
use crate::regime::RegimeSnapshot;
use crate::signals::Signal;
use crate::types::{InstrumentKind, TradeAction};

use super::toolkit;
use super::{Strategy, StrategyCtx};

pub const STRATEGY_ID: &str = "microstructure";

/// Bars in the z-score window.
const Z_WINDOW: usize = 20;
/// Entry threshold on |z|.
const Z_ENTRY: f64 = 2.0;
/// Stop buffer beyond the local extreme, as a fraction of price.
const STOP_BUFFER_FRAC: f64 = 0.0015;

#[derive(Default)]
pub struct MicrostructureScalper {
    positions: Vec<Position>,
}

impl MicrostructureScalper {
    pub fn new() -> Self {
        Self::default()
    }

    fn has_position(&self, symbol: &str) -> bool {
        self.positions.iter().any(|p| p.symbol == symbol)
    }

    /// z-score of `price` against the window's close distribution, plus the
    /// window mean. `None` when the distribution is degenerate.
    fn z_score(closes: &[f64], price: f64) -> Option<(f64, f64)> {
        if closes.len() < Z_WINDOW {
            return None;
        }
        let window = &closes[closes.len() - Z_WINDOW..];
        let mean = window.iter().sum::<f64>() / window.len() as f64;
        let variance =
            window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / window.len() as f64;
        let std = variance.sqrt();
        if std <= f64::EPSILON {
            return None;
        }
        Some(((price - mean) / std, mean))
    }

    /// Where the last trade printed inside the bid-ask band, in [-1, 1]:
    /// +1 at the ask (buyers lifting), -1 at the bid (sellers hitting).
    fn flow_imbalance(tick: &Tick) -> Option<f64> {
        if tick.bid <= 0.0 || tick.ask <= tick.bid {
            return None;
        }
        let mid = (tick.bid + tick.ask) / 2.0;
        let half = (tick.ask - tick.bid) / 2.0;
        Some(((tick.ltp - mid) / half).clamp(-1.0, 1.0))
    }

    fn local_extreme(bars: &[Bar], action: TradeAction) -> Option<f64> {
        let recent = &bars[bars.len().saturating_sub(3)..];
        match action {
            TradeAction::Buy => recent.iter().map(|b| b.low).fold(None, |acc, v| {
                Some(acc.map_or(v, |a: f64| a.min(v)))
            }),
            TradeAction::Sell => recent.iter().map(|b| b.high).fold(None, |acc, v| {
                Some(acc.map_or(v, |a: f64| a.max(v)))
            }),
        }
    }

    fn confidence(z: f64, flow: f64) -> f64 {
        let mut conf = 5.5;
        conf += ((z.abs() - Z_ENTRY) * 1.2).clamp(0.0, 2.5);
        conf += (flow.abs() * 1.0).min(1.0);
        conf.min(9.5)
    }
}

impl Strategy for MicrostructureScalper {
    fn id(&self) -> &'static str {
        STRATEGY_ID
    }

    fn warmup_requirements(&self) -> Vec<HistoryReq> {
        vec![HistoryReq {
            interval: BarInterval::M1,
            bars: Z_WINDOW + 5,
        }]
    }

    fn sync_positions(&mut self, positions: &[Position]) {
        self.positions = positions.to_vec();
    }

    fn manage_existing(&mut self, ctx: &StrategyCtx<'_>) -> Vec<Signal> {
        let mut signals = Vec::new();

        for position in &self.positions {
            let Some(tick) = ctx.snapshot.get(&position.symbol) else {
                continue;
            };
            let Ok(bars) = ctx.cache.history(&position.symbol, BarInterval::M1, Z_WINDOW + 5)
            else {
                continue;
            };
            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            let Some((_, mean)) = Self::z_score(&closes, tick.ltp) else {
                continue;
            };

            // The reversion trade is done once price crosses back through
            // the mean.
            let reverted = match position.side {
                crate::types::PositionSide::Long => tick.ltp >= mean,
                crate::types::PositionSide::Short => tick.ltp <= mean,
            };
            if reverted {
                debug!(symbol = %position.symbol, mean, ltp = tick.ltp, "mean reached — closing scalp");
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

    fn on_tick(&mut self, ctx: &StrategyCtx<'_>, _regime: &RegimeSnapshot) -> Vec<Signal> {
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

            let Ok(bars) = ctx.cache.history(symbol, BarInterval::M1, Z_WINDOW + 5) else {
                continue;
            };
            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            let Some((z, mean)) = Self::z_score(&closes, tick.ltp) else {
                continue;
            };
            if z.abs() < Z_ENTRY {
                continue;
            }
            let Some(flow) = Self::flow_imbalance(tick) else {
                continue;
            };

            // Stretched down + buyers stepping in => fade long; mirror short.
            let action = if z <= -Z_ENTRY && flow > 0.0 {
                TradeAction::Buy
            } else if z >= Z_ENTRY && flow < 0.0 {
                TradeAction::Sell
            } else {
                continue;
            };

            let entry = tick.ltp;
            let Some(extreme) = Self::local_extreme(&bars, action) else {
                continue;
            };
            let stop = match action {
                TradeAction::Buy => meta.round_to_tick(extreme - entry * STOP_BUFFER_FRAC),
                TradeAction::Sell => meta.round_to_tick(extreme + entry * STOP_BUFFER_FRAC),
            };
            // Target the mean, floored at the minimum target spread.
            let min_target = match action {
                TradeAction::Buy => entry * (1.0 + crate::signals::MIN_TARGET_FRAC),
                TradeAction::Sell => entry * (1.0 - crate::signals::MIN_TARGET_FRAC),
            };
            let target = match action {
                TradeAction::Buy => meta.round_to_tick(mean.max(min_target)),
                TradeAction::Sell => meta.round_to_tick(mean.min(min_target)),
            };

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
                Self::confidence(z, flow),
                STRATEGY_ID,
                ctx.now,
            );
            if signal.validate_levels().is_ok() {
                debug!(
                    symbol = %symbol,
                    z = format!("{z:.2}"),
                    flow = format!("{flow:.2}"),
                    action = %action,
                    "mean-reversion scalp proposed"
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
    use chrono::{TimeZone, Utc};

    fn tick(ltp: f64, bid: f64, ask: f64) -> Tick {
        Tick {
            ltp,
            open: ltp,
            high: ltp,
            low: ltp,
            close_prev: ltp,
            volume: 100.0,
            bid,
            ask,
            oi: None,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn z_score_flags_stretch() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 + (i % 2) as f64 * 0.2).collect();
        let (z, mean) = MicrostructureScalper::z_score(&closes, 102.0).unwrap();
        assert!(z > 2.0, "z {z}");
        assert!((mean - 100.1).abs() < 0.01);
    }

    #[test]
    fn z_score_degenerate_distribution_is_none() {
        let closes = vec![100.0; 25];
        assert!(MicrostructureScalper::z_score(&closes, 101.0).is_none());
        assert!(MicrostructureScalper::z_score(&closes[..5], 101.0).is_none());
    }

    #[test]
    fn flow_imbalance_band_position() {
        // At the ask => +1.
        let at_ask = MicrostructureScalper::flow_imbalance(&tick(100.10, 100.0, 100.10)).unwrap();
        assert!((at_ask - 1.0).abs() < 1e-9);
        // At the bid => -1.
        let at_bid = MicrostructureScalper::flow_imbalance(&tick(100.0, 100.0, 100.10)).unwrap();
        assert!((at_bid + 1.0).abs() < 1e-9);
        // One-sided book => None.
        assert!(MicrostructureScalper::flow_imbalance(&tick(100.0, 0.0, 100.10)).is_none());
    }

    #[test]
    fn confidence_grows_with_stretch() {
        let mild = MicrostructureScalper::confidence(2.1, 0.5);
        let wild = MicrostructureScalper::confidence(3.5, 0.9);
        assert!(wild > mild);
        assert!(wild <= 9.5);
    }
}
