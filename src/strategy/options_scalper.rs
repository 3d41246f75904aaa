// =============================================================================
// V2 — Options scalper on F&O underlyings
// =============================================================================
//
// Buys at-the-money calls (bullish underlying momentum) or puts (bearish)
// when the live premium trades under its Black-Scholes theoretical value.
// Implied vol comes from the cached option chain; when the chain carries no
// IV the configured default applies. Option chains are refreshed by a
// background task; `on_tick` only reads the cache, never the broker.
//
// Stops are a fixed fraction of the premium, sizing follows the shared
// 0.8–1.0% capital-risk rule in whole lots.
// =============================================================================

use std::collections::HashMap;

use chrono::NaiveDate;
use parking_lot::RwLock;
use tracing::debug;

use crate::broker::{ChainStrike, OptionChain};
use crate::indicators::roc::calculate_roc;
use crate::market_data::{BarInterval, HistoryReq};
use crate::portfolio::Position;
use crate::regime::RegimeSnapshot;
use crate::signals::Signal;
use crate::types::TradeAction;

use super::black_scholes::{self, OptionKind};
use super::toolkit;
use super::{Strategy, StrategyCtx};

pub const STRATEGY_ID: &str = "options_scalper";

/// Minimum theoretical-vs-market edge (fraction of premium) to act on.
const MIN_EDGE_FRAC: f64 = 0.02;
/// Edge against an open position that forces an exit.
const EXIT_EDGE_FRAC: f64 = 0.05;
/// Initial stop as a fraction of the premium.
const STOP_FRAC: f64 = 0.10;
/// Underlying 5-minute ROC that defines a tradeable drift.
const MIN_UNDERLYING_ROC: f64 = 0.0008;

/// Shared, periodically refreshed chain snapshots keyed by underlying.
pub struct ChainCache {
    chains: RwLock<HashMap<String, OptionChain>>,
}

impl ChainCache {
    pub fn new() -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, chain: OptionChain) {
        self.chains.write().insert(chain.underlying.clone(), chain);
    }

    pub fn get(&self, underlying: &str) -> Option<OptionChain> {
        self.chains.read().get(underlying).cloned()
    }

    pub fn underlyings(&self) -> Vec<String> {
        self.chains.read().keys().cloned().collect()
    }

    pub fn expiry_of(&self, underlying: &str) -> Option<NaiveDate> {
        self.chains.read().get(underlying).map(|c| c.expiry)
    }
}

impl Default for ChainCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChainCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainCache")
            .field("underlyings", &self.chains.read().len())
            .finish()
    }
}

/// One actionable contract extracted from a chain row.
struct Candidate<'a> {
    symbol: &'a str,
    premium: f64,
    iv: Option<f64>,
    kind: OptionKind,
    strike: f64,
}

#[derive(Default)]
pub struct OptionsScalper {
    positions: Vec<Position>,
}

impl OptionsScalper {
    pub fn new() -> Self {
        Self::default()
    }

    fn has_position(&self, symbol: &str) -> bool {
        self.positions.iter().any(|p| p.symbol == symbol)
    }

    fn candidate<'a>(row: &'a ChainStrike, kind: OptionKind) -> Option<Candidate<'a>> {
        match kind {
            OptionKind::Call => Some(Candidate {
                symbol: row.call_symbol.as_deref()?,
                premium: row.call_ltp.filter(|p| *p > 0.0)?,
                iv: row.call_iv,
                kind,
                strike: row.strike,
            }),
            OptionKind::Put => Some(Candidate {
                symbol: row.put_symbol.as_deref()?,
                premium: row.put_ltp.filter(|p| *p > 0.0)?,
                iv: row.put_iv,
                kind,
                strike: row.strike,
            }),
        }
    }

    /// Years to expiry, floored at one trading day.
    fn years_to_expiry(expiry: NaiveDate, today: NaiveDate) -> f64 {
        let days = (expiry - today).num_days().max(1) as f64;
        days / 365.0
    }

    fn confidence(edge_frac: f64, underlying_roc: f64) -> f64 {
        let mut conf = 6.0;
        conf += (edge_frac * 60.0).min(2.0);
        conf += (underlying_roc.abs() * 1000.0).min(1.5);
        conf.min(9.5)
    }
}

impl Strategy for OptionsScalper {
    fn id(&self) -> &'static str {
        STRATEGY_ID
    }

    fn warmup_requirements(&self) -> Vec<HistoryReq> {
        vec![HistoryReq {
            interval: BarInterval::M5,
            bars: 20,
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
            // Exit when the contract has become rich against its model value:
            // the mispricing that justified the entry has inverted.
            let overpriced = Self::model_edge(ctx, &position.symbol, tick.ltp)
                .map(|edge| edge <= -EXIT_EDGE_FRAC)
                .unwrap_or(false);
            if overpriced {
                debug!(symbol = %position.symbol, "option premium rich vs model — closing");
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
        let today = ctx.now.date_naive();

        for underlying in ctx.chains.underlyings() {
            let Some(chain) = ctx.chains.get(&underlying) else {
                continue;
            };

            // Direction from the underlying's 5-minute drift.
            let Ok(bars) = ctx.cache.history(&underlying, BarInterval::M5, 20) else {
                continue;
            };
            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            let Some(roc) = calculate_roc(&closes, 6) else {
                continue;
            };
            if roc.abs() < MIN_UNDERLYING_ROC {
                continue;
            }
            let kind = if roc > 0.0 {
                OptionKind::Call
            } else {
                OptionKind::Put
            };

            let Some(row) = chain.at_the_money() else {
                continue;
            };
            let Some(candidate) = Self::candidate(row, kind) else {
                continue;
            };
            if self.has_position(candidate.symbol) {
                continue;
            }
            let Some(meta) = ctx.cache.meta(candidate.symbol) else {
                debug!(symbol = %candidate.symbol, "chain contract not registered — skipping");
                continue;
            };

            // Theoretical value at the chain IV (configured fallback).
            let iv = candidate.iv.unwrap_or(ctx.config.default_iv);
            let years = Self::years_to_expiry(chain.expiry, today);
            let Some(theo) = black_scholes::value(
                candidate.kind,
                chain.spot,
                candidate.strike,
                iv,
                ctx.config.risk_free_rate,
                years,
            ) else {
                continue;
            };

            let edge_frac = (theo.price - candidate.premium) / candidate.premium;
            if edge_frac < MIN_EDGE_FRAC {
                continue;
            }

            let entry = candidate.premium;
            let stop = meta.round_to_tick(entry * (1.0 - STOP_FRAC));
            let target = toolkit::target_from(
                entry,
                stop,
                TradeAction::Buy,
                toolkit::reward_risk_for(regime),
                &meta,
            );
            let quantity = toolkit::risk_based_quantity(ctx.capital, entry, stop, &meta);
            if quantity == 0 {
                continue;
            }

            let signal = Signal::entry(
                candidate.symbol,
                TradeAction::Buy,
                entry,
                stop,
                target,
                quantity,
                Self::confidence(edge_frac, roc),
                STRATEGY_ID,
                ctx.now,
            );
            if signal.validate_levels().is_ok() {
                debug!(
                    symbol = %candidate.symbol,
                    premium = entry,
                    theo = format!("{:.2}", theo.price),
                    edge = format!("{:.3}", edge_frac),
                    iv,
                    "underpriced option — scalp entry proposed"
                );
                signals.push(signal);
            }
        }

        signals
    }
}

impl OptionsScalper {
    /// Signed model edge for an owned contract: positive means the market
    /// still trades under theoretical value.
    fn model_edge(ctx: &StrategyCtx<'_>, symbol: &str, premium: f64) -> Option<f64> {
        if premium <= 0.0 {
            return None;
        }
        for underlying in ctx.chains.underlyings() {
            let chain = ctx.chains.get(&underlying)?;
            for row in &chain.strikes {
                let (kind, iv) = if row.call_symbol.as_deref() == Some(symbol) {
                    (OptionKind::Call, row.call_iv)
                } else if row.put_symbol.as_deref() == Some(symbol) {
                    (OptionKind::Put, row.put_iv)
                } else {
                    continue;
                };
                let years =
                    Self::years_to_expiry(chain.expiry, ctx.now.date_naive());
                let theo = black_scholes::value(
                    kind,
                    chain.spot,
                    row.strike,
                    iv.unwrap_or(ctx.config.default_iv),
                    ctx.config.risk_free_rate,
                    years,
                )?;
                return Some((theo.price - premium) / premium);
            }
        }
        None
    }
}
