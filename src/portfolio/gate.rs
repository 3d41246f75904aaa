// =============================================================================
// PortfolioGate — exposure and per-position risk checks
// =============================================================================
//
// Checks run in a fixed order; the first hard failure rejects. Sizing caps
// shrink the quantity to fit rather than rejecting outright, and reject only
// when lot rounding leaves nothing. The quantity never grows past what the
// strategy asked for, with one exception: the mean-reversion fade boost in
// the EXTREME zone — and even then every cap is re-applied afterwards, so
// the caps always win.
//
//   1. basic validity (levels, lots, entry window)
//   2. duplicate position
//   3. regime alignment
//   4. per-trade risk           <= 2% capital
//   5. per-position notional    <= 5% (options) / 2% (equity)
//   6. options exposure         <= 50% capital
//   7. total exposure           <= 70% capital hard, > 80% requested warns
//   8. daily loss brake         <= -2% capital blocks entries
//   9. move-zone confidence floors / fade boost
//
// Management and closing signals bypass the gate entirely.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::regime::RegimeSnapshot;
use crate::session;
use crate::signals::Signal;
use crate::types::{InstrumentKind, SymbolMeta};

use super::tracker::Position;

/// Machine-readable rejection and resize tags, asserted on by tests and
/// surfaced in telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateReason {
    InvalidLevels,
    LotRoundedToZero,
    AfterHours,
    DuplicatePosition,
    RegimeConflict,
    PerTradeRiskLimit,
    PerPositionLimit,
    OptionsExposureLimit,
    TotalExposureLimit,
    DailyLossBrake,
    ConfidenceBelowZoneFloor,
    ResizedToFit,
    MrFadeBoost,
    ManagementBypass,
}

impl std::fmt::Display for GateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::InvalidLevels => "INVALID_LEVELS",
            Self::LotRoundedToZero => "LOT_ROUNDED_TO_ZERO",
            Self::AfterHours => "AFTER_HOURS",
            Self::DuplicatePosition => "DUPLICATE_POSITION",
            Self::RegimeConflict => "REGIME_CONFLICT",
            Self::PerTradeRiskLimit => "PER_TRADE_RISK_LIMIT",
            Self::PerPositionLimit => "PER_POSITION_LIMIT",
            Self::OptionsExposureLimit => "OPTIONS_EXPOSURE_LIMIT",
            Self::TotalExposureLimit => "TOTAL_EXPOSURE_LIMIT",
            Self::DailyLossBrake => "DAILY_LOSS_BRAKE",
            Self::ConfidenceBelowZoneFloor => "CONFIDENCE_BELOW_ZONE_FLOOR",
            Self::ResizedToFit => "RESIZED_TO_FIT",
            Self::MrFadeBoost => "MR_FADE_BOOST",
            Self::ManagementBypass => "MANAGEMENT_BYPASS",
        };
        write!(f, "{tag}")
    }
}

/// The gate's verdict on one signal.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Accept {
        /// Possibly reduced (or fade-boosted) quantity, lot-aligned.
        quantity: u32,
        /// Why the quantity differs from the request, when it does.
        reason: Option<GateReason>,
    },
    Reject(GateReason),
}

impl GateDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept { .. })
    }
}

/// Everything the gate evaluates a signal against. Assembled fresh each
/// cycle by the orchestrator.
pub struct GateContext<'a> {
    pub positions: &'a [Position],
    pub meta: &'a SymbolMeta,
    /// Session capital for percentage limits.
    pub capital: f64,
    /// Today's realized plus unrealized PnL.
    pub daily_pnl: f64,
    pub regime: RegimeSnapshot,
    pub now: DateTime<Utc>,
    /// Per-position kind lookup for exposure sums.
    pub position_kinds: &'a dyn Fn(&str) -> InstrumentKind,
}

/// Stateless evaluator configured from the frozen engine config.
pub struct PortfolioGate {
    per_trade_risk_frac: f64,
    per_position_option_frac: f64,
    per_position_equity_frac: f64,
    options_exposure_frac: f64,
    total_exposure_frac: f64,
    total_exposure_soft_frac: f64,
    daily_loss_brake_frac: f64,
}

impl PortfolioGate {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            per_trade_risk_frac: config.per_trade_risk_pct / 100.0,
            per_position_option_frac: config.per_position_option_pct / 100.0,
            per_position_equity_frac: config.per_position_equity_pct / 100.0,
            options_exposure_frac: config.options_exposure_cap_pct / 100.0,
            total_exposure_frac: config.total_exposure_cap_pct / 100.0,
            total_exposure_soft_frac: config.total_exposure_soft_pct / 100.0,
            daily_loss_brake_frac: config.daily_loss_brake_pct / 100.0,
        }
    }

    /// Evaluate one signal. Management and closing signals pass untouched.
    pub fn evaluate(&self, signal: &Signal, ctx: &GateContext<'_>) -> GateDecision {
        if signal.bypasses_filters() {
            return GateDecision::Accept {
                quantity: signal.quantity,
                reason: Some(GateReason::ManagementBypass),
            };
        }

        // --- 1. Basic validity ------------------------------------------------
        if signal.validate_levels().is_err() {
            return GateDecision::Reject(GateReason::InvalidLevels);
        }
        let requested = ctx.meta.round_to_lot(signal.quantity);
        if requested == 0 {
            return GateDecision::Reject(GateReason::LotRoundedToZero);
        }
        if !session::within_entry_window(ctx.now) {
            return GateDecision::Reject(GateReason::AfterHours);
        }

        // --- 2. Duplicate position --------------------------------------------
        let duplicate = ctx.positions.iter().any(|p| {
            p.symbol == signal.symbol && p.side.entry_action() == signal.action
        });
        if duplicate {
            return GateDecision::Reject(GateReason::DuplicatePosition);
        }

        // --- 3. Regime alignment ----------------------------------------------
        if !ctx.regime.allows_entry(signal.action) {
            return GateDecision::Reject(GateReason::RegimeConflict);
        }

        // --- 9a. Move-zone confidence floor for chase-side entries ------------
        // Checked before sizing so a blocked chase never consumes exposure.
        if ctx.regime.is_chase(signal.action) {
            if let Some(floor) = ctx.regime.chase_confidence_floor() {
                if signal.confidence < floor {
                    debug!(
                        symbol = %signal.symbol,
                        confidence = signal.confidence,
                        floor,
                        zone = %ctx.regime.move_zone,
                        "chase entry below zone confidence floor"
                    );
                    return GateDecision::Reject(GateReason::ConfidenceBelowZoneFloor);
                }
            }
        }

        // --- 9b. Fade boost (before caps, which always win) -------------------
        let is_fade = !ctx.regime.is_chase(signal.action);
        let mut quantity = requested;
        let mut resize_reason: Option<GateReason> = None;
        if is_fade {
            let boost = ctx.regime.fade_boost();
            if boost > 1.0 {
                let boosted = ctx
                    .meta
                    .round_to_lot((requested as f64 * boost).floor() as u32);
                if boosted > quantity {
                    quantity = boosted;
                    resize_reason = Some(GateReason::MrFadeBoost);
                }
            }
        }

        // --- 8. Daily loss brake (entries only) -------------------------------
        if ctx.daily_pnl <= -self.daily_loss_brake_frac * ctx.capital {
            warn!(
                daily_pnl = format!("{:.0}", ctx.daily_pnl),
                capital = format!("{:.0}", ctx.capital),
                "daily loss brake engaged — rejecting new entries"
            );
            return GateDecision::Reject(GateReason::DailyLossBrake);
        }

        // --- 4..7. Sizing caps, tightest wins ---------------------------------
        let price = signal.entry_price;
        let stop_distance = (signal.entry_price - signal.stop_loss).abs();
        let is_option = ctx.meta.kind.is_option();

        // Per-trade risk cap.
        let risk_cap_qty = if stop_distance > 0.0 {
            (self.per_trade_risk_frac * ctx.capital / stop_distance).floor() as u64
        } else {
            0
        };

        // Single-position notional cap.
        let per_position_frac = if is_option {
            self.per_position_option_frac
        } else {
            self.per_position_equity_frac
        };
        let position_cap_qty = (per_position_frac * ctx.capital / price).floor() as u64;

        // Options exposure headroom.
        let existing_options: f64 = ctx
            .positions
            .iter()
            .filter(|p| (ctx.position_kinds)(&p.symbol).is_option())
            .map(Position::notional)
            .sum();
        let options_cap_qty = if is_option {
            let headroom = self.options_exposure_frac * ctx.capital - existing_options;
            if headroom <= 0.0 {
                0
            } else {
                (headroom / price).floor() as u64
            }
        } else {
            u64::MAX
        };

        // Total exposure headroom.
        let existing_total: f64 = ctx.positions.iter().map(Position::notional).sum();
        let total_headroom = self.total_exposure_frac * ctx.capital - existing_total;
        let total_cap_qty = if total_headroom <= 0.0 {
            0
        } else {
            (total_headroom / price).floor() as u64
        };

        // Soft warning when the *requested* exposure would have crossed the
        // soft line even though the hard cap clamps it.
        let requested_total = existing_total + price * quantity as f64;
        if requested_total > self.total_exposure_soft_frac * ctx.capital {
            warn!(
                symbol = %signal.symbol,
                requested_total = format!("{requested_total:.0}"),
                soft_cap = format!("{:.0}", self.total_exposure_soft_frac * ctx.capital),
                "requested exposure crossed the soft warning line"
            );
        }

        let caps = [
            (risk_cap_qty, GateReason::PerTradeRiskLimit),
            (position_cap_qty, GateReason::PerPositionLimit),
            (options_cap_qty, GateReason::OptionsExposureLimit),
            (total_cap_qty, GateReason::TotalExposureLimit),
        ];

        for (cap, reason) in caps {
            if (quantity as u64) > cap {
                let fitted = ctx.meta.round_to_lot(cap.min(u32::MAX as u64) as u32);
                if fitted == 0 {
                    return GateDecision::Reject(reason);
                }
                quantity = fitted;
                // A cap clamp overrides the boost tag: the final size is
                // cap-driven, not boost-driven.
                resize_reason = Some(GateReason::ResizedToFit);
            }
        }

        let reason = match resize_reason {
            // A clamp is reported even when it lands back on the requested
            // size (boost granted, then taken away by a cap).
            Some(GateReason::ResizedToFit) => Some(GateReason::ResizedToFit),
            other if quantity != requested => other,
            _ => None,
        };
        GateDecision::Accept { quantity, reason }
    }
}

impl std::fmt::Debug for PortfolioGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortfolioGate")
            .field("per_trade_risk_frac", &self.per_trade_risk_frac)
            .field("options_exposure_frac", &self.options_exposure_frac)
            .field("total_exposure_frac", &self.total_exposure_frac)
            .finish()
    }
}
