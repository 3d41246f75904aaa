// =============================================================================
// Strategy toolkit — shared sizing, target, and exit-management rules
// =============================================================================
//
// Free functions composed by every strategy:
//
//   - quantity sizing targets a per-trade capital risk of 0.8–1.0%
//   - targets use a regime-dependent reward:risk of 1.8 / 2.0 / 2.5
//   - trailing locks 50% of profit once unrealized profit reaches +10%
//   - partial booking raises the stop to entry + 0.3 x profit
// =============================================================================

use crate::regime::RegimeSnapshot;
use crate::types::{PositionSide, SymbolMeta, TradeAction};

/// Target per-trade capital risk band.
pub const RISK_FRAC_LOW: f64 = 0.008;
pub const RISK_FRAC_HIGH: f64 = 0.010;

/// Unrealized profit fraction that arms the trailing stop.
pub const TRAIL_ARM_FRAC: f64 = 0.10;
/// Share of open profit the trail locks.
pub const TRAIL_LOCK_FRAC: f64 = 0.5;
/// Share of open profit the post-partial stop locks.
pub const PARTIAL_LOCK_FRAC: f64 = 0.3;

/// Size a position so the stop distance risks 0.8–1.0% of capital (midpoint
/// used), rounded down to whole lots. Returns 0 when the stop distance or
/// capital cannot support one lot.
pub fn risk_based_quantity(capital: f64, entry: f64, stop: f64, meta: &SymbolMeta) -> u32 {
    let stop_distance = (entry - stop).abs();
    if stop_distance <= 0.0 || capital <= 0.0 || entry <= 0.0 {
        return 0;
    }
    let risk_amount = capital * (RISK_FRAC_LOW + RISK_FRAC_HIGH) / 2.0;
    let raw = (risk_amount / stop_distance).floor();
    if raw <= 0.0 || raw > u32::MAX as f64 {
        return 0;
    }
    meta.round_to_lot(raw as u32)
}

/// Reward:risk by regime strength: ranging 1.8, moderate 2.0, trending 2.5.
pub fn reward_risk_for(regime: &RegimeSnapshot) -> f64 {
    if regime.strength >= 6.0 {
        2.5
    } else if regime.strength >= 3.0 {
        2.0
    } else {
        1.8
    }
}

/// Project the target from entry, stop, and the R:R multiple, rounded to the
/// symbol's tick.
pub fn target_from(entry: f64, stop: f64, action: TradeAction, rr: f64, meta: &SymbolMeta) -> f64 {
    let risk = (entry - stop).abs();
    let raw = match action {
        TradeAction::Buy => entry + risk * rr,
        TradeAction::Sell => entry - risk * rr,
    };
    meta.round_to_tick(raw)
}

/// Trailing stop once armed: lock half the open profit, direction-aware.
/// Returns `None` while unrealized profit is below the arming threshold.
pub fn trail_stop(entry: f64, current: f64, side: PositionSide) -> Option<f64> {
    if entry <= 0.0 {
        return None;
    }
    let profit_frac = side.direction() * (current - entry) / entry;
    if profit_frac < TRAIL_ARM_FRAC {
        return None;
    }
    Some(entry + TRAIL_LOCK_FRAC * (current - entry))
}

/// Stop level installed after the first partial booking: lock 30% of the
/// profit that triggered the booking.
pub fn partial_booking_stop(entry: f64, current: f64, _side: PositionSide) -> f64 {
    entry + PARTIAL_LOCK_FRAC * (current - entry)
}

/// True when `candidate` strictly improves `current_stop` for the side
/// (higher for longs, lower for shorts). Trailing must never loosen a stop.
pub fn improves_stop(current_stop: f64, candidate: f64, side: PositionSide) -> bool {
    match side {
        PositionSide::Long => candidate > current_stop,
        PositionSide::Short => candidate < current_stop,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::RegimeSnapshot;
    use crate::types::InstrumentKind;

    #[test]
    fn sizing_targets_risk_band() {
        let meta = SymbolMeta::equity("RELIANCE");
        // 0.9% of 500k = 4500 risk; stop distance 25 => 180 shares.
        let qty = risk_based_quantity(500_000.0, 2500.0, 2475.0, &meta);
        assert_eq!(qty, 180);

        let realised_risk = qty as f64 * 25.0;
        assert!(realised_risk >= 500_000.0 * RISK_FRAC_LOW * 0.95);
        assert!(realised_risk <= 500_000.0 * RISK_FRAC_HIGH);
    }

    #[test]
    fn sizing_respects_lots() {
        let meta = SymbolMeta::option("NIFTY25AUG22500CE", InstrumentKind::IndexOption, 25);
        let qty = risk_based_quantity(500_000.0, 150.0, 120.0, &meta);
        // 4500 / 30 = 150 => exactly 6 lots.
        assert_eq!(qty, 150);
        assert_eq!(qty % 25, 0);
    }

    #[test]
    fn sizing_zero_for_degenerate_stops() {
        let meta = SymbolMeta::equity("RELIANCE");
        assert_eq!(risk_based_quantity(500_000.0, 2500.0, 2500.0, &meta), 0);
        assert_eq!(risk_based_quantity(0.0, 2500.0, 2475.0, &meta), 0);
    }

    #[test]
    fn reward_risk_bands() {
        let mut regime = RegimeSnapshot::default();
        regime.strength = 1.0;
        assert!((reward_risk_for(&regime) - 1.8).abs() < 1e-12);
        regime.strength = 4.0;
        assert!((reward_risk_for(&regime) - 2.0).abs() < 1e-12);
        regime.strength = 7.5;
        assert!((reward_risk_for(&regime) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn target_projection_both_sides() {
        let meta = SymbolMeta::equity("RELIANCE");
        let buy = target_from(100.0, 99.0, TradeAction::Buy, 2.0, &meta);
        assert!((buy - 102.0).abs() < 1e-9);
        let sell = target_from(100.0, 101.0, TradeAction::Sell, 2.0, &meta);
        assert!((sell - 98.0).abs() < 1e-9);
    }

    #[test]
    fn trail_arms_at_ten_percent() {
        assert!(trail_stop(20_000.0, 21_000.0, PositionSide::Long).is_none());
        // +10%: lock half of the 2000-point profit.
        let trail = trail_stop(20_000.0, 22_000.0, PositionSide::Long).unwrap();
        assert!((trail - 21_000.0).abs() < 1e-9);
    }

    #[test]
    fn trail_symmetric_for_shorts() {
        let trail = trail_stop(20_000.0, 18_000.0, PositionSide::Short).unwrap();
        assert!((trail - 19_000.0).abs() < 1e-9);
        assert!(trail_stop(20_000.0, 19_000.0, PositionSide::Short).is_none());
    }

    #[test]
    fn partial_stop_locks_thirty_percent() {
        // entry 20000, target touch 20200 => stop 20060.
        let stop = partial_booking_stop(20_000.0, 20_200.0, PositionSide::Long);
        assert!((stop - 20_060.0).abs() < 1e-9);
    }

    #[test]
    fn stop_improvement_is_directional() {
        assert!(improves_stop(19_900.0, 21_000.0, PositionSide::Long));
        assert!(!improves_stop(21_000.0, 20_500.0, PositionSide::Long));
        assert!(improves_stop(20_100.0, 19_500.0, PositionSide::Short));
        assert!(!improves_stop(19_500.0, 19_800.0, PositionSide::Short));
    }
}
