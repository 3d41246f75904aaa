//! Property tests over the risk-bearing invariants:
//!
//! - exposure caps hold for every accepted signal, whatever the existing book
//! - signal level orderings and minimum spreads hold whenever validation passes
//! - trailing stops are monotone over any rising price path

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use vajra_bot::config::EngineConfig;
use vajra_bot::portfolio::{GateContext, GateDecision, PortfolioGate, Position};
use vajra_bot::regime::RegimeSnapshot;
use vajra_bot::session;
use vajra_bot::signals::{Signal, MIN_STOP_FRAC, MIN_TARGET_FRAC};
use vajra_bot::strategy::toolkit;
use vajra_bot::types::{InstrumentKind, PositionSide, SymbolMeta, TradeAction};

const CAPITAL: f64 = 500_000.0;

fn kind_of(symbol: &str) -> InstrumentKind {
    if symbol.starts_with("OPT") {
        InstrumentKind::StockOption
    } else {
        InstrumentKind::Equity
    }
}

fn position(symbol: String, quantity: u32, price: f64) -> Position {
    Position {
        kind: kind_of(&symbol),
        symbol,
        side: PositionSide::Long,
        quantity,
        entry_price: price,
        entry_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        stop_loss: price * 0.99,
        target: price * 1.02,
        entry_order_id: "E".to_string(),
        sl_order_id: Some("S".to_string()),
        target_order_id: Some("T".to_string()),
        partial_booked: false,
        max_favorable_excursion: price,
        strategy_id: "momentum".to_string(),
        tag: "t".to_string(),
        unprotected: false,
        sl_mod_attempts: 0,
        sl_mod_stuck: false,
    }
}

/// An arbitrary existing book: up to 4 positions, equity or option, with
/// notionals that may already sit anywhere relative to the caps.
fn book_strategy() -> impl Strategy<Value = Vec<Position>> {
    prop::collection::vec(
        (0usize..2, 1u32..400, 50.0f64..3000.0),
        0..4,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .enumerate()
            .map(|(i, (kind, qty, price))| {
                let symbol = if kind == 0 {
                    format!("EQ{i}")
                } else {
                    format!("OPT{i}")
                };
                position(symbol, qty, price)
            })
            .collect()
    })
}

proptest! {
    // For every accepted signal the projected totals respect the caps.
    #[test]
    fn exposure_caps_hold_for_accepted_signals(
        positions in book_strategy(),
        is_option in any::<bool>(),
        entry in 50.0f64..3000.0,
        stop_frac in 0.004f64..0.05,
        quantity in 1u32..500,
    ) {
        let config = EngineConfig::default();
        let gate = PortfolioGate::new(&config);

        let symbol = if is_option { "OPT_NEW" } else { "EQ_NEW" };
        let meta = if is_option {
            SymbolMeta::option(symbol, InstrumentKind::StockOption, 1)
        } else {
            SymbolMeta::equity(symbol)
        };

        let stop = entry * (1.0 - stop_frac);
        let target = entry * (1.0 + stop_frac * 2.0);
        let signal = Signal::entry(
            symbol,
            TradeAction::Buy,
            entry,
            stop,
            target,
            quantity,
            8.0,
            "momentum",
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        );

        let kinds = |s: &str| kind_of(s);
        let ctx = GateContext {
            positions: &positions,
            meta: &meta,
            capital: CAPITAL,
            daily_pnl: 0.0,
            regime: RegimeSnapshot::default(),
            now: session::ist_datetime(2025, 7, 1, 11, 0),
            position_kinds: &kinds,
        };

        if let GateDecision::Accept { quantity: accepted, .. } = gate.evaluate(&signal, &ctx) {
            prop_assert!(accepted > 0);
            prop_assert!(accepted <= quantity, "gate must never grow a non-fade entry");

            let added = entry * accepted as f64;
            let existing_total: f64 = positions.iter().map(Position::notional).sum();
            let projected_total = existing_total + added;
            prop_assert!(
                projected_total <= 0.70 * CAPITAL + 1e-6,
                "total exposure {projected_total} breaches the 70% cap"
            );

            if is_option {
                let existing_options: f64 = positions
                    .iter()
                    .filter(|p| kind_of(&p.symbol).is_option())
                    .map(Position::notional)
                    .sum();
                let projected_options = existing_options + added;
                prop_assert!(
                    projected_options <= 0.50 * CAPITAL + 1e-6,
                    "options exposure {projected_options} breaches the 50% cap"
                );
            }

            // Per-trade risk cap.
            let risk = (entry - stop) * accepted as f64;
            prop_assert!(risk <= 0.02 * CAPITAL + 1e-6);
        }
    }

    // Whenever level validation passes, the orderings and minimum spreads
    // hold.
    #[test]
    fn validated_levels_are_ordered_with_min_spreads(
        entry in 10.0f64..5000.0,
        stop_offset in -0.2f64..0.2,
        target_offset in -0.3f64..0.3,
        is_buy in any::<bool>(),
    ) {
        let action = if is_buy { TradeAction::Buy } else { TradeAction::Sell };
        let stop = entry * (1.0 + stop_offset);
        let target = entry * (1.0 + target_offset);
        let signal = Signal::entry(
            "RELIANCE",
            action,
            entry,
            stop,
            target,
            10,
            8.0,
            "momentum",
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        );

        if signal.validate_levels().is_ok() {
            match action {
                TradeAction::Buy => {
                    prop_assert!(stop < entry && entry < target);
                }
                TradeAction::Sell => {
                    prop_assert!(target < entry && entry < stop);
                }
            }
            prop_assert!((entry - stop).abs() / entry >= MIN_STOP_FRAC - 1e-12);
            prop_assert!((target - entry).abs() / entry >= MIN_TARGET_FRAC - 1e-12);
        }
    }

    // Along any rising path, a LONG position's effective stop is
    // non-decreasing under the trail-and-improve rule.
    #[test]
    fn trailing_is_monotone_on_rising_paths(
        entry in 100.0f64..10_000.0,
        steps in prop::collection::vec(0.0f64..0.05, 1..20),
    ) {
        let mut price = entry;
        let mut stop = entry * 0.99;
        let mut previous_stop = stop;

        for step in steps {
            price *= 1.0 + step;
            if let Some(trail) = toolkit::trail_stop(entry, price, PositionSide::Long) {
                if toolkit::improves_stop(stop, trail, PositionSide::Long) {
                    stop = trail;
                }
            }
            prop_assert!(
                stop >= previous_stop,
                "stop regressed from {previous_stop} to {stop}"
            );
            previous_stop = stop;
        }
    }
}
