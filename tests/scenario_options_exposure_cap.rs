//! Options exposure cap: with ~50% of capital already in option premium, a
//! third entry that would push the options book to 92% is rejected before
//! any broker call is made.

mod common;

use chrono::Utc;
use common::Rig;
use vajra_bot::portfolio::{GateContext, GateDecision, GateReason, Position};
use vajra_bot::types::{InstrumentKind, PositionSide, TradeAction};

fn option_position(symbol: &str, quantity: u32, premium: f64) -> Position {
    Position {
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        quantity,
        entry_price: premium,
        entry_time: Utc::now(),
        stop_loss: premium * 0.90,
        target: premium * 1.20,
        kind: InstrumentKind::StockOption,
        entry_order_id: "E".to_string(),
        sl_order_id: Some("S".to_string()),
        target_order_id: Some("T".to_string()),
        partial_booked: false,
        max_favorable_excursion: premium,
        strategy_id: "options_scalper".to_string(),
        tag: "options_scalper:x".to_string(),
        unprotected: false,
        sl_mod_attempts: 0,
        sl_mod_stuck: false,
    }
}

#[tokio::test]
async fn third_options_entry_rejected_with_no_broker_call() {
    let capital = 46_000.0;
    let rig = Rig::with_capital(capital);

    for symbol in ["INFY25AUG1600CE", "BHARTIARTL25AUG1550CE", "MUTHOOTFIN25AUG1800CE"] {
        rig.register_option(symbol, InstrumentKind::StockOption, 1);
    }

    // Existing book: 5,600 (12%) + 17,361 (38%) of option notionals.
    let positions = vec![
        option_position("INFY25AUG1600CE", 8, 700.0),
        option_position("BHARTIARTL25AUG1550CE", 11, 1_578.27),
    ];
    for position in &positions {
        rig.tracker.add(position.clone());
    }

    // Candidate: 11 x 1773.7 = 19,511 notional; projected options book 92%.
    let mut candidate = rig.entry_signal(
        "MUTHOOTFIN25AUG1800CE",
        TradeAction::Buy,
        1_773.7,
        1_720.0,
        1_870.0,
        11,
        9.0,
    );
    candidate.strategy_id = "options_scalper".to_string();

    let meta = rig.cache.meta("MUTHOOTFIN25AUG1800CE").unwrap();
    let kinds = |symbol: &str| {
        rig.cache
            .meta(symbol)
            .map(|m| m.kind)
            .unwrap_or(InstrumentKind::Equity)
    };
    let ctx = GateContext {
        positions: &positions,
        meta: &meta,
        capital,
        daily_pnl: 0.0,
        regime: Default::default(),
        now: rig.trading_hours(),
        position_kinds: &kinds,
    };

    let decision = rig.gate.evaluate(&candidate, &ctx);
    assert_eq!(
        decision,
        GateDecision::Reject(GateReason::OptionsExposureLimit)
    );

    // The rejection happened before the execution path: zero broker calls.
    assert!(rig.broker.calls().is_empty());
}

#[tokio::test]
async fn equity_entry_unaffected_by_options_book() {
    let capital = 46_000.0;
    let rig = Rig::with_capital(capital);
    rig.register_option("INFY25AUG1600CE", InstrumentKind::StockOption, 1);
    rig.register_equity("RELIANCE");

    let positions = vec![option_position("INFY25AUG1600CE", 8, 700.0)];

    // A small equity entry only faces the equity per-position cap.
    let candidate = rig.entry_signal("RELIANCE", TradeAction::Buy, 100.0, 99.0, 102.0, 9, 8.0);

    let meta = rig.cache.meta("RELIANCE").unwrap();
    let kinds = |symbol: &str| {
        rig.cache
            .meta(symbol)
            .map(|m| m.kind)
            .unwrap_or(InstrumentKind::Equity)
    };
    let ctx = GateContext {
        positions: &positions,
        meta: &meta,
        capital,
        daily_pnl: 0.0,
        regime: Default::default(),
        now: rig.trading_hours(),
        position_kinds: &kinds,
    };

    let decision = rig.gate.evaluate(&candidate, &ctx);
    assert!(matches!(decision, GateDecision::Accept { quantity: 9, .. }));
}
