//! Unprotected-position handling: when a protective leg fails after the
//! entry filled, the engine marks the position unprotected and the next
//! monitor pass flattens it as an emergency candidate.

mod common;

use common::Rig;
use vajra_bot::broker::paper::Op;
use vajra_bot::broker::BrokerError;
use vajra_bot::types::TradeAction;

#[tokio::test]
async fn unprotected_position_is_flattened_next_pass() {
    let rig = Rig::new();
    rig.register_equity("RELIANCE");
    rig.tick("RELIANCE", 2_500.0);

    // Entry passes; the SL leg is rejected by the broker.
    rig.broker.pass_next(Op::Place);
    rig.broker.fail_next(
        Op::Place,
        BrokerError::Reject {
            code: "RMS-02".to_string(),
            message: "trigger outside execution range".to_string(),
        },
    );

    let signal = rig.entry_signal(
        "RELIANCE",
        TradeAction::Buy,
        2_500.0,
        2_475.0,
        2_550.0,
        10,
        8.0,
    );
    let outcome = rig.engine.submit_batch(vec![signal]).await;
    assert_eq!(outcome.submitted, 1);

    let position = rig.tracker.get("RELIANCE").unwrap();
    assert!(position.unprotected);
    assert!(position.sl_order_id.is_none());

    // The monitor treats it as an emergency candidate and closes it.
    rig.monitor.scan(rig.trading_hours()).await;
    assert!(rig.tracker.get("RELIANCE").is_none());
}

#[tokio::test]
async fn emergency_account_loss_flattens_everything() {
    let rig = Rig::with_capital(100_000.0);
    rig.register_equity("RELIANCE");
    rig.tick("RELIANCE", 2_500.0);

    let signal = rig.entry_signal(
        "RELIANCE",
        TradeAction::Buy,
        2_500.0,
        2_300.0,
        2_900.0,
        20,
        8.0,
    );
    rig.engine.submit_batch(vec![signal]).await;

    // Price collapses: unrealized = 20 * (2330 - 2500) = -3,400, beyond the
    // -3% emergency line on 100k capital.
    rig.tick("RELIANCE", 2_330.0);
    rig.monitor.scan(rig.trading_hours()).await;

    assert!(rig.tracker.snapshot().is_empty());
    assert!((rig.tracker.realized_today() + 3_400.0).abs() < 1e-9);
}
