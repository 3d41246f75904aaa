//! Dedup bypass for management signals: scale-outs and closures must never
//! be blocked by same-day idempotency, the quality filter, or symbol-level
//! dedup — even when an execution record for the same (symbol, action)
//! already exists.

mod common;

use chrono::{NaiveDate, Utc};
use common::Rig;
use vajra_bot::regime::RegimeSnapshot;
use vajra_bot::signals::Signal;
use vajra_bot::types::TradeAction;

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()
}

#[tokio::test]
async fn management_signals_survive_dedup_and_reach_the_broker() {
    let rig = Rig::new();
    rig.register_equity("RELIANCE");
    rig.tick("RELIANCE", 2_500.0);

    // A RELIANCE BUY executed earlier today.
    let executed = rig.entry_signal(
        "RELIANCE",
        TradeAction::Buy,
        2_500.0,
        2_475.0,
        2_550.0,
        15,
        8.0,
    );
    rig.dedup.mark_executed(today(), &executed, "ORDER-1").await;

    // Give the tracker something to scale out of.
    rig.engine.submit_batch(vec![executed]).await;
    let tag = rig.tracker.get("RELIANCE").unwrap().tag;

    // Two same-symbol scale-outs a minute apart, same cycle.
    let scale_1 = Signal::management(
        "RELIANCE",
        TradeAction::Sell,
        2_520.0,
        7,
        "microstructure",
        tag.clone(),
        false,
        Utc::now(),
    );
    let scale_2 = Signal::management(
        "RELIANCE",
        TradeAction::Sell,
        2_520.0,
        8,
        "microstructure",
        tag,
        false,
        Utc::now(),
    );

    let outcome = rig
        .dedup
        .filter(
            today(),
            vec![scale_1, scale_2],
            &rig.cache,
            RegimeSnapshot::default(),
        )
        .await;

    // Both survive every stage.
    assert_eq!(outcome.passed.len(), 2);
    assert!(outcome.dropped.is_empty());

    // And both reach the broker through the engine.
    let submitted = rig.engine.submit_batch(outcome.passed).await;
    assert_eq!(submitted.submitted, 2);
    assert!(rig.tracker.get("RELIANCE").is_none(), "15 - 7 - 8 = 0 closes out");
}

#[tokio::test]
async fn entry_replay_is_still_blocked_while_management_passes() {
    let rig = Rig::new();
    rig.register_equity("RELIANCE");
    rig.tick("RELIANCE", 2_500.0);

    let executed = rig.entry_signal(
        "RELIANCE",
        TradeAction::Buy,
        2_500.0,
        2_475.0,
        2_550.0,
        15,
        8.0,
    );
    rig.dedup.mark_executed(today(), &executed, "ORDER-1").await;

    let replay = rig.entry_signal(
        "RELIANCE",
        TradeAction::Buy,
        2_501.0,
        2_476.0,
        2_551.0,
        15,
        9.0,
    );
    let management = Signal::management(
        "RELIANCE",
        TradeAction::Buy,
        2_500.0,
        5,
        "microstructure",
        "momentum:abc",
        false,
        Utc::now(),
    );

    let outcome = rig
        .dedup
        .filter(
            today(),
            vec![replay, management],
            &rig.cache,
            RegimeSnapshot::default(),
        )
        .await;

    assert_eq!(outcome.passed.len(), 1);
    assert!(outcome.passed[0].management_action);
    assert_eq!(outcome.dropped.len(), 1);
    assert_eq!(
        outcome.dropped[0].1,
        vajra_bot::signals::DropReason::DuplicateToday
    );
}
