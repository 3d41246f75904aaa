//! Partial profit booking: the first target touch books half at market and
//! raises the stop to entry + 0.3 x profit; the second touch flattens the
//! remainder and the tracker forgets the symbol.

mod common;

use common::Rig;
use vajra_bot::broker::BrokerClient;
use vajra_bot::types::{OrderStatus, OrderType, TradeAction};

const SYMBOL: &str = "NIFTY-I";

async fn open_long(rig: &Rig) {
    rig.tick(SYMBOL, 20_000.0);
    let signal = rig.entry_signal(
        SYMBOL,
        TradeAction::Buy,
        20_000.0,
        19_900.0,
        20_200.0,
        50,
        8.2,
    );
    let outcome = rig.engine.submit_batch(vec![signal]).await;
    assert_eq!(outcome.submitted, 1);
}

#[tokio::test]
async fn first_touch_books_half_second_touch_flattens() {
    let rig = Rig::new();
    rig.register_equity(SYMBOL);
    open_long(&rig).await;

    let sl_id = rig.tracker.get(SYMBOL).unwrap().sl_order_id.unwrap();

    // --- First target touch -------------------------------------------------
    rig.tick(SYMBOL, 20_200.0);
    rig.monitor.scan(rig.trading_hours()).await;

    let position = rig.tracker.get(SYMBOL).expect("remainder stays open");
    assert!(position.partial_booked);
    assert_eq!(position.quantity, 25);
    // Stop raised to entry + 0.3 * (20200 - 20000) = 20060.
    assert!((position.stop_loss - 20_060.0).abs() < 1e-9);

    // The resting stop order mirrors the new level and remaining quantity.
    let sl = rig.broker.order(&sl_id).unwrap();
    assert_eq!(sl.trigger_price, Some(20_060.0));
    assert_eq!(sl.quantity, 25);

    // Exactly one market sell of 25 went out.
    let market_sells: Vec<_> = rig
        .broker
        .orders()
        .await
        .unwrap()
        .into_iter()
        .filter(|o| {
            o.order_type == OrderType::Market
                && o.side == TradeAction::Sell
                && o.status == OrderStatus::Complete
        })
        .collect();
    assert_eq!(market_sells.len(), 1);
    assert_eq!(market_sells[0].quantity, 25);

    // Realized PnL from the booked half: 25 * 200.
    assert!((rig.tracker.realized_today() - 5_000.0).abs() < 1e-9);

    // --- Second target touch ------------------------------------------------
    rig.tick(SYMBOL, 20_200.0);
    rig.monitor.scan(rig.trading_hours()).await;

    assert!(rig.tracker.get(SYMBOL).is_none(), "tracker forgets the symbol");

    let market_sells: Vec<_> = rig
        .broker
        .orders()
        .await
        .unwrap()
        .into_iter()
        .filter(|o| {
            o.order_type == OrderType::Market
                && o.side == TradeAction::Sell
                && o.status == OrderStatus::Complete
        })
        .collect();
    assert_eq!(market_sells.len(), 2);
    assert_eq!(market_sells[1].quantity, 25);

    // Full round trip banked 50 * 200.
    assert!((rig.tracker.realized_today() - 10_000.0).abs() < 1e-9);
}

#[tokio::test]
async fn odd_lot_that_cannot_split_exits_whole() {
    let rig = Rig::new();
    // Lot size 50 cannot book half of a single lot.
    rig.register_option(SYMBOL, vajra_bot::types::InstrumentKind::IndexOption, 50);
    rig.tick(SYMBOL, 20_000.0);

    let signal = rig.entry_signal(
        SYMBOL,
        TradeAction::Buy,
        20_000.0,
        19_900.0,
        20_200.0,
        50,
        8.2,
    );
    rig.engine.submit_batch(vec![signal]).await;

    rig.tick(SYMBOL, 20_200.0);
    rig.monitor.scan(rig.trading_hours()).await;

    // Half of one lot rounds to zero, so the touch closes the position
    // outright instead of leaving an unsplittable remainder.
    assert!(rig.tracker.get(SYMBOL).is_none());
}
