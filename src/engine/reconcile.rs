// =============================================================================
// Reconciliation loop — broker truth wins
// =============================================================================
//
// Every `reconcile_period` (default 30 s):
//
//   1. Observe protective-order fills: a completed SL or target order is
//      applied to the tracker as an exit fill, its sibling is cancelled so a
//      dead order cannot double-fill, and the strategy's win/loss window is
//      updated.
//   2. Pull broker positions and let the tracker reconcile; divergences
//      ("phantom positions", quantity drift) surface as telemetry only.
//
// Reconciliation never creates protective orders on its own.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::portfolio::{FillEvent, PositionTracker};
use crate::signals::SignalDeduplicator;
use crate::types::OrderStatus;

pub struct Reconciler {
    broker: Arc<dyn BrokerClient>,
    tracker: Arc<PositionTracker>,
    dedup: Arc<SignalDeduplicator>,
    period: Duration,
    passes: AtomicU64,
    divergences_seen: AtomicU64,
}

impl Reconciler {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        tracker: Arc<PositionTracker>,
        dedup: Arc<SignalDeduplicator>,
        period: Duration,
    ) -> Self {
        Self {
            broker,
            tracker,
            dedup,
            period,
            passes: AtomicU64::new(0),
            divergences_seen: AtomicU64::new(0),
        }
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn divergences_seen(&self) -> u64 {
        self.divergences_seen.load(Ordering::Relaxed)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(period_ms = self.period.as_millis() as u64, "reconciler started");
        let mut ticker = tokio::time::interval(self.period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile_once().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("reconciler stopped");
    }

    /// One full pass (public for the scenario tests).
    pub async fn reconcile_once(&self) {
        self.observe_protective_fills().await;

        match self.broker.positions().await {
            Ok(broker_positions) => {
                let divergences = self.tracker.reconcile(&broker_positions);
                if !divergences.is_empty() {
                    self.divergences_seen
                        .fetch_add(divergences.len() as u64, Ordering::Relaxed);
                    warn!(count = divergences.len(), "reconciliation divergences");
                }
            }
            Err(e) => {
                warn!(error = %e, "reconciliation positions fetch failed");
            }
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    /// Apply completed SL / target fills to the tracker and cancel the
    /// sibling protective order.
    async fn observe_protective_fills(&self) {
        let orders = match self.broker.orders().await {
            Ok(orders) => orders,
            Err(e) => {
                debug!(error = %e, "orders fetch failed during reconcile");
                return;
            }
        };

        for position in self.tracker.snapshot() {
            let protective = [
                (position.sl_order_id.clone(), position.target_order_id.clone()),
                (position.target_order_id.clone(), position.sl_order_id.clone()),
            ];
            for (own_id, sibling_id) in protective {
                let Some(own_id) = own_id else { continue };
                let Some(order) = orders.iter().find(|o| o.order_id == own_id) else {
                    continue;
                };
                if order.status != OrderStatus::Complete {
                    continue;
                }

                let price = order.average_price.or(order.price).unwrap_or(0.0);
                info!(
                    symbol = %position.symbol,
                    order_id = %own_id,
                    price,
                    "protective order filled — applying exit"
                );

                let pnl = position.unrealized_at(price);
                self.tracker.update(&FillEvent {
                    order_id: own_id,
                    symbol: position.symbol.clone(),
                    action: position.side.exit_action(),
                    quantity: order.filled_quantity.max(order.quantity),
                    price,
                });
                self.dedup.record_outcome(&position.strategy_id, pnl > 0.0);

                if let Some(sibling) = sibling_id {
                    if let Err(e) = self.broker.cancel_order(&sibling).await {
                        debug!(order_id = %sibling, error = %e, "sibling cancel skipped");
                    }
                }
                break;
            }
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("period", &self.period)
            .field("passes", &self.passes())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{PaperBroker, OrderParams};
    use crate::portfolio::Position;
    use crate::store::MemoryKvStore;
    use crate::types::{
        InstrumentKind, OrderType, PositionSide, ProductType, TradeAction, Validity,
    };
    use chrono::Utc;

    fn dedup() -> Arc<SignalDeduplicator> {
        Arc::new(SignalDeduplicator::new(
            Arc::new(MemoryKvStore::new()),
            0.6,
            &["momentum".to_string()],
            Duration::from_secs(86_400),
        ))
    }

    async fn place_protective(
        broker: &PaperBroker,
        symbol: &str,
        order_type: OrderType,
        client_id: &str,
    ) -> String {
        broker
            .place_order(&OrderParams {
                symbol: symbol.to_string(),
                exchange: "NSE".to_string(),
                transaction_type: TradeAction::Sell,
                order_type,
                quantity: 10,
                product: ProductType::Mis,
                validity: Validity::Day,
                price: Some(2550.0),
                trigger_price: Some(2475.0),
                tag: format!("momentum:abc:{client_id}"),
                client_order_id: client_id.to_string(),
            })
            .await
            .unwrap()
    }

    fn position(symbol: &str, sl: &str, tgt: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            quantity: 10,
            entry_price: 2500.0,
            entry_time: Utc::now(),
            stop_loss: 2475.0,
            target: 2550.0,
            kind: InstrumentKind::Equity,
            entry_order_id: "E1".to_string(),
            sl_order_id: Some(sl.to_string()),
            target_order_id: Some(tgt.to_string()),
            partial_booked: false,
            max_favorable_excursion: 2500.0,
            strategy_id: "momentum".to_string(),
            tag: "momentum:abc".to_string(),
            unprotected: false,
            sl_mod_attempts: 0,
            sl_mod_stuck: false,
        }
    }

    #[tokio::test]
    async fn target_fill_cancels_stop_and_removes_position() {
        let broker = Arc::new(PaperBroker::new());
        let sl_id = place_protective(&broker, "RELIANCE", OrderType::StopLossMarket, "sl").await;
        let tgt_id = place_protective(&broker, "RELIANCE", OrderType::Limit, "tgt").await;

        let tracker = Arc::new(PositionTracker::new());
        tracker.add(position("RELIANCE", &sl_id, &tgt_id));

        // Target fills at the broker.
        broker.fill_order(&tgt_id, 2550.0);

        let reconciler = Reconciler::new(broker.clone(), tracker.clone(), dedup(), Duration::from_secs(30));
        reconciler.reconcile_once().await;

        assert!(tracker.get("RELIANCE").is_none());
        assert_eq!(
            broker.order(&sl_id).unwrap().status,
            OrderStatus::Cancelled
        );
        assert!((tracker.realized_today() - 500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn phantom_position_is_flagged_not_adopted() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_ltp("TCS", 3500.0);
        // Create a broker-side fill the tracker has never seen.
        broker
            .place_order(&OrderParams {
                symbol: "TCS".to_string(),
                exchange: "NSE".to_string(),
                transaction_type: TradeAction::Buy,
                order_type: OrderType::Market,
                quantity: 5,
                product: ProductType::Mis,
                validity: Validity::Day,
                price: None,
                trigger_price: None,
                tag: "manual".to_string(),
                client_order_id: "manual-1".to_string(),
            })
            .await
            .unwrap();

        let tracker = Arc::new(PositionTracker::new());
        let reconciler = Reconciler::new(broker, tracker.clone(), dedup(), Duration::from_secs(30));
        reconciler.reconcile_once().await;

        assert!(tracker.get("TCS").is_none());
        assert_eq!(reconciler.divergences_seen(), 1);
        assert_eq!(reconciler.passes(), 1);
    }
}
