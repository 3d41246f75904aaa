// =============================================================================
// TradeEngine — approved signals to broker orders with protective lineage
// =============================================================================
//
// Per accepted entry signal:
//   1. Order type: LIMIT with a ±0.5% collar for stock options, MARKET for
//      index options and equities.
//   2. A fresh uuid `client_order_id`; tag = `strategy_id:client_order_id`.
//   3. Entry submission, then fill confirmation (poll within the
//      confirmation window).
//   4. Paired protective orders: SL-M at the stop, LIMIT at the target,
//      same tag with `:SL` / `:TGT` sub-tags.
//   5. Atomic lineage recording into the tracker, the dedup execution
//      record, and the analytics sink.
//
// Throttling: at most `max_signals_per_cycle` submissions per tick, an
// inter-order delay inside a batch, and a 30 s per-(symbol, action)
// cooldown independent of dedup.
//
// A protective-order failure after the entry filled is critical: the
// position is marked unprotected and the monitor flattens it.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, BrokerError, OrderParams};
use crate::market_data::MarketDataCache;
use crate::portfolio::{FillEvent, Position, PositionTracker};
use crate::signals::{Signal, SignalDeduplicator};
use crate::store::{TradeRecord, TradeStore};
use crate::types::{
    InstrumentKind, OrderStatus, OrderType, ProductType, SymbolMeta, TradeAction, Validity,
};

/// Price collar applied to stock-option LIMIT entries.
const OPTION_LIMIT_COLLAR_FRAC: f64 = 0.005;
/// Poll cadence while confirming an entry fill.
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Submission statistics for one batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchOutcome {
    pub submitted: usize,
    pub dropped: usize,
}

pub struct TradeEngine {
    broker: Arc<dyn BrokerClient>,
    tracker: Arc<PositionTracker>,
    dedup: Arc<SignalDeduplicator>,
    trades: Arc<dyn TradeStore>,
    cache: Arc<MarketDataCache>,

    max_signals_per_cycle: usize,
    inter_order_delay: Duration,
    cooldown: Duration,
    fill_confirm_timeout: Duration,
    /// Wait before the single retry after `ErrRateLimited`.
    rate_limit_refill: Duration,

    cooldowns: Mutex<HashMap<(String, TradeAction), Instant>>,
    accepting: AtomicBool,
    in_flight: AtomicU64,
    user_id: String,
}

impl TradeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        tracker: Arc<PositionTracker>,
        dedup: Arc<SignalDeduplicator>,
        trades: Arc<dyn TradeStore>,
        cache: Arc<MarketDataCache>,
        config: &crate::config::EngineConfig,
        rate_limit_refill: Duration,
    ) -> Self {
        Self {
            broker,
            tracker,
            dedup,
            trades,
            cache,
            max_signals_per_cycle: config.max_signals_per_cycle,
            inter_order_delay: Duration::from_millis(config.inter_order_delay_ms),
            cooldown: Duration::from_millis(config.order_cooldown_ms),
            fill_confirm_timeout: Duration::from_millis(config.fill_confirm_timeout_ms),
            rate_limit_refill,
            cooldowns: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            in_flight: AtomicU64::new(0),
            user_id: "master".to_string(),
        }
    }

    /// Shutdown drain: refuse new work but let outstanding calls finish.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Batch entry
    // -------------------------------------------------------------------------

    /// Submit an approved batch, management signals first-come. Applies the
    /// per-cycle ceiling, inter-order delay, and per-(symbol, action)
    /// cooldown.
    pub async fn submit_batch(&self, signals: Vec<Signal>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        // Entries count against the per-cycle ceiling; bypass signals do not.
        let mut submitted_in_batch = 0usize;
        let mut any_submitted = false;

        for signal in signals {
            if !self.accepting.load(Ordering::SeqCst) {
                debug!(symbol = %signal.symbol, "engine draining — signal dropped");
                outcome.dropped += 1;
                continue;
            }
            // The ceiling and cooldown throttle entries only; management
            // and closing orders must never be held back by them.
            if !signal.bypasses_filters() {
                if submitted_in_batch >= self.max_signals_per_cycle {
                    debug!(symbol = %signal.symbol, "per-cycle submission ceiling reached");
                    outcome.dropped += 1;
                    continue;
                }
                if self.in_cooldown(&signal) {
                    debug!(symbol = %signal.symbol, action = %signal.action, "cooldown active — signal dropped");
                    outcome.dropped += 1;
                    continue;
                }
            }

            if any_submitted {
                tokio::time::sleep(self.inter_order_delay).await;
            }

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let result = if signal.bypasses_filters() {
                self.submit_management(&signal).await
            } else {
                self.submit_entry(&signal).await
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match result {
                Ok(()) => {
                    any_submitted = true;
                    if !signal.bypasses_filters() {
                        self.note_cooldown(&signal);
                        submitted_in_batch += 1;
                    }
                    outcome.submitted += 1;
                }
                Err(()) => outcome.dropped += 1,
            }
        }

        outcome
    }

    fn in_cooldown(&self, signal: &Signal) -> bool {
        let key = (signal.symbol.clone(), signal.action);
        let cooldowns = self.cooldowns.lock();
        match cooldowns.get(&key) {
            Some(at) => at.elapsed() < self.cooldown,
            None => false,
        }
    }

    fn note_cooldown(&self, signal: &Signal) {
        self.cooldowns
            .lock()
            .insert((signal.symbol.clone(), signal.action), Instant::now());
    }

    // -------------------------------------------------------------------------
    // Entry path
    // -------------------------------------------------------------------------

    async fn submit_entry(&self, signal: &Signal) -> Result<(), ()> {
        let Some(meta) = self.cache.meta(&signal.symbol) else {
            warn!(symbol = %signal.symbol, "no contract data — signal dropped");
            return Err(());
        };

        let client_order_id = Uuid::new_v4().to_string();
        let tag = format!("{}:{}", signal.strategy_id, client_order_id);

        let (order_type, price) = entry_order_type(&meta, signal);
        let params = OrderParams {
            symbol: signal.symbol.clone(),
            exchange: meta.segment.exchange().to_string(),
            transaction_type: signal.action,
            order_type,
            quantity: signal.quantity,
            product: ProductType::Mis,
            validity: Validity::Day,
            price,
            trigger_price: None,
            tag: tag.clone(),
            client_order_id: client_order_id.clone(),
        };

        info!(
            symbol = %signal.symbol,
            action = %signal.action,
            order_type = %order_type,
            qty = signal.quantity,
            tag = %tag,
            "submitting entry"
        );

        let entry_order_id = match self.place_with_rate_limit_retry(&params).await {
            Ok(id) => id,
            Err(e) => {
                self.log_submit_failure(signal, &e);
                return Err(());
            }
        };

        // --- Fill confirmation ------------------------------------------------
        let fill = self.await_fill(&entry_order_id).await;
        let (fill_price, filled_quantity) = match fill {
            Some((price, qty)) => (price, qty),
            None => {
                warn!(
                    symbol = %signal.symbol,
                    order_id = %entry_order_id,
                    "entry not confirmed within window — no protective orders placed"
                );
                return Err(());
            }
        };

        // --- Paired protective orders -----------------------------------------
        let exit_action = signal.action.opposite();
        let sl_result = self
            .broker
            .place_order(&OrderParams {
                symbol: signal.symbol.clone(),
                exchange: meta.segment.exchange().to_string(),
                transaction_type: exit_action,
                order_type: OrderType::StopLossMarket,
                quantity: filled_quantity,
                product: ProductType::Mis,
                validity: Validity::Day,
                price: None,
                trigger_price: Some(meta.round_to_tick(signal.stop_loss)),
                tag: format!("{tag}:SL"),
                client_order_id: format!("{client_order_id}-sl"),
            })
            .await;

        let target_result = self
            .broker
            .place_order(&OrderParams {
                symbol: signal.symbol.clone(),
                exchange: meta.segment.exchange().to_string(),
                transaction_type: exit_action,
                order_type: OrderType::Limit,
                quantity: filled_quantity,
                product: ProductType::Mis,
                validity: Validity::Day,
                price: Some(meta.round_to_tick(signal.target)),
                trigger_price: None,
                tag: format!("{tag}:TGT"),
                client_order_id: format!("{client_order_id}-tgt"),
            })
            .await;

        let unprotected = sl_result.is_err() || target_result.is_err();
        if let Err(e) = &sl_result {
            error!(
                symbol = %signal.symbol,
                order_id = %entry_order_id,
                error = %e,
                "CRITICAL: stop-loss placement failed — position unprotected"
            );
        }
        if let Err(e) = &target_result {
            error!(
                symbol = %signal.symbol,
                order_id = %entry_order_id,
                error = %e,
                "CRITICAL: target placement failed — position unprotected"
            );
        }

        // --- Lineage: tracker, dedup record, analytics ------------------------
        self.tracker.add(Position {
            symbol: signal.symbol.clone(),
            side: signal.action.into(),
            quantity: filled_quantity,
            entry_price: fill_price,
            entry_time: Utc::now(),
            stop_loss: signal.stop_loss,
            target: signal.target,
            kind: meta.kind,
            entry_order_id: entry_order_id.clone(),
            sl_order_id: sl_result.as_ref().ok().cloned(),
            target_order_id: target_result.as_ref().ok().cloned(),
            partial_booked: false,
            max_favorable_excursion: fill_price,
            strategy_id: signal.strategy_id.clone(),
            tag: tag.clone(),
            unprotected,
            sl_mod_attempts: 0,
            sl_mod_stuck: false,
        });

        self.dedup
            .mark_executed(Utc::now().date_naive(), signal, &entry_order_id)
            .await;

        let record = TradeRecord {
            trade_id: client_order_id,
            user_id: self.user_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.action,
            quantity: filled_quantity,
            entry_price: fill_price,
            stop: signal.stop_loss,
            target: signal.target,
            broker_order_id: entry_order_id,
            strategy_id: signal.strategy_id.clone(),
            tag,
            generated_at: signal.generated_at,
            submitted_at: Utc::now(),
            filled_at: Some(Utc::now()),
            status: OrderStatus::Complete,
            pnl: None,
        };
        if let Err(e) = self.trades.record(&record) {
            warn!(error = %e, "trade record write failed");
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Management path
    // -------------------------------------------------------------------------

    /// Management/closing signals go straight out as market orders carrying
    /// the position's tag; the fill is applied to the tracker immediately
    /// and trued up by reconciliation.
    async fn submit_management(&self, signal: &Signal) -> Result<(), ()> {
        let Some(meta) = self.cache.meta(&signal.symbol) else {
            warn!(symbol = %signal.symbol, "no contract data — management signal dropped");
            return Err(());
        };

        let client_order_id = Uuid::new_v4().to_string();
        let params = OrderParams {
            symbol: signal.symbol.clone(),
            exchange: meta.segment.exchange().to_string(),
            transaction_type: signal.action,
            order_type: OrderType::Market,
            quantity: signal.quantity,
            product: ProductType::Mis,
            validity: Validity::Day,
            price: None,
            trigger_price: None,
            tag: signal.tag.clone(),
            client_order_id,
        };

        info!(
            symbol = %signal.symbol,
            action = %signal.action,
            qty = signal.quantity,
            closing = signal.closing_action,
            "submitting management order"
        );

        match self.place_with_rate_limit_retry(&params).await {
            Ok(order_id) => {
                self.tracker.update(&FillEvent {
                    order_id,
                    symbol: signal.symbol.clone(),
                    action: signal.action,
                    quantity: signal.quantity,
                    price: signal.entry_price,
                });
                Ok(())
            }
            Err(e) => {
                self.log_submit_failure(signal, &e);
                Err(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Rate-limit policy: one retry after a full bucket refill, then drop.
    async fn place_with_rate_limit_retry(
        &self,
        params: &OrderParams,
    ) -> Result<String, BrokerError> {
        match self.broker.place_order(params).await {
            Err(BrokerError::RateLimited) => {
                warn!(
                    symbol = %params.symbol,
                    wait_ms = self.rate_limit_refill.as_millis() as u64,
                    "rate limited — retrying once after refill"
                );
                tokio::time::sleep(self.rate_limit_refill).await;
                self.broker.place_order(params).await
            }
            other => other,
        }
    }

    /// Poll the broker until the order completes, or accept a partial past
    /// the confirmation window. Returns (fill price, filled quantity).
    async fn await_fill(&self, order_id: &str) -> Option<(f64, u32)> {
        let deadline = Instant::now() + self.fill_confirm_timeout;
        let mut partial: Option<(f64, u32)> = None;

        loop {
            if let Ok(orders) = self.broker.orders().await {
                if let Some(order) = orders.iter().find(|o| o.order_id == order_id) {
                    match order.status {
                        OrderStatus::Complete => {
                            let price = order.average_price.or(order.price).unwrap_or(0.0);
                            return Some((price, order.filled_quantity.max(order.quantity)));
                        }
                        OrderStatus::Rejected | OrderStatus::Cancelled => return None,
                        OrderStatus::Open | OrderStatus::Triggered
                            if order.filled_quantity > 0 =>
                        {
                            let price = order.average_price.or(order.price).unwrap_or(0.0);
                            partial = Some((price, order.filled_quantity));
                        }
                        _ => {}
                    }
                }
            }
            if Instant::now() >= deadline {
                // A partial past the window still gets protective orders for
                // the filled quantity.
                return partial;
            }
            tokio::time::sleep(FILL_POLL_INTERVAL).await;
        }
    }

    fn log_submit_failure(&self, signal: &Signal, error: &BrokerError) {
        match error {
            BrokerError::Reject { code, message } => warn!(
                symbol = %signal.symbol,
                code = %code,
                message = %message,
                "broker rejected order — not retrying"
            ),
            BrokerError::RateLimited => warn!(
                symbol = %signal.symbol,
                "order dropped after rate-limit retry"
            ),
            other => warn!(symbol = %signal.symbol, error = %other, "order submission failed"),
        }
    }
}

/// LIMIT with a ±0.5% collar for stock options; MARKET for index options
/// and equities.
fn entry_order_type(meta: &SymbolMeta, signal: &Signal) -> (OrderType, Option<f64>) {
    match meta.kind {
        InstrumentKind::StockOption => {
            let collar = match signal.action {
                TradeAction::Buy => signal.entry_price * (1.0 + OPTION_LIMIT_COLLAR_FRAC),
                TradeAction::Sell => signal.entry_price * (1.0 - OPTION_LIMIT_COLLAR_FRAC),
            };
            (OrderType::Limit, Some(meta.round_to_tick(collar)))
        }
        _ => (OrderType::Market, None),
    }
}

impl std::fmt::Debug for TradeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeEngine")
            .field("max_signals_per_cycle", &self.max_signals_per_cycle)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::store::{MemoryKvStore, MemoryTradeStore};
    use std::time::Duration as StdDuration;

    fn engine(broker: Arc<PaperBroker>) -> (TradeEngine, Arc<PositionTracker>, Arc<MemoryTradeStore>) {
        let cache = Arc::new(MarketDataCache::new(StdDuration::from_secs(60), 500));
        cache.register(SymbolMeta::equity("RELIANCE"));
        cache.register(SymbolMeta::option(
            "MUTHOOTFIN25AUG1800CE",
            InstrumentKind::StockOption,
            150,
        ));

        let tracker = Arc::new(PositionTracker::new());
        let dedup = Arc::new(SignalDeduplicator::new(
            Arc::new(MemoryKvStore::new()),
            0.6,
            &["momentum".to_string()],
            StdDuration::from_secs(86_400),
        ));
        let trades = Arc::new(MemoryTradeStore::new());

        let mut config = crate::config::EngineConfig::default();
        config.inter_order_delay_ms = 0;
        config.fill_confirm_timeout_ms = 500;

        let engine = TradeEngine::new(
            broker,
            tracker.clone(),
            dedup,
            trades.clone(),
            cache,
            &config,
            StdDuration::from_millis(10),
        );
        (engine, tracker, trades)
    }

    fn entry_signal(symbol: &str, qty: u32) -> Signal {
        Signal::entry(
            symbol,
            TradeAction::Buy,
            2500.0,
            2475.0,
            2550.0,
            qty,
            8.0,
            "momentum",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn entry_places_paired_protective_orders() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_ltp("RELIANCE", 2500.0);
        let (engine, tracker, trades) = engine(broker.clone());

        let outcome = engine.submit_batch(vec![entry_signal("RELIANCE", 10)]).await;
        assert_eq!(outcome.submitted, 1);

        let position = tracker.get("RELIANCE").expect("position recorded");
        assert!(position.sl_order_id.is_some());
        assert!(position.target_order_id.is_some());
        assert!(!position.unprotected);

        let sl = broker.order(position.sl_order_id.as_ref().unwrap()).unwrap();
        assert_eq!(sl.order_type, OrderType::StopLossMarket);
        assert_eq!(sl.trigger_price, Some(2475.0));
        assert_eq!(sl.side, TradeAction::Sell);

        let tgt = broker.order(position.target_order_id.as_ref().unwrap()).unwrap();
        assert_eq!(tgt.order_type, OrderType::Limit);
        assert_eq!(tgt.price, Some(2550.0));

        // Analytics record written with the full lineage.
        let records = trades.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].user_id, "master");
        assert!(records[0].tag.starts_with("momentum:"));
    }

    #[tokio::test]
    async fn stock_option_entry_uses_collared_limit() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_ltp("MUTHOOTFIN25AUG1800CE", 130.0);
        let (engine, _tracker, _) = engine(broker.clone());

        let mut signal = entry_signal("MUTHOOTFIN25AUG1800CE", 150);
        signal.entry_price = 130.0;
        signal.stop_loss = 117.0;
        signal.target = 156.0;
        engine.submit_batch(vec![signal]).await;

        let entries: Vec<_> = broker
            .orders()
            .await
            .unwrap()
            .into_iter()
            .filter(|o| o.order_type == OrderType::Limit && o.side == TradeAction::Buy)
            .collect();
        assert_eq!(entries.len(), 1);
        // 130 * 1.005 = 130.65 collar.
        assert!((entries[0].price.unwrap() - 130.65).abs() < 1e-9);
    }

    #[tokio::test]
    async fn protective_failure_marks_position_unprotected() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_ltp("RELIANCE", 2500.0);
        let (engine, tracker, _) = engine(broker.clone());

        // Entry (1st place call) passes; the SL leg (2nd) is rejected.
        broker.pass_next(crate::broker::paper::Op::Place);
        broker.fail_next(
            crate::broker::paper::Op::Place,
            BrokerError::Reject {
                code: "RMS-02".to_string(),
                message: "trigger price outside band".to_string(),
            },
        );

        let outcome = engine.submit_batch(vec![entry_signal("RELIANCE", 10)]).await;
        assert_eq!(outcome.submitted, 1);

        let position = tracker.get("RELIANCE").unwrap();
        assert!(position.unprotected);
        assert!(position.sl_order_id.is_none());
        // The target leg still went through.
        assert!(position.target_order_id.is_some());
    }

    #[tokio::test]
    async fn reject_is_not_retried_and_drops_signal() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_ltp("RELIANCE", 2500.0);
        let (engine, tracker, _) = engine(broker.clone());

        broker.fail_next(
            crate::broker::paper::Op::Place,
            BrokerError::Reject {
                code: "RMS-01".to_string(),
                message: "margin shortfall".to_string(),
            },
        );

        let outcome = engine.submit_batch(vec![entry_signal("RELIANCE", 10)]).await;
        assert_eq!(outcome.submitted, 0);
        assert_eq!(outcome.dropped, 1);
        assert!(tracker.get("RELIANCE").is_none());
        // Only the single rejected placement reached the broker.
        assert_eq!(broker.calls_of(crate::broker::paper::Op::Place).len(), 1);
    }

    #[tokio::test]
    async fn per_cycle_ceiling_enforced() {
        let broker = Arc::new(PaperBroker::new());
        let cache = Arc::new(MarketDataCache::new(StdDuration::from_secs(60), 500));
        let mut signals = Vec::new();
        for i in 0..7 {
            let symbol = format!("SYM{i}");
            cache.register(SymbolMeta::equity(&symbol));
            broker.set_ltp(&symbol, 2500.0);
            signals.push(entry_signal(&symbol, 10));
        }

        let tracker = Arc::new(PositionTracker::new());
        let dedup = Arc::new(SignalDeduplicator::new(
            Arc::new(MemoryKvStore::new()),
            0.6,
            &["momentum".to_string()],
            StdDuration::from_secs(86_400),
        ));
        let mut config = crate::config::EngineConfig::default();
        config.inter_order_delay_ms = 0;
        config.fill_confirm_timeout_ms = 500;
        let engine = TradeEngine::new(
            broker.clone(),
            tracker,
            dedup,
            Arc::new(MemoryTradeStore::new()),
            cache,
            &config,
            StdDuration::from_millis(10),
        );

        let outcome = engine.submit_batch(signals).await;
        assert_eq!(outcome.submitted, 5);
        assert_eq!(outcome.dropped, 2);
    }

    #[tokio::test]
    async fn cooldown_blocks_rapid_resubmission() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_ltp("RELIANCE", 2500.0);
        let (engine, tracker, _) = engine(broker.clone());

        let first = engine.submit_batch(vec![entry_signal("RELIANCE", 10)]).await;
        assert_eq!(first.submitted, 1);
        tracker.remove("RELIANCE");

        let second = engine.submit_batch(vec![entry_signal("RELIANCE", 10)]).await;
        assert_eq!(second.submitted, 0);
        assert_eq!(second.dropped, 1);
    }

    #[tokio::test]
    async fn management_signal_reduces_tracker_position() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_ltp("RELIANCE", 2500.0);
        let (engine, tracker, _) = engine(broker.clone());

        engine.submit_batch(vec![entry_signal("RELIANCE", 10)]).await;
        assert_eq!(tracker.get("RELIANCE").unwrap().quantity, 10);

        let tag = tracker.get("RELIANCE").unwrap().tag;
        let exit = Signal::management(
            "RELIANCE",
            TradeAction::Sell,
            2550.0,
            10,
            "momentum",
            tag,
            true,
            Utc::now(),
        );
        let outcome = engine.submit_batch(vec![exit]).await;
        assert_eq!(outcome.submitted, 1);
        assert!(tracker.get("RELIANCE").is_none());
        assert!((tracker.realized_today() - 500.0).abs() < 1e-9);
    }
}
