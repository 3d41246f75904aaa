// =============================================================================
// Paper Broker — deterministic in-process BrokerClient
// =============================================================================
//
// Backs demo mode and the scenario tests. Behaviour:
//
//   - MARKET orders fill immediately at the injected LTP (entry price when no
//     LTP has been set). LIMIT / SL / SL-M orders rest OPEN until a test
//     helper fills or cancels them.
//   - `client_order_id` is idempotent: replaying a placement returns the
//     original order id without a second fill.
//   - Failures can be scripted per operation to exercise retry and
//     unprotected-position paths.
//   - Every mutating call lands in a timestamped call log so tests can assert
//     on rate and ordering.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;

use crate::market_data::{Bar, BarInterval};
use crate::types::{OrderStatus, OrderType};

use super::{
    BrokerClient, BrokerError, BrokerOrder, BrokerPosition, Margin, ModifyParams, OptionChain,
    OrderParams,
};

/// Which API surface a scripted failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Place,
    Modify,
    Cancel,
    Orders,
    Positions,
    Margins,
    Ltp,
}

/// One entry of the mutating-call log.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub op: Op,
    pub at: Instant,
    pub order_id: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Default)]
struct PaperState {
    orders: HashMap<String, BrokerOrder>,
    by_client_id: HashMap<String, String>,
    positions: HashMap<String, BrokerPosition>,
    ltp: HashMap<String, f64>,
    chains: HashMap<String, OptionChain>,
    history: HashMap<(String, BarInterval), Vec<Bar>>,
    margin: Option<Margin>,
    /// `Some(err)` fails the call, `None` is an explicit pass slot so a
    /// failure can be aimed at the Nth call of an operation.
    scripted_failures: HashMap<Op, VecDeque<Option<BrokerError>>>,
    call_log: Vec<CallRecord>,
    next_order_seq: u64,
}

/// The deterministic broker.
#[derive(Default)]
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Test / demo configuration
    // -------------------------------------------------------------------------

    pub fn set_ltp(&self, symbol: &str, price: f64) {
        self.state.lock().ltp.insert(symbol.to_string(), price);
    }

    pub fn set_margin(&self, available_cash: f64, used: f64) {
        self.state.lock().margin = Some(Margin {
            available_cash,
            used,
        });
    }

    pub fn set_chain(&self, chain: OptionChain) {
        self.state
            .lock()
            .chains
            .insert(chain.underlying.clone(), chain);
    }

    pub fn set_history(&self, symbol: &str, interval: BarInterval, bars: Vec<Bar>) {
        self.state
            .lock()
            .history
            .insert((symbol.to_string(), interval), bars);
    }

    /// Queue an error for the next call of `op`.
    pub fn fail_next(&self, op: Op, error: BrokerError) {
        self.state
            .lock()
            .scripted_failures
            .entry(op)
            .or_default()
            .push_back(Some(error));
    }

    /// Queue an explicit success slot so a following `fail_next` hits a
    /// later call of the same operation.
    pub fn pass_next(&self, op: Op) {
        self.state
            .lock()
            .scripted_failures
            .entry(op)
            .or_default()
            .push_back(None);
    }

    /// Fill a resting (OPEN / TRIGGERED) order at `price`, updating the net
    /// position as the exchange would.
    pub fn fill_order(&self, order_id: &str, price: f64) -> bool {
        let mut state = self.state.lock();
        let Some(order) = state.orders.get(order_id).cloned() else {
            return false;
        };
        if order.status.is_terminal() {
            return false;
        }
        Self::apply_fill(&mut state, order_id, price);
        true
    }

    /// Snapshot of the mutating-call log.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().call_log.clone()
    }

    pub fn calls_of(&self, op: Op) -> Vec<CallRecord> {
        self.state
            .lock()
            .call_log
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    /// All orders sharing a tag prefix (parent + protective children).
    pub fn orders_with_tag(&self, tag: &str) -> Vec<BrokerOrder> {
        self.state
            .lock()
            .orders
            .values()
            .filter(|o| o.tag.starts_with(tag))
            .cloned()
            .collect()
    }

    pub fn order(&self, order_id: &str) -> Option<BrokerOrder> {
        self.state.lock().orders.get(order_id).cloned()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn take_failure(state: &mut PaperState, op: Op) -> Option<BrokerError> {
        state.scripted_failures.get_mut(&op)?.pop_front().flatten()
    }

    fn log(state: &mut PaperState, op: Op, order_id: Option<&str>, symbol: Option<&str>) {
        state.call_log.push(CallRecord {
            op,
            at: Instant::now(),
            order_id: order_id.map(str::to_string),
            symbol: symbol.map(str::to_string),
        });
    }

    fn apply_fill(state: &mut PaperState, order_id: &str, price: f64) {
        let Some(order) = state.orders.get_mut(order_id) else {
            return;
        };
        order.status = OrderStatus::Complete;
        order.filled_quantity = order.quantity;
        order.average_price = Some(price);

        let signed = match order.side {
            crate::types::TradeAction::Buy => order.quantity as i64,
            crate::types::TradeAction::Sell => -(order.quantity as i64),
        };
        let symbol = order.symbol.clone();
        let entry = state
            .positions
            .entry(symbol.clone())
            .or_insert(BrokerPosition {
                symbol,
                net_quantity: 0,
                average_price: 0.0,
                pnl: 0.0,
            });
        // Weighted average only while adding in the same direction.
        if entry.net_quantity.signum() == signed.signum() || entry.net_quantity == 0 {
            let prev_abs = entry.net_quantity.abs() as f64;
            let add_abs = signed.abs() as f64;
            let total = prev_abs + add_abs;
            if total > 0.0 {
                entry.average_price =
                    (entry.average_price * prev_abs + price * add_abs) / total;
            }
        }
        entry.net_quantity += signed;
        if entry.net_quantity == 0 {
            entry.average_price = 0.0;
        }
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn place_order(&self, params: &OrderParams) -> Result<String, BrokerError> {
        let mut state = self.state.lock();
        if let Some(err) = Self::take_failure(&mut state, Op::Place) {
            return Err(err);
        }

        // Idempotency: a replayed client_order_id resolves to the original
        // order without a duplicate fill.
        if let Some(existing) = state.by_client_id.get(&params.client_order_id) {
            let existing = existing.clone();
            Self::log(&mut state, Op::Place, Some(&existing), Some(&params.symbol));
            return Ok(existing);
        }

        state.next_order_seq += 1;
        let order_id = format!("P{:08}", state.next_order_seq);

        let order = BrokerOrder {
            order_id: order_id.clone(),
            client_order_id: params.client_order_id.clone(),
            symbol: params.symbol.clone(),
            side: params.transaction_type,
            quantity: params.quantity,
            filled_quantity: 0,
            order_type: params.order_type,
            price: params.price,
            trigger_price: params.trigger_price,
            average_price: None,
            status: OrderStatus::Open,
            tag: params.tag.clone(),
            placed_at: Utc::now(),
        };
        state.orders.insert(order_id.clone(), order);
        state
            .by_client_id
            .insert(params.client_order_id.clone(), order_id.clone());

        if params.order_type == OrderType::Market {
            let fill_price = state
                .ltp
                .get(&params.symbol)
                .copied()
                .or(params.price)
                .unwrap_or(0.0);
            Self::apply_fill(&mut state, &order_id, fill_price);
        }

        Self::log(&mut state, Op::Place, Some(&order_id), Some(&params.symbol));
        Ok(order_id)
    }

    async fn modify_order(&self, order_id: &str, params: &ModifyParams) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if let Some(err) = Self::take_failure(&mut state, Op::Modify) {
            return Err(err);
        }

        let Some(order) = state.orders.get_mut(order_id) else {
            return Err(BrokerError::Reject {
                code: "OrderException".to_string(),
                message: format!("unknown order {order_id}"),
            });
        };
        if order.status.is_terminal() {
            return Err(BrokerError::Reject {
                code: "OrderException".to_string(),
                message: format!("order {order_id} is {}", order.status),
            });
        }
        if let Some(q) = params.quantity {
            order.quantity = q;
        }
        if let Some(p) = params.price {
            order.price = Some(p);
        }
        if let Some(t) = params.trigger_price {
            order.trigger_price = Some(t);
        }
        Self::log(&mut state, Op::Modify, Some(order_id), None);
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if let Some(err) = Self::take_failure(&mut state, Op::Cancel) {
            return Err(err);
        }

        let Some(order) = state.orders.get_mut(order_id) else {
            return Err(BrokerError::Reject {
                code: "OrderException".to_string(),
                message: format!("unknown order {order_id}"),
            });
        };
        if order.status.is_terminal() {
            return Err(BrokerError::Reject {
                code: "OrderException".to_string(),
                message: format!("order {order_id} is {}", order.status),
            });
        }
        order.status = OrderStatus::Cancelled;
        Self::log(&mut state, Op::Cancel, Some(order_id), None);
        Ok(())
    }

    async fn orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        let mut state = self.state.lock();
        if let Some(err) = Self::take_failure(&mut state, Op::Orders) {
            return Err(err);
        }
        let mut orders: Vec<BrokerOrder> = state.orders.values().cloned().collect();
        orders.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        Ok(orders)
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let mut state = self.state.lock();
        if let Some(err) = Self::take_failure(&mut state, Op::Positions) {
            return Err(err);
        }
        Ok(state
            .positions
            .values()
            .filter(|p| p.net_quantity != 0)
            .cloned()
            .collect())
    }

    async fn margins(&self) -> Result<Margin, BrokerError> {
        let mut state = self.state.lock();
        if let Some(err) = Self::take_failure(&mut state, Op::Margins) {
            return Err(err);
        }
        Ok(state.margin.unwrap_or(Margin {
            available_cash: 1_000_000.0,
            used: 0.0,
        }))
    }

    async fn option_chain(
        &self,
        underlying: &str,
        _expiry: NaiveDate,
    ) -> Result<OptionChain, BrokerError> {
        let state = self.state.lock();
        state
            .chains
            .get(underlying)
            .cloned()
            .ok_or_else(|| BrokerError::Reject {
                code: "InputException".to_string(),
                message: format!("no chain configured for {underlying}"),
            })
    }

    async fn ltp(&self, symbols: &[String]) -> Result<HashMap<String, f64>, BrokerError> {
        let mut state = self.state.lock();
        if let Some(err) = Self::take_failure(&mut state, Op::Ltp) {
            return Err(err);
        }
        Ok(symbols
            .iter()
            .filter_map(|s| state.ltp.get(s).map(|p| (s.clone(), *p)))
            .collect())
    }

    async fn historical_bars(
        &self,
        symbol: &str,
        interval: BarInterval,
        _days: u32,
    ) -> Result<Vec<Bar>, BrokerError> {
        let state = self.state.lock();
        Ok(state
            .history
            .get(&(symbol.to_string(), interval))
            .cloned()
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PaperBroker")
            .field("orders", &state.orders.len())
            .field("positions", &state.positions.len())
            .field("calls", &state.call_log.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProductType, TradeAction, Validity};

    fn market_buy(symbol: &str, qty: u32, client_id: &str) -> OrderParams {
        OrderParams {
            symbol: symbol.to_string(),
            exchange: "NSE".to_string(),
            transaction_type: TradeAction::Buy,
            order_type: OrderType::Market,
            quantity: qty,
            product: ProductType::Mis,
            validity: Validity::Day,
            price: None,
            trigger_price: None,
            tag: format!("test:{client_id}"),
            client_order_id: client_id.to_string(),
        }
    }

    #[tokio::test]
    async fn market_order_fills_at_ltp() {
        let broker = PaperBroker::new();
        broker.set_ltp("RELIANCE", 2500.0);

        let id = broker.place_order(&market_buy("RELIANCE", 10, "c1")).await.unwrap();
        let order = broker.order(&id).unwrap();
        assert_eq!(order.status, OrderStatus::Complete);
        assert_eq!(order.average_price, Some(2500.0));

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].net_quantity, 10);
    }

    #[tokio::test]
    async fn replayed_client_order_id_returns_same_order() {
        let broker = PaperBroker::new();
        broker.set_ltp("RELIANCE", 2500.0);

        let first = broker.place_order(&market_buy("RELIANCE", 10, "c1")).await.unwrap();
        let second = broker.place_order(&market_buy("RELIANCE", 10, "c1")).await.unwrap();
        assert_eq!(first, second);

        // No duplicate fill landed on the position.
        let positions = broker.positions().await.unwrap();
        assert_eq!(positions[0].net_quantity, 10);
    }

    #[tokio::test]
    async fn sell_flattens_position() {
        let broker = PaperBroker::new();
        broker.set_ltp("RELIANCE", 2500.0);
        broker.place_order(&market_buy("RELIANCE", 10, "c1")).await.unwrap();

        let mut sell = market_buy("RELIANCE", 10, "c2");
        sell.transaction_type = TradeAction::Sell;
        broker.place_order(&sell).await.unwrap();

        assert!(broker.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resting_order_modify_and_fill() {
        let broker = PaperBroker::new();
        let mut params = market_buy("RELIANCE", 10, "c1");
        params.order_type = OrderType::StopLossMarket;
        params.trigger_price = Some(2475.0);

        let id = broker.place_order(&params).await.unwrap();
        assert_eq!(broker.order(&id).unwrap().status, OrderStatus::Open);

        broker
            .modify_order(&id, &ModifyParams { trigger_price: Some(2490.0), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(broker.order(&id).unwrap().trigger_price, Some(2490.0));

        assert!(broker.fill_order(&id, 2490.0));
        assert_eq!(broker.order(&id).unwrap().status, OrderStatus::Complete);
    }

    #[tokio::test]
    async fn scripted_failure_consumed_once() {
        let broker = PaperBroker::new();
        broker.set_ltp("RELIANCE", 2500.0);
        broker.fail_next(Op::Place, BrokerError::Transient("flaky".into()));

        let err = broker.place_order(&market_buy("RELIANCE", 10, "c1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Transient(_)));

        // Next attempt succeeds.
        assert!(broker.place_order(&market_buy("RELIANCE", 10, "c1")).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_terminal_order_rejected() {
        let broker = PaperBroker::new();
        broker.set_ltp("RELIANCE", 2500.0);
        let id = broker.place_order(&market_buy("RELIANCE", 10, "c1")).await.unwrap();
        let err = broker.cancel_order(&id).await.unwrap_err();
        assert!(matches!(err, BrokerError::Reject { .. }));
    }
}
