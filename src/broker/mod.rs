// =============================================================================
// Broker interface — order routing, account state, and market queries
// =============================================================================
//
// Everything the engine asks of a broker goes through the `BrokerClient`
// trait. The REST adapter implements it against a Kite-style API; the paper
// broker implements it in-process for demo mode and tests. All outbound order
// operations are serialised through the `OrderThrottle` wrapper.
// =============================================================================

pub mod paper;
pub mod rate_limit;
pub mod rest;

pub use paper::PaperBroker;
pub use rate_limit::{OrderThrottle, TokenBucket};
pub use rest::RestBrokerClient;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::market_data::Bar;
use crate::types::{OrderStatus, OrderType, ProductType, TradeAction, Validity};

/// Broker failure taxonomy. The retry policy keys off these variants:
/// transient errors retry, rejects and auth failures never do.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("transient broker error: {0}")]
    Transient(String),

    #[error("broker rejected request [{code}]: {message}")]
    Reject { code: String, message: String },

    #[error("broker authentication failed: {0}")]
    Auth(String),

    #[error("order rate limit exhausted")]
    RateLimited,
}

/// Parameters for a new order. `tag` is the correlation key and must
/// round-trip unchanged; `client_order_id` is the idempotency token carried
/// across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderParams {
    pub symbol: String,
    pub exchange: String,
    pub transaction_type: TradeAction,
    pub order_type: OrderType,
    pub quantity: u32,
    pub product: ProductType,
    pub validity: Validity,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    pub tag: String,
    pub client_order_id: String,
}

/// Fields that may change on an open order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModifyParams {
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
}

/// Broker-side view of an order, pulled via `orders()` and correlated by tag
/// plus `client_order_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: TradeAction,
    pub quantity: u32,
    pub filled_quantity: u32,
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    #[serde(default)]
    pub average_price: Option<f64>,
    pub status: OrderStatus,
    pub tag: String,
    pub placed_at: DateTime<Utc>,
}

/// Broker-side net position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Net signed quantity: positive long, negative short.
    pub net_quantity: i64,
    pub average_price: f64,
    #[serde(default)]
    pub pnl: f64,
}

/// Available funds snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Margin {
    pub available_cash: f64,
    pub used: f64,
}

/// One strike row of an option chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStrike {
    pub strike: f64,
    /// Tradeable contract symbols, when the venue lists them.
    #[serde(default)]
    pub call_symbol: Option<String>,
    #[serde(default)]
    pub put_symbol: Option<String>,
    #[serde(default)]
    pub call_ltp: Option<f64>,
    #[serde(default)]
    pub put_ltp: Option<f64>,
    #[serde(default)]
    pub call_iv: Option<f64>,
    #[serde(default)]
    pub put_iv: Option<f64>,
    #[serde(default)]
    pub call_oi: Option<f64>,
    #[serde(default)]
    pub put_oi: Option<f64>,
}

/// Option chain for one underlying and expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionChain {
    pub underlying: String,
    pub expiry: NaiveDate,
    pub spot: f64,
    pub strikes: Vec<ChainStrike>,
}

impl OptionChain {
    /// The strike row closest to spot.
    pub fn at_the_money(&self) -> Option<&ChainStrike> {
        self.strikes.iter().min_by(|a, b| {
            let da = (a.strike - self.spot).abs();
            let db = (b.strike - self.spot).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

/// The broker seam. Implementations must keep `client_order_id` idempotent:
/// replaying a `place_order` with the same id resolves to the same order.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn place_order(&self, params: &OrderParams) -> Result<String, BrokerError>;

    async fn modify_order(&self, order_id: &str, params: &ModifyParams) -> Result<(), BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    async fn orders(&self) -> Result<Vec<BrokerOrder>, BrokerError>;

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn margins(&self) -> Result<Margin, BrokerError>;

    async fn option_chain(
        &self,
        underlying: &str,
        expiry: NaiveDate,
    ) -> Result<OptionChain, BrokerError>;

    /// Spot quotes for `symbols`; the fallback price source when the feed is
    /// stale.
    async fn ltp(&self, symbols: &[String]) -> Result<HashMap<String, f64>, BrokerError>;

    /// Historical bars for the warm-up preload, oldest first.
    async fn historical_bars(
        &self,
        symbol: &str,
        interval: crate::market_data::BarInterval,
        days: u32,
    ) -> Result<Vec<Bar>, BrokerError>;
}

#[async_trait]
impl<B: BrokerClient + ?Sized> BrokerClient for std::sync::Arc<B> {
    async fn place_order(&self, params: &OrderParams) -> Result<String, BrokerError> {
        (**self).place_order(params).await
    }

    async fn modify_order(&self, order_id: &str, params: &ModifyParams) -> Result<(), BrokerError> {
        (**self).modify_order(order_id, params).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        (**self).cancel_order(order_id).await
    }

    async fn orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        (**self).orders().await
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        (**self).positions().await
    }

    async fn margins(&self) -> Result<Margin, BrokerError> {
        (**self).margins().await
    }

    async fn option_chain(
        &self,
        underlying: &str,
        expiry: NaiveDate,
    ) -> Result<OptionChain, BrokerError> {
        (**self).option_chain(underlying, expiry).await
    }

    async fn ltp(&self, symbols: &[String]) -> Result<HashMap<String, f64>, BrokerError> {
        (**self).ltp(symbols).await
    }

    async fn historical_bars(
        &self,
        symbol: &str,
        interval: crate::market_data::BarInterval,
        days: u32,
    ) -> Result<Vec<Bar>, BrokerError> {
        (**self).historical_bars(symbol, interval, days).await
    }
}
