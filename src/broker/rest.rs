// =============================================================================
// REST Broker Adapter — Kite-style HTTP API
// =============================================================================
//
// SECURITY: the API secret is used only to build the SHA-256 session checksum
// during the token exchange; it is never logged or serialised. All subsequent
// requests authenticate with `Authorization: token api_key:access_token`.
//
// Retry policy: transient failures (network errors, 5xx, 429) retry up to 3
// times with exponential backoff capped at 1 s. Rejects and auth failures
// never retry. Every retried submission carries the same `client_order_id`
// so duplicate broker-side submissions resolve to one order.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::market_data::{Bar, BarInterval};
use crate::types::{OrderStatus, OrderType, TradeAction};

use super::{
    BrokerClient, BrokerError, BrokerOrder, BrokerPosition, ChainStrike, Margin, ModifyParams,
    OptionChain, OrderParams,
};

/// Per-attempt request budget.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Maximum transient retries per call.
const MAX_RETRIES: u32 = 3;
/// Backoff cap between retries.
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Kite-style REST client. Cheap to clone; the session token is shared.
pub struct RestBrokerClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    access_token: RwLock<Option<String>>,
    client: reqwest::Client,
}

impl RestBrokerClient {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, api_secret, "https://api.kite.trade")
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            base_url: base_url.into(),
            access_token: RwLock::new(None),
            client,
        }
    }

    /// Resume a previously stored session token (secret-store rehydration).
    pub fn restore_session(&self, access_token: impl Into<String>) {
        *self.access_token.write() = Some(access_token.into());
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.read().is_some()
    }

    // -------------------------------------------------------------------------
    // Session
    // -------------------------------------------------------------------------

    /// Exchange a login `request_token` for a session token. The checksum is
    /// `sha256(api_key + request_token + api_secret)` in hex.
    pub async fn create_session(&self, request_token: &str) -> Result<String, BrokerError> {
        let checksum = {
            let mut hasher = Sha256::new();
            hasher.update(self.api_key.as_bytes());
            hasher.update(request_token.as_bytes());
            hasher.update(self.api_secret.as_bytes());
            hex::encode(hasher.finalize())
        };

        let url = format!("{}/session/token", self.base_url);
        let form = [
            ("api_key", self.api_key.as_str()),
            ("request_token", request_token),
            ("checksum", checksum.as_str()),
        ];

        let resp = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(format!("session request failed: {e}")))?;

        let body = Self::parse_envelope(resp).await?;
        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| BrokerError::Auth("session response missing access_token".into()))?
            .to_string();

        debug!("broker session established");
        *self.access_token.write() = Some(token.clone());
        Ok(token)
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    fn auth_header(&self) -> Result<String, BrokerError> {
        let token = self
            .access_token
            .read()
            .clone()
            .ok_or_else(|| BrokerError::Auth("no active session".into()))?;
        Ok(format!("token {}:{}", self.api_key, token))
    }

    /// Unwrap the `{"status": ..., "data": ...}` envelope, mapping HTTP and
    /// API failures into the error taxonomy.
    async fn parse_envelope(resp: reqwest::Response) -> Result<Value, BrokerError> {
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BrokerError::Transient(format!("failed to parse response: {e}")))?;

        if status.is_success() && body["status"].as_str() == Some("success") {
            return Ok(body["data"].clone());
        }

        let error_type = body["error_type"].as_str().unwrap_or("Unknown").to_string();
        let message = body["message"].as_str().unwrap_or("no message").to_string();

        if status.as_u16() == 403 || error_type == "TokenException" {
            return Err(BrokerError::Auth(message));
        }
        if status.is_server_error() || status.as_u16() == 429 || error_type == "NetworkException" {
            return Err(BrokerError::Transient(format!("{error_type}: {message}")));
        }
        Err(BrokerError::Reject {
            code: error_type,
            message,
        })
    }

    /// Run `op` with the transient-retry policy. The closure builds a fresh
    /// request each attempt; idempotency comes from the stable
    /// `client_order_id` inside the request payload.
    async fn with_retries<T, F, Fut>(&self, what: &str, op: F) -> Result<T, BrokerError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, BrokerError>>,
    {
        let mut backoff = Duration::from_millis(250);
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            match op().await {
                Ok(value) => return Ok(value),
                Err(BrokerError::Transient(msg)) => {
                    warn!(what, attempt, error = %msg, "transient broker error");
                    last_err = Some(BrokerError::Transient(msg));
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_err.unwrap_or_else(|| BrokerError::Transient("retry budget exhausted".into())))
    }

    async fn get_json(&self, path: &str) -> Result<Value, BrokerError> {
        let auth = self.auth_header()?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", auth)
            .header("X-Kite-Version", "3")
            .send()
            .await
            .map_err(|e| BrokerError::Transient(format!("GET {path} failed: {e}")))?;
        Self::parse_envelope(resp).await
    }

    fn parse_order(value: &Value) -> Option<BrokerOrder> {
        let placed_ts = value["order_timestamp"].as_i64().unwrap_or(0);
        Some(BrokerOrder {
            order_id: value["order_id"].as_str()?.to_string(),
            client_order_id: value["client_order_id"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            symbol: value["tradingsymbol"].as_str()?.to_string(),
            side: match value["transaction_type"].as_str()? {
                "BUY" => TradeAction::Buy,
                _ => TradeAction::Sell,
            },
            quantity: value["quantity"].as_u64().unwrap_or(0) as u32,
            filled_quantity: value["filled_quantity"].as_u64().unwrap_or(0) as u32,
            order_type: match value["order_type"].as_str()? {
                "LIMIT" => OrderType::Limit,
                "SL" => OrderType::StopLoss,
                "SL-M" => OrderType::StopLossMarket,
                _ => OrderType::Market,
            },
            price: value["price"].as_f64().filter(|p| *p > 0.0),
            trigger_price: value["trigger_price"].as_f64().filter(|p| *p > 0.0),
            average_price: value["average_price"].as_f64().filter(|p| *p > 0.0),
            status: match value["status"].as_str().unwrap_or("") {
                "COMPLETE" => OrderStatus::Complete,
                "OPEN" => OrderStatus::Open,
                "TRIGGER PENDING" => OrderStatus::Triggered,
                "CANCELLED" => OrderStatus::Cancelled,
                "REJECTED" => OrderStatus::Rejected,
                _ => OrderStatus::Pending,
            },
            tag: value["tag"].as_str().unwrap_or_default().to_string(),
            placed_at: Utc.timestamp_opt(placed_ts, 0).single().unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl BrokerClient for RestBrokerClient {
    async fn place_order(&self, params: &OrderParams) -> Result<String, BrokerError> {
        self.with_retries("place_order", || async {
            let auth = self.auth_header()?;
            let url = format!("{}/orders/regular", self.base_url);

            let quantity = params.quantity.to_string();
            let mut form: Vec<(&str, String)> = vec![
                ("tradingsymbol", params.symbol.clone()),
                ("exchange", params.exchange.clone()),
                ("transaction_type", params.transaction_type.to_string()),
                ("order_type", params.order_type.to_string()),
                ("quantity", quantity),
                ("product", params.product.to_string()),
                ("validity", params.validity.to_string()),
                ("tag", params.tag.clone()),
                ("client_order_id", params.client_order_id.clone()),
            ];
            if let Some(price) = params.price {
                form.push(("price", format!("{price:.2}")));
            }
            if let Some(trigger) = params.trigger_price {
                form.push(("trigger_price", format!("{trigger:.2}")));
            }

            debug!(
                symbol = %params.symbol,
                side = %params.transaction_type,
                order_type = %params.order_type,
                qty = params.quantity,
                tag = %params.tag,
                "placing order"
            );

            let resp = self
                .client
                .post(&url)
                .header("Authorization", auth)
                .header("X-Kite-Version", "3")
                .form(&form)
                .send()
                .await
                .map_err(|e| BrokerError::Transient(format!("place_order failed: {e}")))?;

            let data = Self::parse_envelope(resp).await?;
            data["order_id"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| BrokerError::Transient("order response missing order_id".into()))
        })
        .await
    }

    async fn modify_order(&self, order_id: &str, params: &ModifyParams) -> Result<(), BrokerError> {
        self.with_retries("modify_order", || async {
            let auth = self.auth_header()?;
            let url = format!("{}/orders/regular/{}", self.base_url, order_id);

            let mut form: Vec<(&str, String)> = Vec::new();
            if let Some(q) = params.quantity {
                form.push(("quantity", q.to_string()));
            }
            if let Some(p) = params.price {
                form.push(("price", format!("{p:.2}")));
            }
            if let Some(t) = params.trigger_price {
                form.push(("trigger_price", format!("{t:.2}")));
            }

            let resp = self
                .client
                .put(&url)
                .header("Authorization", auth)
                .header("X-Kite-Version", "3")
                .form(&form)
                .send()
                .await
                .map_err(|e| BrokerError::Transient(format!("modify_order failed: {e}")))?;

            Self::parse_envelope(resp).await.map(|_| ())
        })
        .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.with_retries("cancel_order", || async {
            let auth = self.auth_header()?;
            let url = format!("{}/orders/regular/{}", self.base_url, order_id);

            let resp = self
                .client
                .delete(&url)
                .header("Authorization", auth)
                .header("X-Kite-Version", "3")
                .send()
                .await
                .map_err(|e| BrokerError::Transient(format!("cancel_order failed: {e}")))?;

            Self::parse_envelope(resp).await.map(|_| ())
        })
        .await
    }

    async fn orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        self.with_retries("orders", || async {
            let data = self.get_json("/orders").await?;
            let list = data
                .as_array()
                .ok_or_else(|| BrokerError::Transient("orders response is not an array".into()))?;
            Ok(list.iter().filter_map(Self::parse_order).collect())
        })
        .await
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.with_retries("positions", || async {
            let data = self.get_json("/portfolio/positions").await?;
            let net = data["net"].as_array().cloned().unwrap_or_default();
            Ok(net
                .iter()
                .filter_map(|p| {
                    Some(BrokerPosition {
                        symbol: p["tradingsymbol"].as_str()?.to_string(),
                        net_quantity: p["quantity"].as_i64().unwrap_or(0),
                        average_price: p["average_price"].as_f64().unwrap_or(0.0),
                        pnl: p["pnl"].as_f64().unwrap_or(0.0),
                    })
                })
                .collect())
        })
        .await
    }

    async fn margins(&self) -> Result<Margin, BrokerError> {
        self.with_retries("margins", || async {
            let data = self.get_json("/user/margins/equity").await?;
            Ok(Margin {
                available_cash: data["available"]["live_balance"].as_f64().unwrap_or(0.0),
                used: data["utilised"]["debits"].as_f64().unwrap_or(0.0),
            })
        })
        .await
    }

    async fn option_chain(
        &self,
        underlying: &str,
        expiry: NaiveDate,
    ) -> Result<OptionChain, BrokerError> {
        self.with_retries("option_chain", || async {
            let path = format!(
                "/instruments/chain?underlying={}&expiry={}",
                underlying,
                expiry.format("%Y-%m-%d")
            );
            let data = self.get_json(&path).await?;

            let strikes = data["strikes"]
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .filter_map(|row| {
                            Some(ChainStrike {
                                strike: row["strike"].as_f64()?,
                                call_symbol: row["call_symbol"].as_str().map(str::to_string),
                                put_symbol: row["put_symbol"].as_str().map(str::to_string),
                                call_ltp: row["call_ltp"].as_f64(),
                                put_ltp: row["put_ltp"].as_f64(),
                                call_iv: row["call_iv"].as_f64(),
                                put_iv: row["put_iv"].as_f64(),
                                call_oi: row["call_oi"].as_f64(),
                                put_oi: row["put_oi"].as_f64(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            Ok(OptionChain {
                underlying: underlying.to_string(),
                expiry,
                spot: data["spot"].as_f64().unwrap_or(0.0),
                strikes,
            })
        })
        .await
    }

    async fn ltp(&self, symbols: &[String]) -> Result<HashMap<String, f64>, BrokerError> {
        self.with_retries("ltp", || async {
            let query: Vec<String> = symbols.iter().map(|s| format!("i=NSE:{s}")).collect();
            let path = format!("/quote/ltp?{}", query.join("&"));
            let data = self.get_json(&path).await?;

            let mut out = HashMap::new();
            if let Some(map) = data.as_object() {
                for (key, value) in map {
                    if let Some(price) = value["last_price"].as_f64() {
                        let symbol = key.split(':').next_back().unwrap_or(key).to_string();
                        out.insert(symbol, price);
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    async fn historical_bars(
        &self,
        symbol: &str,
        interval: BarInterval,
        days: u32,
    ) -> Result<Vec<Bar>, BrokerError> {
        self.with_retries("historical_bars", || async {
            let path = format!(
                "/instruments/historical/{}/{}?days={}",
                symbol, interval, days
            );
            let data = self.get_json(&path).await?;

            let candles = data["candles"].as_array().cloned().unwrap_or_default();
            let mut bars = Vec::with_capacity(candles.len());
            for row in &candles {
                let arr = match row.as_array() {
                    Some(a) if a.len() >= 6 => a,
                    _ => {
                        warn!(symbol, "skipping malformed historical candle row");
                        continue;
                    }
                };
                let ts = arr[0].as_i64().unwrap_or(0);
                bars.push(Bar {
                    start: Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now),
                    open: arr[1].as_f64().unwrap_or(0.0),
                    high: arr[2].as_f64().unwrap_or(0.0),
                    low: arr[3].as_f64().unwrap_or(0.0),
                    close: arr[4].as_f64().unwrap_or(0.0),
                    volume: arr[5].as_f64().unwrap_or(0.0),
                });
            }
            debug!(symbol, %interval, count = bars.len(), "historical bars fetched");
            Ok(bars)
        })
        .await
    }
}

impl std::fmt::Debug for RestBrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBrokerClient")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_parsing_maps_statuses() {
        let raw = serde_json::json!({
            "order_id": "230701000001",
            "client_order_id": "abc-123",
            "tradingsymbol": "RELIANCE",
            "transaction_type": "BUY",
            "quantity": 10,
            "filled_quantity": 10,
            "order_type": "SL-M",
            "price": 0.0,
            "trigger_price": 2475.0,
            "average_price": 0.0,
            "status": "TRIGGER PENDING",
            "tag": "momentum:abc-123",
            "order_timestamp": 1_700_000_000
        });
        let order = RestBrokerClient::parse_order(&raw).unwrap();
        assert_eq!(order.order_id, "230701000001");
        assert_eq!(order.order_type, OrderType::StopLossMarket);
        assert_eq!(order.status, OrderStatus::Triggered);
        assert_eq!(order.trigger_price, Some(2475.0));
        assert!(order.price.is_none());
        assert_eq!(order.tag, "momentum:abc-123");
    }

    #[test]
    fn unauthenticated_client_reports_auth_error() {
        let client = RestBrokerClient::new("key", "secret");
        assert!(matches!(client.auth_header(), Err(BrokerError::Auth(_))));
        client.restore_session("tok");
        assert_eq!(client.auth_header().unwrap(), "token key:tok");
    }
}
