// =============================================================================
// Order rate limiting — token bucket + throttled broker wrapper
// =============================================================================
//
// The broker tolerates at most 7 order operations per second sustained, with
// short bursts to 9. The bucket replenishes continuously; `place_order`,
// `modify_order`, and `cancel_order` all draw from the same bucket. A caller
// that finds the bucket empty blocks up to `acquire_timeout` and then fails
// with `BrokerError::RateLimited`.
//
// Telemetry: a rolling one-second window counts completed acquisitions. At a
// sustained 7/s the wrapper logs a warning; at 9/s it logs a critical error.
// =============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::market_data::Bar;

use super::{
    BrokerClient, BrokerError, BrokerOrder, BrokerPosition, Margin, ModifyParams, OptionChain,
    OrderParams,
};

/// Continuous-replenish token bucket.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available. Returns the wait until the next token
    /// otherwise.
    fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate))
        }
    }

    /// Block until a token is available or `timeout` elapses.
    pub async fn acquire(&self, timeout: Duration) -> Result<(), BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    let now = Instant::now();
                    if now + wait > deadline {
                        return Err(BrokerError::RateLimited);
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Time for an empty bucket to refill completely. The trade engine waits
    /// this long before its single rate-limit retry.
    pub fn full_refill(&self) -> Duration {
        Duration::from_secs_f64(self.burst / self.rate)
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .field("tokens", &self.state.lock().tokens)
            .finish()
    }
}

/// Rolling one-second acquisition counter driving the telemetry thresholds.
struct RollingWindow {
    events: VecDeque<Instant>,
}

impl RollingWindow {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }

    fn record(&mut self, now: Instant) -> usize {
        self.events.push_back(now);
        let cutoff = now - Duration::from_secs(1);
        while matches!(self.events.front(), Some(&t) if t < cutoff) {
            self.events.pop_front();
        }
        self.events.len()
    }
}

/// `BrokerClient` wrapper serialising order operations through the bucket.
/// Read-only calls pass through untouched.
pub struct OrderThrottle<B> {
    inner: B,
    bucket: TokenBucket,
    acquire_timeout: Duration,
    warn_per_sec: usize,
    critical_per_sec: usize,
    window: Mutex<RollingWindow>,
}

impl<B> OrderThrottle<B> {
    pub fn new(inner: B, rate: f64, burst: f64, acquire_timeout: Duration) -> Self {
        Self {
            inner,
            bucket: TokenBucket::new(rate, burst),
            acquire_timeout,
            warn_per_sec: rate.floor() as usize,
            critical_per_sec: burst.floor() as usize,
            window: Mutex::new(RollingWindow::new()),
        }
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn admit(&self) -> Result<(), BrokerError> {
        self.bucket.acquire(self.acquire_timeout).await?;

        let count = self.window.lock().record(Instant::now());
        if count >= self.critical_per_sec {
            error!(
                per_sec = count,
                limit = self.critical_per_sec,
                "order rate at hard limit"
            );
        } else if count >= self.warn_per_sec {
            warn!(
                per_sec = count,
                limit = self.warn_per_sec,
                "order rate at sustained soft limit"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<B: BrokerClient> BrokerClient for OrderThrottle<B> {
    async fn place_order(&self, params: &OrderParams) -> Result<String, BrokerError> {
        self.admit().await?;
        self.inner.place_order(params).await
    }

    async fn modify_order(&self, order_id: &str, params: &ModifyParams) -> Result<(), BrokerError> {
        self.admit().await?;
        self.inner.modify_order(order_id, params).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.admit().await?;
        self.inner.cancel_order(order_id).await
    }

    async fn orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        self.inner.orders().await
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.inner.positions().await
    }

    async fn margins(&self) -> Result<Margin, BrokerError> {
        self.inner.margins().await
    }

    async fn option_chain(
        &self,
        underlying: &str,
        expiry: NaiveDate,
    ) -> Result<OptionChain, BrokerError> {
        self.inner.option_chain(underlying, expiry).await
    }

    async fn ltp(&self, symbols: &[String]) -> Result<HashMap<String, f64>, BrokerError> {
        self.inner.ltp(symbols).await
    }

    async fn historical_bars(
        &self,
        symbol: &str,
        interval: crate::market_data::BarInterval,
        days: u32,
    ) -> Result<Vec<Bar>, BrokerError> {
        self.inner.historical_bars(symbol, interval, days).await
    }
}

impl<B> std::fmt::Debug for OrderThrottle<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderThrottle")
            .field("bucket", &self.bucket)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

/// Helper used by tests and the engine: shared throttle over an arc'd client.
pub type SharedBroker = Arc<dyn BrokerClient>;
