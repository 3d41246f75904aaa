// =============================================================================
// Shared scenario fixtures — paper-broker rig
// =============================================================================

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use vajra_bot::broker::{BrokerClient, OrderThrottle, PaperBroker};
use vajra_bot::config::EngineConfig;
use vajra_bot::engine::reconcile::Reconciler;
use vajra_bot::engine::{PositionMonitor, TradeEngine};
use vajra_bot::market_data::{MarketDataCache, Tick};
use vajra_bot::portfolio::{PortfolioGate, PositionTracker};
use vajra_bot::session;
use vajra_bot::signals::{Signal, SignalDeduplicator};
use vajra_bot::store::{MemoryKvStore, MemoryTradeStore};
use vajra_bot::types::{InstrumentKind, SymbolMeta, TradeAction};

/// Full submission-to-supervision stack over a deterministic paper broker.
pub struct Rig {
    pub broker: Arc<PaperBroker>,
    pub shared: Arc<dyn BrokerClient>,
    pub cache: Arc<MarketDataCache>,
    pub tracker: Arc<PositionTracker>,
    pub kv: Arc<MemoryKvStore>,
    pub dedup: Arc<SignalDeduplicator>,
    pub gate: PortfolioGate,
    pub engine: Arc<TradeEngine>,
    pub monitor: Arc<PositionMonitor>,
    pub reconciler: Arc<Reconciler>,
    pub trades: Arc<MemoryTradeStore>,
    pub config: EngineConfig,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_capital(500_000.0)
    }

    pub fn with_capital(capital: f64) -> Self {
        let mut config = EngineConfig::default();
        config.capital = capital;
        config.inter_order_delay_ms = 0;
        config.fill_confirm_timeout_ms = 500;

        let broker = Arc::new(PaperBroker::new());
        broker.set_margin(capital, 0.0);
        let shared: Arc<dyn BrokerClient> = Arc::new(OrderThrottle::new(
            broker.clone(),
            config.rate_limit_orders_per_sec,
            config.rate_limit_burst,
            Duration::from_millis(config.rate_limit_acquire_timeout_ms),
        ));

        let cache = Arc::new(MarketDataCache::new(
            Duration::from_millis(config.stale_tick_ms),
            500,
        ));
        let tracker = Arc::new(PositionTracker::new());
        let kv = Arc::new(MemoryKvStore::new());
        let dedup = Arc::new(SignalDeduplicator::new(
            kv.clone(),
            config.min_quality,
            &["momentum".to_string(), "microstructure".to_string()],
            Duration::from_secs(config.dedup_ttl_secs),
        ));
        let gate = PortfolioGate::new(&config);
        let trades = Arc::new(MemoryTradeStore::new());

        let engine = Arc::new(TradeEngine::new(
            shared.clone(),
            tracker.clone(),
            dedup.clone(),
            trades.clone(),
            cache.clone(),
            &config,
            Duration::from_millis(10),
        ));
        let monitor = Arc::new(
            PositionMonitor::new(
                shared.clone(),
                tracker.clone(),
                cache.clone(),
                dedup.clone(),
                &config,
            )
            .expect("monitor config valid"),
        );
        let reconciler = Arc::new(Reconciler::new(
            shared.clone(),
            tracker.clone(),
            dedup.clone(),
            Duration::from_millis(config.reconcile_period_ms),
        ));

        Self {
            broker,
            shared,
            cache,
            tracker,
            kv,
            dedup,
            gate,
            engine,
            monitor,
            reconciler,
            trades,
            config,
        }
    }

    pub fn register_equity(&self, symbol: &str) {
        self.cache.register(SymbolMeta::equity(symbol));
    }

    pub fn register_option(&self, symbol: &str, kind: InstrumentKind, lot_size: u32) {
        self.cache.register(SymbolMeta::option(symbol, kind, lot_size));
    }

    /// Push a live tick (stamped now, so freshness checks pass) and mirror
    /// the LTP on the paper broker.
    pub fn tick(&self, symbol: &str, ltp: f64) {
        self.cache.put_tick(
            symbol,
            Tick {
                ltp,
                open: ltp,
                high: ltp,
                low: ltp,
                close_prev: ltp,
                volume: 100.0,
                bid: ltp - 0.05,
                ask: ltp + 0.05,
                oi: None,
                timestamp: Utc::now(),
            },
        );
        self.broker.set_ltp(symbol, ltp);
    }

    pub fn entry_signal(
        &self,
        symbol: &str,
        action: TradeAction,
        entry: f64,
        stop: f64,
        target: f64,
        quantity: u32,
        confidence: f64,
    ) -> Signal {
        Signal::entry(
            symbol,
            action,
            entry,
            stop,
            target,
            quantity,
            confidence,
            "momentum",
            Utc::now(),
        )
    }

    /// A weekday timestamp comfortably inside the trading session.
    pub fn trading_hours(&self) -> DateTime<Utc> {
        session::ist_datetime(2025, 7, 1, 11, 0)
    }

    /// Past the mandatory square-off boundary.
    pub fn after_square_off(&self) -> DateTime<Utc> {
        session::ist_datetime(2025, 7, 1, 15, 21)
    }
}
