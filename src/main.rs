// =============================================================================
// Vajra Intraday Engine — Main Entry Point
// =============================================================================
//
// The engine boots against the paper broker unless VAJRA_LIVE=1 and broker
// credentials are present. The orchestrator starts STOPPED; trading begins
// only on an explicit `POST /api/v1/control/start`.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vajra_bot::api;
use vajra_bot::app_state::AppState;
use vajra_bot::broker::{
    BrokerClient, OrderThrottle, PaperBroker, RestBrokerClient,
};
use vajra_bot::config::EngineConfig;
use vajra_bot::engine::reconcile::Reconciler;
use vajra_bot::engine::{Orchestrator, PositionMonitor, TradeEngine};
use vajra_bot::feed::{FeedIngestor, WsFeedTransport};
use vajra_bot::market_data::{BarInterval, MarketDataCache};
use vajra_bot::portfolio::{PortfolioGate, PositionTracker};
use vajra_bot::regime::RegimeEngine;
use vajra_bot::session;
use vajra_bot::signals::SignalDeduplicator;
use vajra_bot::store::{JsonlTradeStore, MemoryKvStore};
use vajra_bot::strategy::{
    AdaptiveController, ChainCache, MicrostructureScalper, MomentumStrategy, OptionsScalper,
    Strategy, StrategyWeights,
};
use vajra_bot::types::{InstrumentKind, SymbolMeta};

/// Closed bars retained per (symbol, interval) ring.
const RING_CAPACITY: usize = 500;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Vajra Intraday Engine — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load("engine_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // Universe override from env for quick experiments.
    if let Ok(symbols) = std::env::var("VAJRA_SYMBOLS") {
        config.universe = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    // Config invalid at startup is fatal.
    config.validate()?;

    info!(
        universe = ?config.universe,
        benchmark = %config.benchmark_symbol,
        capital = config.capital,
        "engine configured"
    );

    // ── 2. Market-data cache & symbol registry ───────────────────────────
    let cache = Arc::new(MarketDataCache::new(
        Duration::from_millis(config.stale_tick_ms),
        RING_CAPACITY,
    ));
    cache.register(SymbolMeta::equity(&config.benchmark_symbol));
    for symbol in &config.universe {
        cache.register(SymbolMeta::equity(symbol));
    }

    // ── 3. Broker ────────────────────────────────────────────────────────
    let live_mode = std::env::var("VAJRA_LIVE").map(|v| v == "1").unwrap_or(false);
    let raw_broker: Arc<dyn BrokerClient> = if live_mode {
        let api_key = std::env::var("VAJRA_BROKER_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("VAJRA_BROKER_API_SECRET").unwrap_or_default();
        let client = RestBrokerClient::new(api_key, api_secret);
        // The last session token survives restarts in the secret store; the
        // façade above the core refreshes it.
        if let Ok(token) = std::env::var("VAJRA_BROKER_ACCESS_TOKEN") {
            client.restore_session(token);
        }
        info!("live broker client configured");
        Arc::new(client)
    } else {
        info!("paper broker active (set VAJRA_LIVE=1 for live trading)");
        let paper = PaperBroker::new();
        paper.set_margin(config.capital, 0.0);
        Arc::new(paper)
    };
    let broker: Arc<dyn BrokerClient> = Arc::new(OrderThrottle::new(
        raw_broker,
        config.rate_limit_orders_per_sec,
        config.rate_limit_burst,
        Duration::from_millis(config.rate_limit_acquire_timeout_ms),
    ));
    let rate_limit_refill = Duration::from_secs_f64(
        config.rate_limit_burst / config.rate_limit_orders_per_sec,
    );

    // ── 4. Stores & shared components ────────────────────────────────────
    // The external idempotency KV adapter is deployed beside the engine; the
    // in-process store carries identical SETNX+TTL semantics and doubles as
    // the degraded-mode fallback.
    let kv = Arc::new(MemoryKvStore::new());
    let trades = Arc::new(JsonlTradeStore::new(&config.trade_log_path));

    let strategy_priority = vec![
        vajra_bot::strategy::momentum::STRATEGY_ID.to_string(),
        vajra_bot::strategy::options_scalper::STRATEGY_ID.to_string(),
        vajra_bot::strategy::microstructure::STRATEGY_ID.to_string(),
        vajra_bot::strategy::adaptive::STRATEGY_ID.to_string(),
    ];
    let dedup = Arc::new(SignalDeduplicator::new(
        kv,
        config.min_quality,
        &strategy_priority,
        Duration::from_secs(config.dedup_ttl_secs),
    ));

    let tracker = Arc::new(PositionTracker::new());
    let regime = Arc::new(RegimeEngine::new(&config.benchmark_symbol));
    let gate = PortfolioGate::new(&config);
    let weights = Arc::new(StrategyWeights::new());
    let chains = Arc::new(ChainCache::new());

    let engine = Arc::new(TradeEngine::new(
        broker.clone(),
        tracker.clone(),
        dedup.clone(),
        trades,
        cache.clone(),
        &config,
        rate_limit_refill,
    ));
    let monitor = Arc::new(PositionMonitor::new(
        broker.clone(),
        tracker.clone(),
        cache.clone(),
        dedup.clone(),
        &config,
    )?);
    let reconciler = Arc::new(Reconciler::new(
        broker.clone(),
        tracker.clone(),
        dedup.clone(),
        Duration::from_millis(config.reconcile_period_ms),
    ));

    // ── 5. Feed ingestor ─────────────────────────────────────────────────
    let feed_url = std::env::var("VAJRA_FEED_URL")
        .unwrap_or_else(|_| "wss://feed.vajra.internal/stream".to_string());
    let ingestor = Arc::new(FeedIngestor::new(
        cache.clone(),
        Arc::new(WsFeedTransport::new(feed_url)),
        config.skip_auto_init,
        Duration::from_millis(config.takeover_grace_ms),
        Duration::from_millis(config.feed_heartbeat_ms),
    ));

    // ── 6. Strategies (priority order) ───────────────────────────────────
    let strategies: Vec<Box<dyn Strategy>> = vec![
        Box::new(MomentumStrategy::new()),
        Box::new(OptionsScalper::new()),
        Box::new(MicrostructureScalper::new()),
        Box::new(AdaptiveController::new(weights.clone())),
    ];

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        cache.clone(),
        regime.clone(),
        dedup,
        gate,
        engine.clone(),
        tracker.clone(),
        weights.clone(),
        chains.clone(),
        ingestor.clone(),
        monitor.clone(),
        strategies,
    ));

    // ── 7. Historical preload ────────────────────────────────────────────
    // On restart the orchestrator is stateless: positions come back from the
    // broker, history comes back from preload.
    let mut preloaded = 0usize;
    for symbol in std::iter::once(&config.benchmark_symbol).chain(config.universe.iter()) {
        let mut ok = true;
        for interval in [BarInterval::M1, BarInterval::M5] {
            match broker.historical_bars(symbol, interval, config.warmup_days).await {
                Ok(bars) if !bars.is_empty() => {
                    if let Err(e) = cache.preload(symbol, interval, bars) {
                        warn!(symbol = %symbol, error = %e, "preload rejected");
                        ok = false;
                    }
                }
                Ok(_) => {
                    ok = false;
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "historical fetch failed");
                    ok = false;
                }
            }
        }
        if ok {
            preloaded += 1;
        } else if symbol == &config.benchmark_symbol && live_mode {
            // Benchmark history is load-bearing for the regime engine.
            error!("benchmark preload failed — orchestrator NOT_READY");
            orchestrator.set_not_ready(Some("benchmark history preload failed".to_string()));
        }
    }
    info!(
        preloaded,
        required = config.warmup_symbols_min,
        "warm-up preload complete"
    );
    // The paper broker serves no history; warm-up accrues from live bars
    // instead, so readiness gating applies to live mode only.
    if live_mode && preloaded < config.warmup_symbols_min && orchestrator.not_ready_reason().is_none()
    {
        orchestrator.set_not_ready(Some(format!(
            "only {preloaded} symbols preloaded (need {})",
            config.warmup_symbols_min
        )));
    }

    // Pull current broker positions so restarts resume supervision.
    match broker.positions().await {
        Ok(positions) => {
            let divergences = tracker.reconcile(&positions);
            if !divergences.is_empty() {
                warn!(count = divergences.len(), "broker positions found at startup");
            }
        }
        Err(e) => warn!(error = %e, "startup position rehydration failed"),
    }

    // ── 8. Shutdown channel & background tasks ───────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(ingestor.clone().run(shutdown_rx.clone()));
    tokio::spawn(
        monitor
            .clone()
            .run(shutdown_rx.clone(), config.flatten_on_shutdown),
    );
    tokio::spawn(reconciler.clone().run(shutdown_rx.clone()));
    tokio::spawn(orchestrator.clone().run(shutdown_rx.clone()));

    // Option-chain refresh for the index underlying.
    {
        let broker = broker.clone();
        let chains = chains.clone();
        let cache = cache.clone();
        let benchmark = config.benchmark_symbol.clone();
        let lot_size = config.index_option_lot_size;
        let period = Duration::from_millis(config.chain_refresh_ms);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expiry = session::next_weekly_expiry(
                            session::to_ist(chrono::Utc::now()).date_naive(),
                        );
                        match broker.option_chain(&benchmark, expiry).await {
                            Ok(chain) => {
                                for row in &chain.strikes {
                                    for symbol in [&row.call_symbol, &row.put_symbol].into_iter().flatten() {
                                        cache.register(SymbolMeta::option(
                                            symbol,
                                            InstrumentKind::IndexOption,
                                            lot_size,
                                        ));
                                    }
                                }
                                chains.update(chain);
                            }
                            Err(e) => {
                                warn!(underlying = %benchmark, error = %e, "chain refresh failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // ── 9. Control surface ───────────────────────────────────────────────
    let state = Arc::new(AppState {
        config: config.clone(),
        cache,
        regime,
        tracker,
        engine,
        monitor,
        ingestor,
        orchestrator: orchestrator.clone(),
        reconciler,
        weights,
        chains,
        start_time: std::time::Instant::now(),
    });

    let bind_addr =
        std::env::var("VAJRA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    {
        let app = api::rest::router(state);
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("failed to bind control surface");
            info!(addr = %bind_addr, "control surface listening");
            axum::serve(listener, app)
                .await
                .expect("control surface failed");
        });
    }

    info!("all subsystems running — POST /api/v1/control/start to begin trading");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    orchestrator.stop();
    let _ = shutdown_tx.send(true);
    // Let the orchestrator drain and the monitor run its shutdown pass.
    tokio::time::sleep(Duration::from_millis(config.drain_timeout_ms)).await;

    info!("Vajra Intraday Engine shut down complete.");
    Ok(())
}
