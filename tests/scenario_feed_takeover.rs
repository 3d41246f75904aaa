//! Graceful feed takeover: the provider reports "user already connected" on
//! the first connect; the ingestor opens a short-lived takeover session,
//! waits out the grace period, reconnects, and the orchestrator transitions
//! from NOT_READY to RUNNING once the first valid tick lands.

mod common;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::Rig;
use parking_lot::Mutex;
use tokio::sync::watch;

use vajra_bot::engine::Orchestrator;
use vajra_bot::feed::{FeedError, FeedEvent, FeedIngestor, FeedSession, FeedTransport};
use vajra_bot::market_data::Tick;
use vajra_bot::regime::RegimeEngine;
use vajra_bot::strategy::{ChainCache, Strategy, StrategyWeights};
use vajra_bot::types::EngineState;

const BENCHMARK: &str = "NIFTY 50";

struct ScriptedTransport {
    connects: Mutex<VecDeque<Result<Vec<FeedEvent>, ()>>>,
    takeovers: Mutex<u32>,
}

struct ScriptedSession {
    events: VecDeque<FeedEvent>,
}

#[async_trait]
impl FeedSession for ScriptedSession {
    async fn next_event(&mut self) -> Result<Option<FeedEvent>, FeedError> {
        match self.events.pop_front() {
            Some(event) => Ok(Some(event)),
            None => {
                // Stay connected, silently.
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

#[async_trait]
impl FeedTransport for ScriptedTransport {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, FeedError> {
        match self.connects.lock().pop_front() {
            Some(Ok(events)) => Ok(Box::new(ScriptedSession {
                events: events.into(),
            })),
            Some(Err(())) => Err(FeedError::AlreadyConnected),
            None => Err(FeedError::Transport("no more scripted sessions".into())),
        }
    }

    async fn open_takeover_session(&self) -> Result<(), FeedError> {
        *self.takeovers.lock() += 1;
        Ok(())
    }
}

fn benchmark_tick(ltp: f64) -> FeedEvent {
    FeedEvent::Tick {
        symbol: BENCHMARK.to_string(),
        tick: Tick {
            ltp,
            open: ltp,
            high: ltp,
            low: ltp,
            close_prev: ltp,
            volume: 1.0,
            bid: ltp - 0.05,
            ask: ltp + 0.05,
            oi: None,
            timestamp: Utc::now(),
        },
    }
}

#[tokio::test]
async fn takeover_then_running() {
    let rig = Rig::new();
    rig.register_equity(BENCHMARK);

    let takeover_grace = Duration::from_millis(30);
    let transport = Arc::new(ScriptedTransport {
        connects: Mutex::new(VecDeque::from([
            Err(()),
            Ok(vec![benchmark_tick(22_500.0)]),
        ])),
        takeovers: Mutex::new(0),
    });
    let ingestor = Arc::new(FeedIngestor::new(
        rig.cache.clone(),
        transport.clone(),
        false,
        takeover_grace,
        Duration::from_secs(30),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        rig.config.clone(),
        rig.cache.clone(),
        Arc::new(RegimeEngine::new(BENCHMARK)),
        rig.dedup.clone(),
        vajra_bot::portfolio::PortfolioGate::new(&rig.config),
        rig.engine.clone(),
        rig.tracker.clone(),
        Arc::new(StrategyWeights::new()),
        Arc::new(ChainCache::new()),
        ingestor.clone(),
        rig.monitor.clone(),
        Vec::<Box<dyn Strategy>>::new(),
    ));
    orchestrator.start().expect("subsystems ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let feed_task = tokio::spawn(ingestor.clone().run(shutdown_rx));

    // While the takeover is in flight the orchestrator stays degraded.
    orchestrator.tick(rig.trading_hours()).await;
    assert_eq!(orchestrator.engine_state(), EngineState::NotReady);

    // The first valid tick must arrive within grace + slack.
    let deadline = tokio::time::Instant::now() + takeover_grace + Duration::from_secs(5);
    loop {
        if rig.cache.latest(BENCHMARK).is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tick did not arrive within takeover_grace + 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(*transport.takeovers.lock(), 1, "exactly one takeover session");
    assert!(ingestor.is_connected());

    // Next orchestrator tick sees a healthy feed and fresh benchmark data.
    orchestrator.tick(rig.trading_hours()).await;
    assert_eq!(orchestrator.engine_state(), EngineState::Running);

    shutdown_tx.send(true).unwrap();
    let _ = feed_task.await;
}
