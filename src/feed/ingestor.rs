// =============================================================================
// FeedIngestor — connection state machine feeding the market-data cache
// =============================================================================
//
// States:
//
//   DISCONNECTED ─connect→ CONNECTING ─ok→ CONNECTED ─tick→ CONNECTED
//        ▲                     │                 │
//        │                     └err→ BACKOFF ────┘ (delay, jitter, cap 60 s)
//        │
//        └── "user already connected" → graceful takeover → reconnect
//            (3 consecutive takeover failures → DORMANT until an operator
//             issues force_reconnect)
//
// `skip_auto_init` starts the ingestor DISCONNECTED; it only moves on an
// explicit command. This is the break-glass path for deploy overlap.
//
// Heartbeat: no event for `data_timeout` forces a reconnect. Cancellation
// interrupts both the network read and the backoff sleep; cache writes are
// non-blocking and always complete.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::market_data::MarketDataCache;

use super::{FeedError, FeedEvent, FeedSession, FeedTransport};

/// Initial reconnect delay.
const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
/// Reconnect delay cap.
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Consecutive takeover failures before falling dormant.
const MAX_TAKEOVER_FAILURES: u32 = 3;

/// Connection lifecycle states, exposed through `status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    /// Takeovers kept failing; only operator intervention reconnects.
    Dormant,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Backoff => write!(f, "BACKOFF"),
            Self::Dormant => write!(f, "DORMANT"),
        }
    }
}

/// The reconnecting push client. One instance per process, spawned as a
/// long-lived task via [`FeedIngestor::run`].
pub struct FeedIngestor {
    cache: Arc<MarketDataCache>,
    transport: Arc<dyn FeedTransport>,
    state: RwLock<FeedState>,
    skip_auto_init: AtomicBool,
    /// Signalled by `force_reconnect` / `connect_now`.
    kick: Notify,
    reconnect_requested: AtomicBool,
    takeover_failures: AtomicU32,
    last_event_at: RwLock<Option<Instant>>,
    takeover_grace: Duration,
    data_timeout: Duration,
}

impl FeedIngestor {
    pub fn new(
        cache: Arc<MarketDataCache>,
        transport: Arc<dyn FeedTransport>,
        skip_auto_init: bool,
        takeover_grace: Duration,
        data_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            transport,
            state: RwLock::new(FeedState::Disconnected),
            skip_auto_init: AtomicBool::new(skip_auto_init),
            kick: Notify::new(),
            reconnect_requested: AtomicBool::new(false),
            takeover_failures: AtomicU32::new(0),
            last_event_at: RwLock::new(None),
            takeover_grace,
            data_timeout,
        }
    }

    // -------------------------------------------------------------------------
    // Control surface
    // -------------------------------------------------------------------------

    pub fn state(&self) -> FeedState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == FeedState::Connected
    }

    /// Age of the last received event, if any.
    pub fn last_event_age(&self) -> Option<Duration> {
        self.last_event_at.read().map(|t| t.elapsed())
    }

    /// Drop the current session (if any) and run the takeover + reconnect
    /// path. Also wakes a DORMANT or skip-auto-init ingestor.
    pub fn force_reconnect(&self) {
        info!("feed force-reconnect requested");
        self.takeover_failures.store(0, Ordering::Relaxed);
        self.reconnect_requested.store(true, Ordering::Relaxed);
        self.kick.notify_waiters();
    }

    pub fn set_skip_auto_init(&self, value: bool) {
        self.skip_auto_init.store(value, Ordering::Relaxed);
        if !value {
            self.kick.notify_waiters();
        }
    }

    fn set_state(&self, state: FeedState) {
        let mut guard = self.state.write();
        if *guard != state {
            info!(from = %*guard, to = %state, "feed state transition");
            *guard = state;
        }
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Run until `shutdown` fires. Spawn as a background task.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = BACKOFF_FLOOR;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Break-glass hold: stay DISCONNECTED until explicitly kicked.
            if self.skip_auto_init.load(Ordering::Relaxed)
                && !self.reconnect_requested.load(Ordering::Relaxed)
            {
                self.set_state(FeedState::Disconnected);
                tokio::select! {
                    _ = self.kick.notified() => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            }
            self.reconnect_requested.store(false, Ordering::Relaxed);

            self.set_state(FeedState::Connecting);
            match self.transport.connect().await {
                Ok(session) => {
                    self.set_state(FeedState::Connected);
                    self.takeover_failures.store(0, Ordering::Relaxed);
                    backoff = BACKOFF_FLOOR;

                    self.read_session(session, &mut shutdown).await;
                    if *shutdown.borrow() {
                        break;
                    }
                    // Session ended; reconnect promptly.
                    self.set_state(FeedState::Backoff);
                    if !Self::sleep_or_shutdown(BACKOFF_FLOOR, &mut shutdown).await {
                        break;
                    }
                }
                Err(FeedError::AlreadyConnected) => {
                    if !self.attempt_takeover(&mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, delay_ms = backoff.as_millis() as u64, "feed connect failed — backing off");
                    self.set_state(FeedState::Backoff);
                    if !Self::sleep_or_shutdown(with_jitter(backoff), &mut shutdown).await {
                        break;
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }

        self.set_state(FeedState::Disconnected);
        info!("feed ingestor stopped");
    }

    /// Consume events until error, stream end, heartbeat expiry, reconnect
    /// request, or shutdown.
    async fn read_session(
        &self,
        mut session: Box<dyn FeedSession>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        *self.last_event_at.write() = Some(Instant::now());

        loop {
            tokio::select! {
                event = tokio::time::timeout(self.data_timeout, session.next_event()) => {
                    match event {
                        Ok(Ok(Some(event))) => {
                            *self.last_event_at.write() = Some(Instant::now());
                            self.apply(event);
                        }
                        Ok(Ok(None)) => {
                            warn!("feed stream ended by provider");
                            return;
                        }
                        Ok(Err(e)) => {
                            error!(error = %e, "feed read error");
                            return;
                        }
                        Err(_) => {
                            warn!(
                                timeout_ms = self.data_timeout.as_millis() as u64,
                                "no feed data within heartbeat window — forcing reconnect"
                            );
                            return;
                        }
                    }
                }
                _ = self.kick.notified() => {
                    if self.reconnect_requested.load(Ordering::Relaxed) {
                        info!("dropping session for forced reconnect");
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    return;
                }
            }
        }
    }

    fn apply(&self, event: FeedEvent) {
        match event {
            FeedEvent::Tick { symbol, tick } => {
                debug!(symbol = %symbol, ltp = tick.ltp, "tick");
                self.cache.put_tick(&symbol, tick);
            }
            FeedEvent::Bar {
                symbol,
                interval,
                bar,
            } => {
                self.cache.put_bar(&symbol, interval, bar);
            }
        }
    }

    /// One graceful takeover: open the evicting session, wait out the grace
    /// period, then let the main loop reconnect. Returns `false` on shutdown.
    async fn attempt_takeover(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let failures = self.takeover_failures.load(Ordering::Relaxed);
        if failures >= MAX_TAKEOVER_FAILURES {
            error!(
                failures,
                "takeover failed repeatedly — feed dormant until operator intervenes"
            );
            self.set_state(FeedState::Dormant);
            loop {
                tokio::select! {
                    _ = self.kick.notified() => {
                        if self.reconnect_requested.load(Ordering::Relaxed) {
                            return true;
                        }
                    }
                    _ = shutdown.changed() => return false,
                }
            }
        }

        warn!(attempt = failures + 1, "provider reports user already connected — attempting graceful takeover");
        match self.transport.open_takeover_session().await {
            Ok(()) => {
                info!(
                    grace_ms = self.takeover_grace.as_millis() as u64,
                    "takeover session opened — waiting grace period"
                );
            }
            Err(e) => {
                warn!(error = %e, "takeover session failed");
                self.takeover_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        Self::sleep_or_shutdown(self.takeover_grace, shutdown).await
    }

    /// Returns `false` when shutdown fired during the sleep.
    async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }
}

/// Up to +30% random jitter so reconnecting instances do not stampede.
fn with_jitter(base: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.3);
    base.mul_f64(factor)
}

impl std::fmt::Debug for FeedIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedIngestor")
            .field("state", &self.state())
            .field("takeover_failures", &self.takeover_failures.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Tick;
    use crate::types::SymbolMeta;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    /// Scripted transport: a queue of connect outcomes, each either a failure
    /// or a finite list of events.
    struct ScriptedTransport {
        connects: Mutex<std::collections::VecDeque<Result<Vec<FeedEvent>, FeedErrorKind>>>,
        takeovers: Mutex<u32>,
    }

    enum FeedErrorKind {
        Already,
        Transport,
    }

    struct ScriptedSession {
        events: std::collections::VecDeque<FeedEvent>,
    }

    #[async_trait]
    impl FeedSession for ScriptedSession {
        async fn next_event(&mut self) -> Result<Option<FeedEvent>, FeedError> {
            match self.events.pop_front() {
                Some(e) => Ok(Some(e)),
                None => Ok(None),
            }
        }
    }

    #[async_trait]
    impl FeedTransport for ScriptedTransport {
        async fn connect(&self) -> Result<Box<dyn FeedSession>, FeedError> {
            let popped = self.connects.lock().pop_front();
            match popped {
                Some(Ok(events)) => Ok(Box::new(ScriptedSession {
                    events: events.into(),
                })),
                Some(Err(FeedErrorKind::Already)) => Err(FeedError::AlreadyConnected),
                Some(Err(FeedErrorKind::Transport)) => {
                    Err(FeedError::Transport("scripted".into()))
                }
                None => {
                    // No more scripted sessions: park forever.
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn open_takeover_session(&self) -> Result<(), FeedError> {
            *self.takeovers.lock() += 1;
            Ok(())
        }
    }

    fn tick(ltp: f64) -> FeedEvent {
        FeedEvent::Tick {
            symbol: "RELIANCE".to_string(),
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

    fn build(
        connects: Vec<Result<Vec<FeedEvent>, FeedErrorKind>>,
        skip_auto_init: bool,
    ) -> (Arc<FeedIngestor>, Arc<MarketDataCache>, Arc<ScriptedTransport>) {
        let cache = Arc::new(MarketDataCache::new(Duration::from_secs(3600), 100));
        cache.register(SymbolMeta::equity("RELIANCE"));
        let transport = Arc::new(ScriptedTransport {
            connects: Mutex::new(connects.into()),
            takeovers: Mutex::new(0),
        });
        let ingestor = Arc::new(FeedIngestor::new(
            cache.clone(),
            transport.clone(),
            skip_auto_init,
            Duration::from_millis(20),
            Duration::from_secs(30),
        ));
        (ingestor, cache, transport)
    }

    #[tokio::test]
    async fn ticks_land_in_cache() {
        let (ingestor, cache, _) = build(vec![Ok(vec![tick(2500.0), tick(2501.0)])], false);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(ingestor.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let _ = handle.await;

        let (latest, _) = cache.latest("RELIANCE").unwrap();
        assert!((latest.ltp - 2501.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn already_connected_triggers_takeover_then_connects() {
        let (ingestor, cache, transport) = build(
            vec![Err(FeedErrorKind::Already), Ok(vec![tick(2500.0)])],
            false,
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(ingestor.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let _ = handle.await;

        assert_eq!(*transport.takeovers.lock(), 1);
        assert!(cache.latest("RELIANCE").is_some());
    }

    #[tokio::test]
    async fn skip_auto_init_stays_disconnected_until_kicked() {
        let (ingestor, cache, _) = build(vec![Ok(vec![tick(2500.0)])], true);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(ingestor.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ingestor.state(), FeedState::Disconnected);
        assert!(cache.latest("RELIANCE").is_none());

        ingestor.force_reconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.latest("RELIANCE").is_some());

        tx.send(true).unwrap();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn transport_errors_back_off_and_recover() {
        let (ingestor, cache, _) = build(
            vec![Err(FeedErrorKind::Transport), Ok(vec![tick(2500.0)])],
            false,
        );
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(ingestor.clone().run(rx));
        // First backoff is ~1s + jitter.
        tokio::time::sleep(Duration::from_millis(1600)).await;
        tx.send(true).unwrap();
        let _ = handle.await;

        assert!(cache.latest("RELIANCE").is_some());
    }
}
