// =============================================================================
// MarketDataCache — authoritative latest tick per symbol + history rings
// =============================================================================
//
// The single source of market truth for the engine. Writers are the feed
// ingestor (`put_tick`) and the startup preload routine (`preload`); everyone
// else reads.
//
// Concurrency: the latest tick per symbol is an `Arc<Tick>` swapped under a
// short write lock, so readers clone a pointer and never copy the payload.
// History rings are rebuilt copy-on-write on append; `history` readers clone
// out of the shared `Arc` without holding the map lock across the copy.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::SymbolMeta;

use super::{Bar, BarInterval, HistoryRing, Tick};

/// Typed failures surfaced by the cache.
#[derive(Debug, Error, PartialEq)]
pub enum CacheError {
    #[error("requested {requested} bars but ring capacity is {capacity}")]
    Capacity { requested: usize, capacity: usize },

    #[error("symbol {0} has already accepted live ticks; preload refused")]
    AlreadyLive(String),

    #[error("symbol {0} is not registered")]
    UnknownSymbol(String),
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct RingKey {
    symbol: String,
    interval: BarInterval,
}

/// Thread-safe snapshot cache for the active universe.
pub struct MarketDataCache {
    symbols: RwLock<HashMap<String, SymbolMeta>>,
    latest: RwLock<HashMap<String, Arc<Tick>>>,
    rings: RwLock<HashMap<RingKey, Arc<RwLock<HistoryRing>>>>,
    /// Symbols that have accepted at least one live tick. Preload refuses to
    /// rewrite history once a symbol appears here.
    live: RwLock<HashSet<String>>,
    /// Age beyond which `latest` readings must be treated as unusable.
    stale_after: Duration,
    ring_capacity: usize,
}

impl MarketDataCache {
    pub fn new(stale_after: Duration, ring_capacity: usize) -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
            rings: RwLock::new(HashMap::new()),
            live: RwLock::new(HashSet::new()),
            stale_after,
            ring_capacity,
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register a symbol and create its bar rings. Registering the same
    /// symbol twice is a no-op; contract data is immutable once set.
    pub fn register(&self, meta: SymbolMeta) {
        let mut symbols = self.symbols.write();
        if symbols.contains_key(&meta.symbol) {
            return;
        }
        let mut rings = self.rings.write();
        for interval in [BarInterval::M1, BarInterval::M5] {
            rings.insert(
                RingKey {
                    symbol: meta.symbol.clone(),
                    interval,
                },
                Arc::new(RwLock::new(HistoryRing::new(interval, self.ring_capacity))),
            );
        }
        debug!(symbol = %meta.symbol, segment = %meta.segment, "symbol registered");
        symbols.insert(meta.symbol.clone(), meta);
    }

    pub fn meta(&self, symbol: &str) -> Option<SymbolMeta> {
        self.symbols.read().get(symbol).cloned()
    }

    pub fn registered_symbols(&self) -> Vec<String> {
        self.symbols.read().keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Overwrite the latest tick and feed the bar aggregators. Unknown
    /// symbols are dropped silently (the feed may carry more than we watch).
    pub fn put_tick(&self, symbol: &str, tick: Tick) {
        if !self.symbols.read().contains_key(symbol) {
            return;
        }

        let tick = Arc::new(tick);
        self.latest
            .write()
            .insert(symbol.to_string(), Arc::clone(&tick));
        self.live.write().insert(symbol.to_string());

        for interval in [BarInterval::M1, BarInterval::M5] {
            if let Some(ring) = self.ring(symbol, interval) {
                ring.write().apply_tick(&tick);
            }
        }
    }

    /// Append a feed-closed bar directly (bar update messages).
    pub fn put_bar(&self, symbol: &str, interval: BarInterval, bar: Bar) {
        if let Some(ring) = self.ring(symbol, interval) {
            ring.write().push_closed(bar);
        }
    }

    /// One-shot history initialisation from a historical query. Idempotent
    /// per symbol; refuses once live ticks have been accepted so that a
    /// restart cannot rewrite observed history.
    pub fn preload(
        &self,
        symbol: &str,
        interval: BarInterval,
        bars: Vec<Bar>,
    ) -> Result<(), CacheError> {
        if !self.symbols.read().contains_key(symbol) {
            return Err(CacheError::UnknownSymbol(symbol.to_string()));
        }
        if self.live.read().contains(symbol) {
            return Err(CacheError::AlreadyLive(symbol.to_string()));
        }
        let ring = self
            .ring(symbol, interval)
            .ok_or_else(|| CacheError::UnknownSymbol(symbol.to_string()))?;
        let mut guard = ring.write();
        if !guard.is_empty() {
            // Second preload for the same ring: keep the first.
            debug!(symbol, %interval, "preload skipped — ring already seeded");
            return Ok(());
        }
        let count = bars.len();
        guard.seed(bars);
        debug!(symbol, %interval, bars = count, "history preloaded");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Latest tick and its age. Callers must treat an age above the staleness
    /// threshold as unusable; `is_fresh` encodes that check.
    pub fn latest(&self, symbol: &str) -> Option<(Arc<Tick>, Duration)> {
        let tick = self.latest.read().get(symbol).cloned()?;
        let age = (Utc::now() - tick.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Some((tick, age))
    }

    /// Latest tick only if it is within the staleness threshold.
    pub fn fresh(&self, symbol: &str) -> Option<Arc<Tick>> {
        let (tick, age) = self.latest(symbol)?;
        if age > self.stale_after {
            warn!(symbol, age_ms = age.as_millis() as u64, "tick is stale");
            return None;
        }
        Some(tick)
    }

    /// Point-in-time consistent view of `symbols`: all reads happen under one
    /// lock acquisition. Missing symbols are omitted.
    pub fn snapshot(&self, symbols: &[String]) -> HashMap<String, Arc<Tick>> {
        let latest = self.latest.read();
        symbols
            .iter()
            .filter_map(|s| latest.get(s).map(|t| (s.clone(), Arc::clone(t))))
            .collect()
    }

    /// The most recent `n` closed bars for a symbol, oldest first.
    pub fn history(
        &self,
        symbol: &str,
        interval: BarInterval,
        n: usize,
    ) -> Result<Vec<Bar>, CacheError> {
        if n > self.ring_capacity {
            return Err(CacheError::Capacity {
                requested: n,
                capacity: self.ring_capacity,
            });
        }
        let ring = self
            .ring(symbol, interval)
            .ok_or_else(|| CacheError::UnknownSymbol(symbol.to_string()))?;
        let recent = ring.read().recent(n);
        Ok(recent)
    }

    /// Number of closed bars currently held for a symbol/interval.
    pub fn bars_available(&self, symbol: &str, interval: BarInterval) -> usize {
        self.ring(symbol, interval)
            .map(|r| r.read().len())
            .unwrap_or(0)
    }

    /// Age of the latest tick, in milliseconds, per registered symbol.
    pub fn tick_ages_ms(&self, as_of: DateTime<Utc>) -> HashMap<String, Option<u64>> {
        let latest = self.latest.read();
        self.symbols
            .read()
            .keys()
            .map(|s| {
                let age = latest
                    .get(s)
                    .map(|t| (as_of - t.timestamp).num_milliseconds().max(0) as u64);
                (s.clone(), age)
            })
            .collect()
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    fn ring(&self, symbol: &str, interval: BarInterval) -> Option<Arc<RwLock<HistoryRing>>> {
        self.rings
            .read()
            .get(&RingKey {
                symbol: symbol.to_string(),
                interval,
            })
            .cloned()
    }
}

impl std::fmt::Debug for MarketDataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataCache")
            .field("symbols", &self.symbols.read().len())
            .field("live", &self.live.read().len())
            .field("stale_after", &self.stale_after)
            .finish()
    }
}
