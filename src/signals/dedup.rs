// =============================================================================
// Signal Deduplicator — idempotency, quality, and symbol-level filtering
// =============================================================================
//
// Three stages for an entry-signal batch, applied in order:
//
//   1. History check   — `dedup:{date}:{symbol}:{action}` present in the KV
//                        store means the same entry already executed today.
//   2. Quality filter  — composite quality below the per-strategy effective
//                        threshold drops the signal.
//   3. Symbol dedup    — at most one survivor per symbol per cycle; highest
//                        confidence wins, ties broken by earlier generated_at,
//                        then by configured strategy priority.
//
// Bypass rule: any signal with `management_action` or `closing_action` skips
// all three stages untouched, and multiple same-symbol management signals in
// one cycle are all retained. Partial bookings and square-offs must never be
// blocked by idempotency logic.
//
// The KV store being unreachable downgrades to an in-process dedup map with
// a visible warning; the pipeline never stalls on the store.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::market_data::{BarInterval, MarketDataCache};
use crate::regime::RegimeSnapshot;
use crate::store::kv::{dedup_key, KvStore, MemoryKvStore};

use super::quality::{QualityInputs, QualityScorer};
use super::Signal;

/// Outcomes window per strategy feeding the adaptive threshold.
const PERFORMANCE_WINDOW: usize = 100;
/// Minimum recorded outcomes before the multiplier deviates from 1.0.
const PERFORMANCE_MIN_SAMPLES: usize = 20;
/// KV operation budget per attempt.
const KV_TIMEOUT: Duration = Duration::from_millis(500);

/// Why a signal was dropped. Serialised into telemetry counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DropReason {
    DuplicateToday,
    QualityBelowThreshold { score: f64, threshold: f64 },
    SymbolConflict,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateToday => write!(f, "DUPLICATE_TODAY"),
            Self::QualityBelowThreshold { .. } => write!(f, "QUALITY_BELOW_THRESHOLD"),
            Self::SymbolConflict => write!(f, "SYMBOL_CONFLICT"),
        }
    }
}

/// Result of one batch pass.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub passed: Vec<Signal>,
    pub dropped: Vec<(Signal, DropReason)>,
}

#[derive(Debug, Default)]
struct PerformanceWindow {
    outcomes: std::collections::VecDeque<bool>,
}

impl PerformanceWindow {
    fn record(&mut self, win: bool) {
        self.outcomes.push_back(win);
        while self.outcomes.len() > PERFORMANCE_WINDOW {
            self.outcomes.pop_front();
        }
    }

    fn win_rate(&self) -> Option<f64> {
        if self.outcomes.len() < PERFORMANCE_MIN_SAMPLES {
            return None;
        }
        let wins = self.outcomes.iter().filter(|&&w| w).count();
        Some(wins as f64 / self.outcomes.len() as f64)
    }
}

/// The C5 pipeline. Shared across the orchestrator and trade engine.
pub struct SignalDeduplicator {
    kv: Arc<dyn KvStore>,
    /// Degraded-mode fallback holding the same keys with the same TTLs.
    local: MemoryKvStore,
    scorer: QualityScorer,
    perf: RwLock<HashMap<String, PerformanceWindow>>,
    /// Base composite-quality threshold before the win-rate multiplier.
    min_quality: f64,
    /// Lower index = higher priority; used only for exact ties.
    priorities: HashMap<String, usize>,
    dedup_ttl: Duration,
}

impl SignalDeduplicator {
    pub fn new(
        kv: Arc<dyn KvStore>,
        min_quality: f64,
        strategy_priority: &[String],
        dedup_ttl: Duration,
    ) -> Self {
        let priorities = strategy_priority
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();
        Self {
            kv,
            local: MemoryKvStore::new(),
            scorer: QualityScorer,
            perf: RwLock::new(HashMap::new()),
            min_quality,
            priorities,
            dedup_ttl,
        }
    }

    // -------------------------------------------------------------------------
    // Batch filtering
    // -------------------------------------------------------------------------

    /// Run the full pipeline over one cycle's batch. Relative order of the
    /// input is preserved among survivors.
    pub async fn filter(
        &self,
        date: NaiveDate,
        batch: Vec<Signal>,
        cache: &MarketDataCache,
        regime: RegimeSnapshot,
    ) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        let mut entries: Vec<Signal> = Vec::new();

        // Management/closing signals pass through before any stage runs.
        for signal in batch {
            if signal.bypasses_filters() {
                outcome.passed.push(signal);
            } else {
                entries.push(signal);
            }
        }

        // --- Stage 1: same-day execution history --------------------------
        let mut fresh: Vec<Signal> = Vec::new();
        for signal in entries {
            let key = dedup_key(date, &signal.symbol, signal.action);
            if self.key_exists(&key).await {
                debug!(symbol = %signal.symbol, action = %signal.action, "dropped: executed today");
                outcome.dropped.push((signal, DropReason::DuplicateToday));
            } else {
                fresh.push(signal);
            }
        }

        // --- Stage 2: composite quality -----------------------------------
        let mut qualified: Vec<Signal> = Vec::new();
        for signal in fresh {
            let threshold = self.effective_threshold(&signal.strategy_id);
            let score = self.quality_of(&signal, cache, regime);
            if score < threshold {
                debug!(
                    symbol = %signal.symbol,
                    strategy = %signal.strategy_id,
                    score = format!("{score:.2}"),
                    threshold = format!("{threshold:.2}"),
                    "dropped: quality below threshold"
                );
                outcome
                    .dropped
                    .push((signal, DropReason::QualityBelowThreshold { score, threshold }));
            } else {
                qualified.push(signal);
            }
        }

        // --- Stage 3: one survivor per symbol -----------------------------
        let winners = self.pick_symbol_winners(&qualified);
        for (idx, signal) in qualified.into_iter().enumerate() {
            if winners.contains(&idx) {
                outcome.passed.push(signal);
            } else {
                outcome.dropped.push((signal, DropReason::SymbolConflict));
            }
        }

        outcome
    }

    /// Record an execution so later same-day signals for this (symbol,
    /// action) are recognised as replays. Stores the broker order id as the
    /// record value.
    pub async fn mark_executed(&self, date: NaiveDate, signal: &Signal, order_id: &str) {
        let key = dedup_key(date, &signal.symbol, signal.action);
        let attempt = tokio::time::timeout(KV_TIMEOUT, self.kv.set_nx(&key, order_id, self.dedup_ttl)).await;
        match attempt {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "kv mark failed — recording locally only");
                self.local.set_nx_sync(&key, order_id, self.dedup_ttl);
            }
            Err(_) => {
                warn!(key = %key, "kv mark timed out — recording locally only");
                self.local.set_nx_sync(&key, order_id, self.dedup_ttl);
            }
        }
    }

    /// Feed a closed-trade outcome into the strategy's rolling window.
    pub fn record_outcome(&self, strategy_id: &str, win: bool) {
        self.perf
            .write()
            .entry(strategy_id.to_string())
            .or_default()
            .record(win);
    }

    /// The quality threshold after the win-rate multiplier. Strategies that
    /// have been winning get a looser bar, losing ones a stricter bar.
    pub fn effective_threshold(&self, strategy_id: &str) -> f64 {
        let multiplier = match self
            .perf
            .read()
            .get(strategy_id)
            .and_then(PerformanceWindow::win_rate)
        {
            Some(rate) if rate >= 0.65 => 0.85,
            Some(rate) if rate >= 0.55 => 0.95,
            Some(rate) if rate >= 0.45 => 1.00,
            Some(rate) if rate >= 0.35 => 1.10,
            Some(_) => 1.20,
            None => 1.00,
        };
        self.min_quality * multiplier
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// KV GET with a 500 ms budget and one retry; on failure, fall back to
    /// the local map so the pipeline keeps moving.
    async fn key_exists(&self, key: &str) -> bool {
        for attempt in 0..2 {
            match tokio::time::timeout(KV_TIMEOUT, self.kv.get(key)).await {
                Ok(Ok(value)) => return value.is_some(),
                Ok(Err(e)) if attempt == 0 => {
                    debug!(key, error = %e, "kv get failed — retrying once");
                }
                Err(_) if attempt == 0 => {
                    debug!(key, "kv get timed out — retrying once");
                }
                Ok(Err(e)) => {
                    warn!(key, error = %e, "kv unreachable — degraded to local dedup");
                    return self.local.get_sync(key).is_some();
                }
                Err(_) => {
                    warn!(key, "kv timed out twice — degraded to local dedup");
                    return self.local.get_sync(key).is_some();
                }
            }
        }
        false
    }

    fn quality_of(
        &self,
        signal: &Signal,
        cache: &MarketDataCache,
        regime: RegimeSnapshot,
    ) -> f64 {
        let Some((tick, _)) = cache.latest(&signal.symbol) else {
            return 0.0;
        };
        let bars = cache
            .history(&signal.symbol, BarInterval::M1, 30)
            .unwrap_or_default();
        let inputs = QualityInputs {
            action: signal.action,
            tick: (*tick).clone(),
            bars_1m: bars,
            regime,
        };
        self.scorer.score(&inputs)
    }

    /// Indices of the per-symbol winners within `qualified`.
    fn pick_symbol_winners(&self, qualified: &[Signal]) -> std::collections::HashSet<usize> {
        let mut best: HashMap<&str, usize> = HashMap::new();
        for (idx, signal) in qualified.iter().enumerate() {
            match best.get(signal.symbol.as_str()) {
                None => {
                    best.insert(&signal.symbol, idx);
                }
                Some(&current) => {
                    if self.beats(signal, &qualified[current]) {
                        best.insert(&signal.symbol, idx);
                    }
                }
            }
        }
        best.into_values().collect()
    }

    /// Ordering: confidence desc, generated_at asc, strategy priority asc.
    fn beats(&self, challenger: &Signal, incumbent: &Signal) -> bool {
        if challenger.confidence != incumbent.confidence {
            return challenger.confidence > incumbent.confidence;
        }
        if challenger.generated_at != incumbent.generated_at {
            return challenger.generated_at < incumbent.generated_at;
        }
        self.priority(&challenger.strategy_id) < self.priority(&incumbent.strategy_id)
    }

    fn priority(&self, strategy_id: &str) -> usize {
        self.priorities
            .get(strategy_id)
            .copied()
            .unwrap_or(usize::MAX)
    }
}

impl std::fmt::Debug for SignalDeduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalDeduplicator")
            .field("min_quality", &self.min_quality)
            .field("strategies", &self.priorities.len())
            .finish()
    }
}
