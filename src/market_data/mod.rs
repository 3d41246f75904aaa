// =============================================================================
// Market data model — ticks, bars, and warm-up requirements
// =============================================================================

pub mod cache;
pub mod ring;

pub use cache::{CacheError, MarketDataCache};
pub use ring::HistoryRing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One price/volume update for a symbol. Produced by the feed ingestor,
/// consumed read-only by everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub ltp: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    /// Previous session close, used for day-change computations.
    pub close_prev: f64,
    pub volume: f64,
    pub bid: f64,
    pub ask: f64,
    /// Open interest, present only for derivatives.
    #[serde(default)]
    pub oi: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    /// Relative bid-ask spread. Returns `None` when the book is one-sided or
    /// the price is degenerate.
    pub fn spread_frac(&self) -> Option<f64> {
        if self.bid <= 0.0 || self.ask <= 0.0 || self.ltp <= 0.0 || self.ask < self.bid {
            return None;
        }
        Some((self.ask - self.bid) / self.ltp)
    }

    /// Signed day change relative to the previous close.
    pub fn day_change_frac(&self) -> f64 {
        if self.close_prev > 0.0 {
            (self.ltp - self.close_prev) / self.close_prev
        } else {
            0.0
        }
    }
}

/// A closed OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar start, aligned to the interval boundary.
    pub start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Supported bar intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarInterval {
    M1,
    M5,
}

impl BarInterval {
    pub fn seconds(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
        }
    }
}

impl std::fmt::Display for BarInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::M1 => write!(f, "1m"),
            Self::M5 => write!(f, "5m"),
        }
    }
}

/// A strategy's declaration of how much history it needs before it can act
/// on a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryReq {
    pub interval: BarInterval,
    pub bars: usize,
}
