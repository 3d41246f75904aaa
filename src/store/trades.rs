// =============================================================================
// Trade record sink — analytics write contract
// =============================================================================
//
// One record per executed signal. The relational schema behind this contract
// lives outside the core; the engine only guarantees the fields below are
// populated and the write is durable-ordered (append-only JSONL here).
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{OrderStatus, TradeAction};

/// Analytics record written once per executed signal and updated on fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    /// The single master user created at startup; user management itself is
    /// outside the core.
    pub user_id: String,
    pub symbol: String,
    pub side: TradeAction,
    pub quantity: u32,
    pub entry_price: f64,
    pub stop: f64,
    pub target: f64,
    pub broker_order_id: String,
    pub strategy_id: String,
    pub tag: String,
    pub generated_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    #[serde(default)]
    pub pnl: Option<f64>,
}

/// Write seam for the analytics store.
pub trait TradeStore: Send + Sync {
    fn record(&self, record: &TradeRecord) -> Result<()>;
}

/// Append-only JSONL sink. Each record is one line; the file handle is
/// serialised behind a mutex so concurrent submissions cannot interleave.
pub struct JsonlTradeStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlTradeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl TradeStore for JsonlTradeStore {
    fn record(&self, record: &TradeRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialise trade record")?;

        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open trade log {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append trade record to {}", self.path.display()))?;
        Ok(())
    }
}

impl std::fmt::Debug for JsonlTradeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlTradeStore")
            .field("path", &self.path)
            .finish()
    }
}

/// In-memory sink for tests and demo mode.
#[derive(Default)]
pub struct MemoryTradeStore {
    records: Mutex<Vec<TradeRecord>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TradeRecord> {
        self.records.lock().clone()
    }
}

impl TradeStore for MemoryTradeStore {
    fn record(&self, record: &TradeRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTradeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTradeStore")
            .field("records", &self.records.lock().len())
            .finish()
    }
}
