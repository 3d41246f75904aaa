// =============================================================================
// Idempotency key/value store — SETNX + TTL semantics
// =============================================================================
//
// The dedup pipeline needs three operations against a linearizable-per-key
// store: SETNX with TTL, GET, and DEL. The production deployment points this
// trait at an external KV service; `MemoryKvStore` provides the same TTL
// semantics in-process and doubles as the degraded-mode fallback when the
// external store is unreachable.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

/// Failures surfaced by a KV backend.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv store unreachable: {0}")]
    Unreachable(String),

    #[error("kv operation timed out")]
    Timeout,
}

/// Minimal contract the dedup pipeline relies on. Implementations must be
/// linearizable per key.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set `key` to `value` only if absent. Returns `true` when the key was
    /// newly written, `false` when it already existed.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Fetch the current value of `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn del(&self, key: &str) -> Result<(), KvError>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process KV with lazy expiry. Used directly in tests and demo mode, and
/// as the local-degrade fallback behind an unreachable external store.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous SETNX used by the degraded-mode path, which must never
    /// await while the pipeline holds locks.
    pub fn set_nx_sync(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let mut map = self.entries.lock();
        let now = Instant::now();
        if let Some(entry) = map.get(key) {
            if entry.expires_at > now {
                return false;
            }
        }
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        true
    }

    /// Synchronous GET, see [`MemoryKvStore::set_nx_sync`].
    pub fn get_sync(&self, key: &str) -> Option<String> {
        let mut map = self.entries.lock();
        let now = Instant::now();
        match map.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn del_sync(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Number of unexpired entries; sweeps expired ones as a side effect.
    pub fn len(&self) -> usize {
        let mut map = self.entries.lock();
        let now = Instant::now();
        map.retain(|_, e| e.expires_at > now);
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        Ok(self.set_nx_sync(key, value, ttl))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.get_sync(key))
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.del_sync(key);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKvStore")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

/// Build the dedup key for a (date, symbol, action) execution record.
pub fn dedup_key(date: chrono::NaiveDate, symbol: &str, action: crate::types::TradeAction) -> String {
    format!("dedup:{}:{}:{}", date.format("%Y-%m-%d"), symbol, action)
}
