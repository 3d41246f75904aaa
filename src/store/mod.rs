// =============================================================================
// Persistence seams — idempotency KV and trade-record sinks
// =============================================================================

pub mod kv;
pub mod trades;

pub use kv::{KvError, KvStore, MemoryKvStore};
pub use trades::{JsonlTradeStore, MemoryTradeStore, TradeRecord, TradeStore};
