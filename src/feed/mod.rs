// =============================================================================
// Market-data feed — transport seam and connection events
// =============================================================================
//
// The ingestor owns one logical session against a push feed. The transport
// trait keeps the vendor protocol thin and swappable: the production adapter
// speaks WebSocket JSON, tests drive the ingestor with a scripted transport.
// =============================================================================

pub mod ingestor;
pub mod ws;

pub use ingestor::{FeedIngestor, FeedState};
pub use ws::WsFeedTransport;

use async_trait::async_trait;
use thiserror::Error;

use crate::market_data::{Bar, BarInterval, Tick};

/// Feed failure taxonomy. `AlreadyConnected` triggers the graceful-takeover
/// path; everything else goes through backoff.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The provider reports another session holds this user's slot.
    #[error("user already connected on another session")]
    AlreadyConnected,

    #[error("feed transport error: {0}")]
    Transport(String),

    #[error("feed session closed by provider")]
    Closed,
}

/// One inbound message, already normalised by the transport.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Tick { symbol: String, tick: Tick },
    Bar {
        symbol: String,
        interval: BarInterval,
        bar: Bar,
    },
}

/// An established feed session. Reading is the only suspension point.
#[async_trait]
pub trait FeedSession: Send {
    /// Next event, `Ok(None)` on clean end-of-stream.
    async fn next_event(&mut self) -> Result<Option<FeedEvent>, FeedError>;
}

/// Connection factory for the push feed.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, FeedError>;

    /// Open a short-lived secondary session that forces the provider to drop
    /// the stale one (graceful takeover). Returns once the secondary session
    /// has been opened and closed.
    async fn open_takeover_session(&self) -> Result<(), FeedError>;
}
