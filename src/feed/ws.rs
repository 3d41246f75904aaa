// =============================================================================
// WebSocket feed transport — vendor JSON to FeedEvent
// =============================================================================
//
// Wire shapes handled:
//
//   {"type":"connected"}
//   {"type":"error","code":"user_already_connected"}
//   {"type":"tick","symbol":"RELIANCE","ltp":2500.1,"open":...,"high":...,
//    "low":...,"close_prev":...,"volume":...,"bid":...,"ask":...,"oi":...,
//    "ts":1700000000}
//   {"type":"bar","symbol":"RELIANCE","interval":"1m","o":...,"h":...,
//    "l":...,"c":...,"v":...,"start_ts":1700000000}
//
// Ping/pong/binary frames are ignored; tungstenite answers pings itself.
// =============================================================================

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::market_data::{Bar, BarInterval, Tick};

use super::{FeedError, FeedEvent, FeedSession, FeedTransport};

type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Production transport over a single WebSocket endpoint.
pub struct WsFeedTransport {
    url: String,
}

impl WsFeedTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl FeedTransport for WsFeedTransport {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, FeedError> {
        info!(url = %self.url, "connecting to market feed");
        let (stream, _response) = connect_async(&self.url)
            .await
            .map_err(|e| FeedError::Transport(format!("connect failed: {e}")))?;

        let (_write, mut read) = stream.split();

        // The provider acknowledges the session with a first control frame;
        // "user already connected" arrives here when a stale session holds
        // the slot.
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let value: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|e| FeedError::Transport(format!("bad handshake frame: {e}")))?;
                match value["type"].as_str() {
                    Some("connected") => {}
                    Some("error") if value["code"].as_str() == Some("user_already_connected") => {
                        return Err(FeedError::AlreadyConnected);
                    }
                    other => {
                        return Err(FeedError::Transport(format!(
                            "unexpected handshake frame: {other:?}"
                        )));
                    }
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(FeedError::Transport(format!("handshake read: {e}"))),
            None => return Err(FeedError::Closed),
        }

        info!("market feed connected");
        Ok(Box::new(WsFeedSession { read }))
    }

    async fn open_takeover_session(&self) -> Result<(), FeedError> {
        let url = format!("{}?takeover=true", self.url);
        info!(url = %url, "opening takeover session");
        let (mut stream, _response) = connect_async(&url)
            .await
            .map_err(|e| FeedError::Transport(format!("takeover connect failed: {e}")))?;
        // Opening the session is what evicts the stale one; close politely.
        let _ = stream.send(Message::Close(None)).await;
        Ok(())
    }
}

struct WsFeedSession {
    read: WsRead,
}

#[async_trait]
impl FeedSession for WsFeedSession {
    async fn next_event(&mut self) -> Result<Option<FeedEvent>, FeedError> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => match parse_feed_message(&text) {
                    Ok(Some(event)) => return Ok(Some(event)),
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "failed to parse feed message");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Ping / Pong / Binary frames carry no events.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(FeedError::Transport(format!("read error: {e}"))),
                None => return Ok(None),
            }
        }
    }
}

/// Parse one text frame. `Ok(None)` for frames that carry no event
/// (heartbeats, acks).
fn parse_feed_message(text: &str) -> anyhow::Result<Option<FeedEvent>> {
    use anyhow::Context;

    let value: serde_json::Value =
        serde_json::from_str(text).context("failed to parse feed JSON")?;

    match value["type"].as_str() {
        Some("tick") => {
            let symbol = value["symbol"]
                .as_str()
                .context("tick missing symbol")?
                .to_string();
            let ts = value["ts"].as_i64().context("tick missing ts")?;
            let ltp = value["ltp"].as_f64().context("tick missing ltp")?;
            let tick = Tick {
                ltp,
                open: value["open"].as_f64().unwrap_or(ltp),
                high: value["high"].as_f64().unwrap_or(ltp),
                low: value["low"].as_f64().unwrap_or(ltp),
                close_prev: value["close_prev"].as_f64().unwrap_or(ltp),
                volume: value["volume"].as_f64().unwrap_or(0.0),
                bid: value["bid"].as_f64().unwrap_or(0.0),
                ask: value["ask"].as_f64().unwrap_or(0.0),
                oi: value["oi"].as_f64(),
                timestamp: Utc
                    .timestamp_opt(ts, 0)
                    .single()
                    .context("tick ts out of range")?,
            };
            Ok(Some(FeedEvent::Tick { symbol, tick }))
        }
        Some("bar") => {
            let symbol = value["symbol"]
                .as_str()
                .context("bar missing symbol")?
                .to_string();
            let interval = match value["interval"].as_str() {
                Some("1m") => BarInterval::M1,
                Some("5m") => BarInterval::M5,
                other => anyhow::bail!("unsupported bar interval {other:?}"),
            };
            let start_ts = value["start_ts"].as_i64().context("bar missing start_ts")?;
            let bar = Bar {
                start: Utc
                    .timestamp_opt(start_ts, 0)
                    .single()
                    .context("bar start_ts out of range")?,
                open: value["o"].as_f64().context("bar missing o")?,
                high: value["h"].as_f64().context("bar missing h")?,
                low: value["l"].as_f64().context("bar missing l")?,
                close: value["c"].as_f64().context("bar missing c")?,
                volume: value["v"].as_f64().unwrap_or(0.0),
            };
            Ok(Some(FeedEvent::Bar {
                symbol,
                interval,
                bar,
            }))
        }
        other => {
            debug!(frame_type = ?other, "ignoring non-data feed frame");
            Ok(None)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tick_frame() {
        let text = r#"{
            "type": "tick", "symbol": "RELIANCE", "ltp": 2500.10,
            "open": 2480.0, "high": 2510.0, "low": 2470.0, "close_prev": 2478.0,
            "volume": 1500.0, "bid": 2500.05, "ask": 2500.15,
            "ts": 1700000000
        }"#;
        let event = parse_feed_message(text).unwrap().unwrap();
        match event {
            FeedEvent::Tick { symbol, tick } => {
                assert_eq!(symbol, "RELIANCE");
                assert!((tick.ltp - 2500.10).abs() < 1e-9);
                assert!((tick.close_prev - 2478.0).abs() < 1e-9);
                assert!(tick.oi.is_none());
            }
            other => panic!("expected tick, got {other:?}"),
        }
    }

    #[test]
    fn parse_bar_frame() {
        let text = r#"{
            "type": "bar", "symbol": "NIFTY 50", "interval": "5m",
            "o": 22400.0, "h": 22450.0, "l": 22390.0, "c": 22440.0,
            "v": 0.0, "start_ts": 1700000100
        }"#;
        let event = parse_feed_message(text).unwrap().unwrap();
        match event {
            FeedEvent::Bar { symbol, interval, bar } => {
                assert_eq!(symbol, "NIFTY 50");
                assert_eq!(interval, BarInterval::M5);
                assert!((bar.close - 22_440.0).abs() < 1e-9);
            }
            other => panic!("expected bar, got {other:?}"),
        }
    }

    #[test]
    fn non_data_frames_are_ignored() {
        assert!(parse_feed_message(r#"{"type":"heartbeat"}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_tick_is_an_error() {
        assert!(parse_feed_message(r#"{"type":"tick","symbol":"X"}"#).is_err());
        assert!(parse_feed_message("not json").is_err());
    }
}
