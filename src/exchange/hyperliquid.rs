// =============================================================================
// Hyperliquid exchange collaborator -- REST history + WebSocket candle feed
// =============================================================================
//
// Both candle endpoints are public; no request signing is involved. Numeric
// fields arrive as strings on the REST path and as a mix of strings and JSON
// numbers on the WebSocket path. Everything is coerced to decimal strings
// here, at the boundary, so the engine core only ever sees one canonical
// representation.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{HistoryProvider, LiveFeed};
use crate::store::{Candle, PairKey};

pub const DEFAULT_API_URL: &str = "https://api.hyperliquid.xyz";
pub const DEFAULT_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

/// Delay between WebSocket reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Buffered snapshots per subscription before backpressure applies.
const FEED_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

/// Hyperliquid REST client for the `candleSnapshot` info query.
#[derive(Clone)]
pub struct HyperliquidClient {
    http: reqwest::Client,
    api_url: String,
}

impl HyperliquidClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl HistoryProvider for HyperliquidClient {
    /// POST /info with `{"type": "candleSnapshot", ...}`.
    ///
    /// Malformed entries in the response are skipped with a warning rather
    /// than failing the whole fetch. When `include_partial` is false, the
    /// bucket still open at `end_ms` is filtered out.
    async fn candle_snapshot(
        &self,
        pair: &PairKey,
        start_ms: i64,
        end_ms: i64,
        include_partial: bool,
    ) -> Result<Vec<Candle>> {
        let body = serde_json::json!({
            "type": "candleSnapshot",
            "req": {
                "coin": pair.coin,
                "interval": pair.interval.as_str(),
                "startTime": start_ms,
                "endTime": end_ms,
            }
        });

        let url = format!("{}/info", self.api_url);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("POST /info candleSnapshot request failed")?;

        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .context("failed to parse candleSnapshot response")?;

        if !status.is_success() {
            anyhow::bail!("Hyperliquid POST /info returned {}: {}", status, payload);
        }

        let raw = payload
            .as_array()
            .context("candleSnapshot response is not an array")?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            match parse_candle_fields(entry) {
                Ok(candle) => candles.push(candle),
                Err(e) => warn!(
                    coin = %pair.coin,
                    interval = %pair.interval,
                    error = %e,
                    "skipping malformed snapshot entry"
                ),
            }
        }

        if !include_partial {
            let duration = pair.interval.duration_ms();
            let before = candles.len();
            candles.retain(|c| c.open_time + duration <= end_ms);
            if candles.len() < before {
                debug!(
                    coin = %pair.coin,
                    interval = %pair.interval,
                    dropped = before - candles.len(),
                    "filtered still-open bucket from snapshot"
                );
            }
        }

        debug!(
            coin = %pair.coin,
            interval = %pair.interval,
            count = candles.len(),
            start_ms,
            end_ms,
            "candle snapshot fetched"
        );
        Ok(candles)
    }
}

// ---------------------------------------------------------------------------
// WebSocket feed
// ---------------------------------------------------------------------------

/// Hyperliquid WebSocket candle subscription.
///
/// Owns the connection lifecycle: it reconnects with a fixed delay for as
/// long as the subscriber holds the receiving end of the channel. Consumers
/// observe a disconnect only as a quiet period; missed buckets are the gap
/// healer's problem, not this feed's.
pub struct HyperliquidFeed {
    ws_url: String,
}

impl HyperliquidFeed {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }
}

#[async_trait]
impl LiveFeed for HyperliquidFeed {
    async fn subscribe(&self, pair: &PairKey) -> Result<mpsc::Receiver<Candle>> {
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let url = self.ws_url.clone();
        let pair = pair.clone();

        tokio::spawn(async move {
            loop {
                let result = run_candle_stream(&url, &pair, &tx).await;
                if tx.is_closed() {
                    debug!(coin = %pair.coin, interval = %pair.interval, "subscriber gone, feed task exiting");
                    return;
                }
                match result {
                    Ok(()) => warn!(
                        coin = %pair.coin,
                        interval = %pair.interval,
                        "candle stream ended, reconnecting in 5s"
                    ),
                    Err(e) => error!(
                        coin = %pair.coin,
                        interval = %pair.interval,
                        error = %e,
                        "candle stream error, reconnecting in 5s"
                    ),
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        Ok(rx)
    }
}

/// Connect, subscribe and forward parsed snapshots until the stream drops.
async fn run_candle_stream(
    url: &str,
    pair: &PairKey,
    tx: &mpsc::Sender<Candle>,
) -> Result<()> {
    info!(url = %url, coin = %pair.coin, interval = %pair.interval, "connecting to candle WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to candle WebSocket")?;

    let (mut write, mut read) = ws_stream.split();

    let subscription = serde_json::json!({
        "method": "subscribe",
        "subscription": {
            "type": "candle",
            "coin": pair.coin,
            "interval": pair.interval.as_str(),
        }
    });
    write
        .send(Message::Text(subscription.to_string()))
        .await
        .context("failed to send candle subscription")?;

    info!(coin = %pair.coin, interval = %pair.interval, "candle WebSocket subscribed");

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_candle_message(&text) {
                Ok(Some(candle)) => {
                    if tx.send(candle).await.is_err() {
                        // Receiver dropped; nothing left to feed.
                        return Ok(());
                    }
                }
                Ok(None) => {} // subscription acks and other channels
                Err(e) => warn!(
                    coin = %pair.coin,
                    interval = %pair.interval,
                    error = %e,
                    "failed to parse candle message"
                ),
            },
            // Ping/pong/binary frames; tungstenite answers pings itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(coin = %pair.coin, interval = %pair.interval, error = %e, "candle WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(coin = %pair.coin, interval = %pair.interval, "candle WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one WebSocket message. Returns `None` for non-candle channels
/// (subscription acks, pongs encoded as JSON, etc.).
///
/// Expected shape:
/// ```json
/// { "channel": "candle", "data": { "t": ..., "s": "BTC", "i": "1m", "o": ..., ... } }
/// ```
fn parse_candle_message(text: &str) -> Result<Option<Candle>> {
    let root: Value = serde_json::from_str(text).context("failed to parse candle JSON")?;

    if root["channel"].as_str() != Some("candle") {
        return Ok(None);
    }

    let mut candle = parse_candle_fields(&root["data"])?;
    // Live snapshots are in-progress until the aggregator commits them.
    candle.provisional = true;
    Ok(Some(candle))
}

/// Parse the shared candle object shape (`t`/`o`/`h`/`l`/`c`/`v`) used by
/// both the snapshot response entries and the WebSocket data payload.
fn parse_candle_fields(value: &Value) -> Result<Candle> {
    let open_time = value["t"].as_i64().context("missing field t")?;

    Ok(Candle {
        open_time,
        open: decimal_field(&value["o"], "o")?,
        high: decimal_field(&value["h"], "h")?,
        low: decimal_field(&value["l"], "l")?,
        close: decimal_field(&value["c"], "c")?,
        volume: decimal_field(&value["v"], "v")?,
        provisional: false,
    })
}

/// Coerce a JSON string-or-number into a validated decimal string.
fn decimal_field(val: &Value, name: &str) -> Result<String> {
    match val {
        Value::String(s) => {
            s.parse::<f64>()
                .with_context(|| format!("field {name} is not numeric: {s}"))?;
            Ok(s.clone())
        }
        Value::Number(n) => Ok(n.to_string()),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_snapshot_entry_with_string_fields() {
        let entry: Value = serde_json::from_str(
            r#"{
                "t": 1700000000000,
                "T": 1700000059999,
                "s": "BTC",
                "i": "1m",
                "o": "37000.0",
                "h": "37050.5",
                "l": "36990.0",
                "c": "37020.1",
                "v": "123.456",
                "n": 1500
            }"#,
        )
        .unwrap();

        let candle = parse_candle_fields(&entry).unwrap();
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert_eq!(candle.open, "37000.0");
        assert_eq!(candle.close, "37020.1");
        assert_eq!(candle.volume, "123.456");
        assert!(!candle.provisional);
    }

    #[test]
    fn numeric_fields_are_coerced_to_strings() {
        let entry: Value = serde_json::from_str(
            r#"{ "t": 60000, "o": 1.5, "h": 2, "l": 1, "c": 1.75, "v": 42.0 }"#,
        )
        .unwrap();

        let candle = parse_candle_fields(&entry).unwrap();
        assert_eq!(candle.open, "1.5");
        assert_eq!(candle.high, "2");
        assert_eq!(candle.close, "1.75");
    }

    #[test]
    fn missing_field_is_an_error() {
        let entry: Value =
            serde_json::from_str(r#"{ "t": 60000, "o": "1", "h": "2", "l": "1", "c": "2" }"#)
                .unwrap();
        let err = parse_candle_fields(&entry).unwrap_err();
        assert!(err.to_string().contains("field v"));
    }

    #[test]
    fn non_numeric_string_is_an_error() {
        let entry: Value = serde_json::from_str(
            r#"{ "t": 60000, "o": "abc", "h": "2", "l": "1", "c": "2", "v": "3" }"#,
        )
        .unwrap();
        assert!(parse_candle_fields(&entry).is_err());
    }

    #[test]
    fn parse_ws_candle_message() {
        let msg = r#"{
            "channel": "candle",
            "data": {
                "t": 1700000000000,
                "T": 1700000059999,
                "s": "BTC",
                "i": "1m",
                "o": "37000.0",
                "h": "37050.5",
                "l": "36990.0",
                "c": "37020.1",
                "v": "123.456",
                "n": 1500
            }
        }"#;

        let candle = parse_candle_message(msg).unwrap().unwrap();
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert!(candle.provisional);
    }

    #[test]
    fn subscription_ack_is_ignored() {
        let msg = r#"{ "channel": "subscriptionResponse", "data": { "method": "subscribe" } }"#;
        assert!(parse_candle_message(msg).unwrap().is_none());
    }
}
