/// WebSocket quote feed client (one instance per feed)
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TradingError};
use crate::types::Tick;

/// Which feed produced a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSource {
    Primary,
    Backup,
}

impl FeedSource {
    pub fn as_str(&self) -> &str {
        match self {
            FeedSource::Primary => "primary",
            FeedSource::Backup => "backup",
        }
    }
}

/// A tick tagged with its source feed
#[derive(Debug, Clone)]
pub struct FeedTick {
    pub source: FeedSource,
    pub tick: Tick,
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Quote-stream WebSocket client. Both the primary and the backup feed are
/// instances of this type; the pipeline decides which one's ticks drive bars.
pub struct QuoteFeed {
    source: FeedSource,
    url: String,
    api_key: String,
    tx: mpsc::UnboundedSender<FeedTick>,
    writer: Arc<RwLock<Option<WsSink>>>,
    subscribed: Arc<RwLock<Vec<String>>>,
    is_connected: Arc<RwLock<bool>>,
}

impl QuoteFeed {
    pub fn new(
        source: FeedSource,
        url: String,
        api_key: String,
        tx: mpsc::UnboundedSender<FeedTick>,
    ) -> Self {
        QuoteFeed {
            source,
            url,
            api_key,
            tx,
            writer: Arc::new(RwLock::new(None)),
            subscribed: Arc::new(RwLock::new(Vec::new())),
            is_connected: Arc::new(RwLock::new(false)),
        }
    }

    /// Connect and start the reader task
    pub async fn connect(&self) -> Result<()> {
        info!("[{}] Connecting quote feed: {}", self.source.as_str(), self.url);

        let (ws_stream, _) = connect_async(&self.url).await.map_err(|e| {
            TradingError::WebSocketError(format!(
                "{} feed connection failed: {}",
                self.source.as_str(),
                e
            ))
        })?;

        let (mut write, mut read) = ws_stream.split();

        // Authenticate before subscribing
        let auth = serde_json::json!({ "action": "authenticate", "api_key": self.api_key });
        write
            .send(Message::Text(auth.to_string()))
            .await
            .map_err(|e| TradingError::WebSocketError(format!("Auth send failed: {}", e)))?;

        {
            let mut writer = self.writer.write().await;
            *writer = Some(write);
        }
        {
            let mut connected = self.is_connected.write().await;
            *connected = true;
        }

        info!("[{}] Quote feed connected", self.source.as_str());

        let tx = self.tx.clone();
        let source = self.source;
        let is_connected = Arc::clone(&self.is_connected);

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(tick) = parse_tick_message(&text) {
                            if tx.send(FeedTick { source, tick }).is_err() {
                                error!("[{}] Tick channel closed", source.as_str());
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(_)) => {
                        debug!("[{}] Ping received", source.as_str());
                    }
                    Ok(Message::Close(_)) => {
                        warn!("[{}] WebSocket closed by server", source.as_str());
                        break;
                    }
                    Err(e) => {
                        error!("[{}] WebSocket error: {}", source.as_str(), e);
                        break;
                    }
                    _ => {}
                }
            }

            let mut connected = is_connected.write().await;
            *connected = false;
            warn!("[{}] Feed reader task ended", source.as_str());
        });

        Ok(())
    }

    /// Subscribe the feed to quote ticks for the given instruments
    pub async fn subscribe_quote(&self, instruments: &[String]) -> Result<()> {
        let request = serde_json::json!({
            "action": "subscribe",
            "mode": "quote",
            "symbols": instruments,
        });

        {
            let mut writer = self.writer.write().await;
            let sink = writer.as_mut().ok_or_else(|| {
                TradingError::WebSocketError(format!("{} feed not connected", self.source.as_str()))
            })?;
            sink.send(Message::Text(request.to_string()))
                .await
                .map_err(|e| TradingError::WebSocketError(format!("Subscribe failed: {}", e)))?;
        }

        {
            let mut subscribed = self.subscribed.write().await;
            subscribed.clear();
            subscribed.extend(instruments.iter().cloned());
        }

        info!(
            "[{}] Subscribed {} instruments",
            self.source.as_str(),
            instruments.len()
        );
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }

    pub async fn disconnect(&self) {
        let mut writer = self.writer.write().await;
        if let Some(sink) = writer.as_mut() {
            let _ = sink.send(Message::Close(None)).await;
        }
        *writer = None;

        let mut connected = self.is_connected.write().await;
        *connected = false;
        info!("[{}] Quote feed disconnected", self.source.as_str());
    }

    /// Reconnect with bounded exponential backoff, restoring subscriptions
    pub async fn reconnect(&self, max_attempts: u32, base_delay_secs: u64) -> Result<()> {
        let mut attempt = 0;

        while attempt < max_attempts {
            attempt += 1;
            let backoff = base_delay_secs * (1 << (attempt - 1).min(4));

            warn!(
                "[{}] Reconnecting (attempt {}/{}), waiting {}s...",
                self.source.as_str(),
                attempt,
                max_attempts,
                backoff
            );
            tokio::time::sleep(tokio::time::Duration::from_secs(backoff)).await;

            match self.connect().await {
                Ok(_) => {
                    let symbols = {
                        let subscribed = self.subscribed.read().await;
                        subscribed.clone()
                    };
                    if !symbols.is_empty() {
                        self.subscribe_quote(&symbols).await?;
                    }
                    info!("[{}] Reconnected", self.source.as_str());
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        "[{}] Reconnection attempt {} failed: {}",
                        self.source.as_str(),
                        attempt,
                        e
                    );
                }
            }
        }

        Err(TradingError::ReconnectFailed(format!(
            "{} feed: {} attempts exhausted",
            self.source.as_str(),
            max_attempts
        )))
    }
}

/// Tick payload: {"symbol": ..., "data": {"ltp", "volume", "average_price", "timestamp"}}
fn parse_tick_message(text: &str) -> Option<Tick> {
    let value: Value = serde_json::from_str(text).ok()?;
    let symbol = value.get("symbol")?.as_str()?.to_string();
    let data = value.get("data")?;

    let ltp = data.get("ltp")?.as_f64()?;
    let volume = data.get("volume").and_then(Value::as_i64).unwrap_or(0);
    let average_price = data
        .get("average_price")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    Some(Tick {
        symbol,
        ltp,
        volume,
        average_price,
        timestamp: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tick_message() {
        let text = r#"{"symbol":"NIFTY30JAN2526000CE","data":{"ltp":245.5,"volume":12500,"average_price":240.1,"timestamp":"2025-01-30 10:15:30"}}"#;
        let tick = parse_tick_message(text).unwrap();
        assert_eq!(tick.symbol, "NIFTY30JAN2526000CE");
        assert_eq!(tick.ltp, 245.5);
        assert_eq!(tick.volume, 12500);
        assert_eq!(tick.average_price, 240.1);
    }

    #[test]
    fn test_parse_tick_message_missing_fields() {
        assert!(parse_tick_message("not json").is_none());
        assert!(parse_tick_message(r#"{"symbol":"X"}"#).is_none());
        // ltp is required, volume/average_price are not
        let sparse = r#"{"symbol":"X","data":{"ltp":100.0}}"#;
        let tick = parse_tick_message(sparse).unwrap();
        assert_eq!(tick.volume, 0);
        assert_eq!(tick.average_price, 0.0);
    }
}
