//! WebSocket quote feed

use super::QuoteFeed;
use crate::data::Quote;
use crate::error::Result;
use crate::ws::{WsClient, WsConfig, WsMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Subscription request sent after every (re)connect
#[derive(Debug, Serialize)]
struct Subscribe<'a> {
    op: &'static str,
    symbols: &'a [String],
}

/// Inbound frame; anything other than a quote is ignored
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Frame {
    Quote(Quote),
    #[serde(other)]
    Other,
}

/// Quote stream from a venue's market data WebSocket
pub struct WsQuoteFeed {
    url: String,
    symbols: Vec<String>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl WsQuoteFeed {
    pub fn new(url: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            url: url.into(),
            symbols,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Override the reconnect schedule
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    fn parse_message(msg: &str) -> Option<Quote> {
        match serde_json::from_str::<Frame>(msg) {
            Ok(Frame::Quote(quote)) => Some(quote),
            Ok(Frame::Other) => None,
            Err(e) => {
                tracing::debug!(error = %e, "Unparseable feed frame");
                None
            }
        }
    }

    async fn run_message_loop(
        mut ws_rx: mpsc::Receiver<WsMessage>,
        ws_tx: mpsc::Sender<String>,
        subscribe: String,
        quote_tx: mpsc::Sender<Quote>,
    ) {
        while let Some(msg) = ws_rx.recv().await {
            match msg {
                WsMessage::Text(text) => {
                    if let Some(quote) = Self::parse_message(&text) {
                        if quote_tx.send(quote).await.is_err() {
                            tracing::debug!("Quote receiver dropped, stopping feed");
                            break;
                        }
                    }
                }
                WsMessage::Connected => {
                    tracing::info!("Quote feed connected");
                    if ws_tx.send(subscribe.clone()).await.is_err() {
                        break;
                    }
                }
                WsMessage::Disconnected => {
                    tracing::warn!("Quote feed disconnected");
                    break;
                }
                WsMessage::Reconnecting { attempt } => {
                    tracing::warn!(attempt, "Quote feed reconnecting");
                }
                WsMessage::Binary(_) => {}
            }
        }
    }
}

#[async_trait]
impl QuoteFeed for WsQuoteFeed {
    async fn subscribe(&self) -> Result<mpsc::Receiver<Quote>> {
        let (quote_tx, quote_rx) = mpsc::channel(1024);
        let subscribe = serde_json::to_string(&Subscribe {
            op: "subscribe",
            symbols: &self.symbols,
        })?;

        tracing::info!(url = %self.url, symbols = ?self.symbols, "Subscribing to quote feed");

        let client = WsClient::new(
            WsConfig::new(self.url.clone())
                .initial_delay(self.initial_backoff)
                .max_delay(self.max_backoff),
        );
        let (ws_rx, ws_tx) = client.connect_bidirectional();

        tokio::spawn(Self::run_message_loop(ws_rx, ws_tx, subscribe, quote_tx));

        Ok(quote_rx)
    }
}
