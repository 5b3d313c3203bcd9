//! WebSocket client with automatic reconnection

use super::backoff::Backoff;
use super::types::{WsConfig, WsError, WsMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Reconnecting WebSocket client with ping keepalive
pub struct WsClient {
    config: WsConfig,
}

impl WsClient {
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Connect read-only. Spawns the connection task and returns its
    /// message stream, including Connected/Reconnecting/Disconnected events.
    pub fn connect(&self) -> mpsc::Receiver<WsMessage> {
        let (tx, rx) = mpsc::channel(1024);
        let config = self.config.clone();

        tokio::spawn(async move {
            if let Err(e) = Self::run_loop(config, tx, None).await {
                tracing::error!(error = %e, "WebSocket connection loop failed");
            }
        });

        rx
    }

    /// Connect with an outbound channel. Returns (message_receiver, message_sender).
    pub fn connect_bidirectional(&self) -> (mpsc::Receiver<WsMessage>, mpsc::Sender<String>) {
        let (msg_tx, msg_rx) = mpsc::channel(1024);
        let (send_tx, send_rx) = mpsc::channel(256);
        let config = self.config.clone();

        tokio::spawn(async move {
            if let Err(e) = Self::run_loop(config, msg_tx, Some(send_rx)).await {
                tracing::error!(error = %e, "WebSocket connection loop failed");
            }
        });

        (msg_rx, send_tx)
    }

    async fn run_loop(
        config: WsConfig,
        tx: mpsc::Sender<WsMessage>,
        mut send_rx: Option<mpsc::Receiver<String>>,
    ) -> Result<(), WsError> {
        let mut backoff = Backoff::new(config.initial_reconnect_delay, config.max_reconnect_delay);

        loop {
            match Self::connect_and_stream(&config, &tx, send_rx.as_mut(), &mut backoff).await {
                Ok(()) => {
                    tracing::info!(url = %config.url, "WebSocket connection closed cleanly");
                    let _ = tx.send(WsMessage::Disconnected).await;
                    return Ok(());
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        attempt = backoff.attempts(),
                        "WebSocket connection error"
                    );

                    if backoff.exhausted(config.max_reconnect_attempts) {
                        tracing::error!(url = %config.url, "Max reconnection attempts reached");
                        let _ = tx.send(WsMessage::Disconnected).await;
                        return Err(WsError::MaxReconnectsExceeded);
                    }

                    if tx.is_closed() {
                        tracing::info!("Receiver dropped, stopping reconnection");
                        return Ok(());
                    }

                    let _ = tx
                        .send(WsMessage::Reconnecting {
                            attempt: backoff.attempts(),
                        })
                        .await;
                    sleep(delay).await;
                }
            }
        }
    }

    async fn connect_and_stream(
        config: &WsConfig,
        tx: &mpsc::Sender<WsMessage>,
        mut send_rx: Option<&mut mpsc::Receiver<String>>,
        backoff: &mut Backoff,
    ) -> Result<(), WsError> {
        tracing::info!(url = %config.url, "Connecting to WebSocket");

        let (ws_stream, _response) = connect_async(&config.url)
            .await
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        backoff.reset();
        tracing::info!(url = %config.url, "WebSocket connected");
        if tx.send(WsMessage::Connected).await.is_err() {
            return Ok(());
        }

        let mut ping_interval = tokio::time::interval(config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately
        ping_interval.tick().await;
        let mut waiting_for_pong = false;

        loop {
            tokio::select! {
                msg = read.next() => {
                    let forward = match msg {
                        Some(Ok(Message::Text(text))) => Some(WsMessage::Text(text)),
                        Some(Ok(Message::Binary(data))) => Some(WsMessage::Binary(data)),
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await
                                .map_err(|e| WsError::SendFailed(e.to_string()))?;
                            None
                        }
                        Some(Ok(Message::Pong(_))) => {
                            waiting_for_pong = false;
                            None
                        }
                        Some(Ok(Message::Close(_))) => {
                            return Err(WsError::ConnectionFailed("server closed connection".into()));
                        }
                        Some(Ok(_)) => None,
                        Some(Err(e)) => return Err(WsError::ConnectionFailed(e.to_string())),
                        None => return Err(WsError::ConnectionFailed("stream ended unexpectedly".into())),
                    };
                    if let Some(forward) = forward {
                        if tx.send(forward).await.is_err() {
                            tracing::debug!("Receiver dropped, closing connection");
                            return Ok(());
                        }
                    }
                }

                msg = async {
                    match &mut send_rx {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Some(text) => {
                            write.send(Message::Text(text)).await
                                .map_err(|e| WsError::SendFailed(e.to_string()))?;
                        }
                        // Sender dropped: owner is done with the session
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    if waiting_for_pong {
                        return Err(WsError::ConnectionFailed("pong timeout".into()));
                    }
                    write.send(Message::Ping(vec![])).await
                        .map_err(|e| WsError::SendFailed(e.to_string()))?;
                    waiting_for_pong = true;
                }
            }
        }
    }
}
