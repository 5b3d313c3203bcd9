//! Remote brokerage venue
//!
//! Orders and execution reports travel over a JSON WebSocket session;
//! the account snapshot used for reconciliation comes from a REST endpoint.

use super::{Fill, Order, OrderId, RejectReason, Venue, VenueEvent};
use crate::config::Credentials;
use crate::error::{EngineError, Result};
use crate::ledger::AccountSnapshot;
use crate::ws::{WsClient, WsConfig, WsMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Frames we send
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Outbound<'a> {
    Auth { token: &'a str },
    Place { order: &'a Order },
    Cancel { order_id: OrderId },
}

/// Frames the venue sends
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Fill(Fill),
    Rejected { order_id: OrderId, message: String },
    Cancelled { order_id: OrderId },
    #[serde(other)]
    Other,
}

impl Inbound {
    fn into_event(self) -> Option<VenueEvent> {
        match self {
            Inbound::Fill(fill) => Some(VenueEvent::Fill(fill)),
            Inbound::Rejected { order_id, message } => Some(VenueEvent::Rejected {
                order_id,
                reason: RejectReason::Venue { message },
            }),
            Inbound::Cancelled { order_id } => Some(VenueEvent::Cancelled { order_id }),
            Inbound::Other => None,
        }
    }
}

/// Venue reached over the network
pub struct RemoteVenue {
    ws_url: String,
    http_url: String,
    credentials: Option<Credentials>,
    http: reqwest::Client,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
}

impl RemoteVenue {
    pub fn new(
        ws_url: impl Into<String>,
        http_url: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            http_url: http_url.into().trim_end_matches('/').to_string(),
            credentials,
            http: reqwest::Client::new(),
            outbound: Mutex::new(None),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn send(&self, frame: &Outbound<'_>) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        let tx = self
            .sender()
            .ok_or_else(|| EngineError::BrokerConnection("no session".into()))?;
        tx.send(text)
            .await
            .map_err(|_| EngineError::BrokerConnection("session closed".into()))
    }

    fn parse_message(text: &str) -> Option<VenueEvent> {
        match serde_json::from_str::<Inbound>(text) {
            Ok(frame) => frame.into_event(),
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable venue frame");
                None
            }
        }
    }

    async fn run_session(mut ws_rx: mpsc::Receiver<WsMessage>, events: mpsc::Sender<VenueEvent>) {
        while let Some(msg) = ws_rx.recv().await {
            match msg {
                WsMessage::Text(text) => {
                    if let Some(event) = Self::parse_message(&text) {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                // Reconnection is owned by the broker, which reconciles first
                WsMessage::Disconnected | WsMessage::Reconnecting { .. } => break,
                WsMessage::Connected | WsMessage::Binary(_) => {}
            }
        }
        let _ = events.send(VenueEvent::Disconnected).await;
    }
}

#[async_trait]
impl Venue for RemoteVenue {
    fn name(&self) -> &str {
        "remote"
    }

    async fn connect(&self) -> Result<mpsc::Receiver<VenueEvent>> {
        let client = WsClient::new(WsConfig::new(self.ws_url.clone()).max_reconnects(1));
        let (mut ws_rx, ws_tx) = client.connect_bidirectional();

        match ws_rx.recv().await {
            Some(WsMessage::Connected) => {}
            _ => {
                return Err(EngineError::BrokerConnection(format!(
                    "could not connect to {}",
                    self.ws_url
                )))
            }
        }

        *self.outbound.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ws_tx);
        if let Some(credentials) = &self.credentials {
            self.send(&Outbound::Auth {
                token: credentials.expose(),
            })
            .await?;
        }

        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(Self::run_session(ws_rx, tx));
        tracing::info!(url = %self.ws_url, "Venue session established");
        Ok(rx)
    }

    async fn place_order(&self, order: &Order) -> Result<()> {
        self.send(&Outbound::Place { order }).await
    }

    async fn cancel_order(&self, id: OrderId) -> Result<()> {
        self.send(&Outbound::Cancel { order_id: id }).await
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot> {
        let mut request = self.http.get(format!("{}/account", self.http_url));
        if let Some(credentials) = &self.credentials {
            request = request.bearer_auth(credentials.expose());
        }
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::BrokerConnection(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::BrokerConnection(format!(
                "account endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<AccountSnapshot>()
            .await
            .map_err(|e| EngineError::BrokerConnection(format!("bad account payload: {e}")))
    }
}
