//! Live venue interface

use super::{Fill, Order, OrderCost, OrderId, RejectReason, RemoteVenue, SimulatedVenue};
use crate::config::{BrokerConfig, BrokerKind, Credentials};
use crate::data::Quote;
use crate::error::{EngineError, Result};
use crate::ledger::AccountSnapshot;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Asynchronous notifications from a venue session
#[derive(Debug, Clone, PartialEq)]
pub enum VenueEvent {
    Fill(Fill),
    Rejected {
        order_id: OrderId,
        reason: RejectReason,
    },
    Cancelled {
        order_id: OrderId,
    },
    /// The session dropped; a new `connect` is required
    Disconnected,
}

/// A brokerage connection the live adapter drives
#[async_trait]
pub trait Venue: Send + Sync {
    fn name(&self) -> &str;

    /// Open a session. Fails with `BrokerConnection` when unreachable.
    async fn connect(&self) -> Result<mpsc::Receiver<VenueEvent>>;

    async fn place_order(&self, order: &Order) -> Result<()>;

    async fn cancel_order(&self, id: OrderId) -> Result<()>;

    /// Authoritative cash, positions and working orders
    async fn account_snapshot(&self) -> Result<AccountSnapshot>;

    /// Market update seen by the engine. Real venues have their own market.
    async fn on_quote(&self, _quote: &Quote) {}
}

/// Build the venue selected by configuration
pub fn build_venue(
    config: &BrokerConfig,
    initial_cash: Decimal,
    cost: OrderCost,
) -> Result<Arc<dyn Venue>> {
    match config.kind {
        BrokerKind::Simulator => Ok(Arc::new(SimulatedVenue::new(initial_cash, cost))),
        BrokerKind::Remote => {
            let ws_url = config
                .ws_url
                .clone()
                .ok_or_else(|| EngineError::InvalidConfig("broker.ws_url is required".into()))?;
            let http_url = config
                .http_url
                .clone()
                .ok_or_else(|| EngineError::InvalidConfig("broker.http_url is required".into()))?;
            let credentials = config
                .token_env
                .as_deref()
                .map(Credentials::from_env)
                .transpose()?;
            Ok(Arc::new(RemoteVenue::new(ws_url, http_url, credentials)))
        }
    }
}
