//! Execution module
//!
//! Order submission, cancellation and fill reporting through one broker
//! interface, backed either by deterministic bar matching (backtest) or a
//! live venue connection.

mod cost;
mod live;
mod matching;
mod remote;
mod simulated;
mod types;
mod venue;

pub use cost::{CostModel, OrderCost};
pub use live::{LiveBroker, LiveBrokerSettings};
pub use matching::{BacktestBroker, MatchingPolicy};
pub use remote::RemoteVenue;
pub use simulated::SimulatedVenue;
pub use types::{
    Fill, Order, OrderId, OrderKind, OrderRequest, OrderStatus, RejectReason, Side,
};
pub use venue::{build_venue, Venue, VenueEvent};

use crate::error::Result;
use crate::ledger::LedgerSnapshot;
use chrono::NaiveDateTime;
use std::sync::Arc;

/// Trait for broker implementations.
///
/// Calls are synchronous: the backtest resolves everything in-thread, and the
/// live adapter only enqueues work for its order-management task.
pub trait Broker: Send + Sync {
    /// Short broker name for logs
    fn name(&self) -> &str;

    /// Submit an order.
    ///
    /// `account` is the caller's latest ledger snapshot, used for pre-trade
    /// checks. Returns the new order id, or `OrderRejected` (the rejected
    /// order is still recorded).
    fn submit(
        &self,
        request: OrderRequest,
        account: &LedgerSnapshot,
        now: NaiveDateTime,
    ) -> Result<OrderId>;

    /// Cancel an open order
    fn cancel(&self, id: OrderId, now: NaiveDateTime) -> Result<()>;

    /// Current state of one order
    fn order(&self, id: OrderId) -> Option<Order>;

    /// Orders not yet in a terminal state, by id
    fn open_orders(&self) -> Vec<Order>;

    /// Every order seen this run, by id
    fn orders(&self) -> Vec<Order>;

    /// Every fill this run, in execution order
    fn fills(&self) -> Vec<Fill>;

    /// Replace the commission model. Live venues charge their own fees.
    fn set_cost_model(&self, _model: Arc<dyn CostModel>) {}
}
