//! In-process venue for paper trading and tests
//!
//! Holds its own cash and positions so that reconciliation has a real
//! counterparty to compare against. Market orders fill at the last quote;
//! limit orders rest until a quote crosses them.

use super::{
    CostModel, Fill, Order, OrderCost, OrderId, OrderKind, OrderStatus, RejectReason, Side, Venue,
    VenueEvent,
};
use crate::data::Quote;
use crate::error::{EngineError, Result};
use crate::ledger::{AccountSnapshot, Position, VenueOrder, VenuePosition};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

struct SimState {
    cash: Decimal,
    positions: BTreeMap<String, Position>,
    prices: HashMap<String, Decimal>,
    working: BTreeMap<OrderId, Order>,
    session: Option<mpsc::Sender<VenueEvent>>,
    failing_connects: u32,
    last_at: Option<NaiveDateTime>,
}

impl SimState {
    fn notify(&mut self, event: VenueEvent) {
        if let Some(tx) = &self.session {
            if tx.try_send(event).is_err() {
                tracing::warn!("Simulated venue session backlog full, dropping session");
                self.session = None;
            }
        }
    }
}

/// Paper-trading venue
pub struct SimulatedVenue {
    cost: OrderCost,
    state: Mutex<SimState>,
}

impl SimulatedVenue {
    pub fn new(initial_cash: Decimal, cost: OrderCost) -> Self {
        Self {
            cost,
            state: Mutex::new(SimState {
                cash: initial_cash,
                positions: BTreeMap::new(),
                prices: HashMap::new(),
                working: BTreeMap::new(),
                session: None,
                failing_connects: 0,
                last_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Update the venue's market price, filling any crossing orders
    pub fn set_price(&self, symbol: &str, price: Decimal, at: NaiveDateTime) {
        let mut state = self.lock();
        state.prices.insert(symbol.to_string(), price);
        state.last_at = Some(at);

        let crossing: Vec<OrderId> = state
            .working
            .values()
            .filter(|o| o.symbol == symbol && crosses(o, price))
            .map(|o| o.id)
            .collect();
        for id in crossing {
            let fill_price = match state.working.get(&id).map(|o| o.kind) {
                Some(OrderKind::Limit { price: limit }) => limit,
                _ => price,
            };
            self.execute(&mut state, id, fill_price, at);
        }
    }

    /// Drop the current session as a network failure would
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.notify(VenueEvent::Disconnected);
        state.session = None;
    }

    /// Number of orders resting at the venue
    pub fn working_orders(&self) -> usize {
        self.lock().working.len()
    }

    /// Make the next `n` connection attempts fail
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().failing_connects = n;
    }

    /// Overwrite cash and positions, e.g. to model activity outside the engine
    pub fn set_account(&self, snapshot: &AccountSnapshot) {
        let mut state = self.lock();
        state.cash = snapshot.cash;
        state.positions = snapshot
            .positions
            .iter()
            .map(|(symbol, p)| {
                let mut position = Position::open(symbol.clone(), p.quantity, p.avg_cost);
                if let Some(last) = p.last_price {
                    position.last_price = last;
                }
                (symbol.clone(), position)
            })
            .collect();
    }

    fn execute(&self, state: &mut SimState, id: OrderId, price: Decimal, at: NaiveDateTime) {
        let Some(order) = state.working.get(&id) else {
            return;
        };
        let quantity = order.remaining();
        let side = order.side();
        let symbol = order.symbol.clone();
        let commission = self.cost.commission(side, price, quantity);

        let held = state.positions.get(&symbol).map_or(0, |p| p.quantity);
        let refusal = match side {
            Side::Buy => {
                let required = price * Decimal::from(quantity) + commission;
                (required > state.cash).then(|| RejectReason::InsufficientCash {
                    required,
                    available: state.cash,
                })
            }
            Side::Sell => (quantity.abs() > held).then(|| RejectReason::InsufficientPosition {
                requested: quantity.abs(),
                available: held.max(0),
            }),
        };
        if let Some(reason) = refusal {
            state.working.remove(&id);
            state.notify(VenueEvent::Rejected {
                order_id: id,
                reason,
            });
            return;
        }

        state.cash -= price * Decimal::from(quantity) + commission;
        let position = state
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| Position::open(symbol.clone(), 0, Decimal::ZERO));
        position.apply(quantity, price);
        position.last_price = price;
        if position.quantity == 0 {
            state.positions.remove(&symbol);
        }

        if let Some(order) = state.working.get_mut(&id) {
            order.record_fill(quantity, price, at);
            if !order.is_open() {
                state.working.remove(&id);
            }
        }
        state.notify(VenueEvent::Fill(Fill {
            order_id: id,
            symbol,
            quantity,
            price,
            commission,
            timestamp: at,
        }));
    }
}

fn crosses(order: &Order, price: Decimal) -> bool {
    match (order.kind, order.side()) {
        (OrderKind::Market, _) => true,
        (OrderKind::Limit { price: limit }, Side::Buy) => price <= limit,
        (OrderKind::Limit { price: limit }, Side::Sell) => price >= limit,
    }
}

#[async_trait]
impl Venue for SimulatedVenue {
    fn name(&self) -> &str {
        "simulator"
    }

    async fn connect(&self) -> Result<mpsc::Receiver<VenueEvent>> {
        let mut state = self.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(EngineError::BrokerConnection(
                "simulated venue refused connection".into(),
            ));
        }
        let (tx, rx) = mpsc::channel(1024);
        state.session = Some(tx);
        Ok(rx)
    }

    async fn place_order(&self, order: &Order) -> Result<()> {
        let mut state = self.lock();
        if state.session.is_none() {
            return Err(EngineError::BrokerConnection("no session".into()));
        }
        state.working.insert(order.id, order.clone());

        if let Some(price) = state.prices.get(&order.symbol).copied() {
            if crosses(order, price) {
                let fill_price = order.kind.limit_price().unwrap_or(price);
                let at = state.last_at.unwrap_or(order.created_at);
                self.execute(&mut state, order.id, fill_price, at);
            }
        }
        Ok(())
    }

    async fn cancel_order(&self, id: OrderId) -> Result<()> {
        let mut state = self.lock();
        if state.session.is_none() {
            return Err(EngineError::BrokerConnection("no session".into()));
        }
        if state.working.remove(&id).is_some() {
            state.notify(VenueEvent::Cancelled { order_id: id });
        }
        Ok(())
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot> {
        let state = self.lock();
        if state.session.is_none() {
            return Err(EngineError::BrokerConnection("no session".into()));
        }
        let mut snapshot = AccountSnapshot::new(state.cash);
        for (symbol, position) in &state.positions {
            snapshot.positions.insert(
                symbol.clone(),
                VenuePosition {
                    quantity: position.quantity,
                    avg_cost: position.avg_cost,
                    last_price: state.prices.get(symbol).copied(),
                },
            );
        }
        snapshot.orders = state
            .working
            .values()
            .map(|o| VenueOrder {
                order_id: o.id,
                symbol: o.symbol.clone(),
                filled: o.filled,
                status: if o.filled == 0 {
                    OrderStatus::Pending
                } else {
                    OrderStatus::PartiallyFilled
                },
            })
            .collect();
        Ok(snapshot)
    }

    async fn on_quote(&self, quote: &Quote) {
        self.set_price(&quote.symbol, quote.price, quote.timestamp);
    }
}
