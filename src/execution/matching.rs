//! Deterministic order matching against historical bars
//!
//! Orders resolve on the first bar revealed after submission, never on the
//! bar in progress. Market orders fill at that bar's open (plus adverse
//! slippage). Limit orders fill at exactly the limit price when the bar's
//! range crosses it, else stay pending for later bars.

use super::{
    Broker, CostModel, Fill, Order, OrderId, OrderKind, OrderRequest, OrderStatus, RejectReason,
    Side,
};
use crate::config::Config;
use crate::data::Bar;
use crate::error::{EngineError, Result};
use crate::ledger::LedgerSnapshot;
use crate::telemetry::{self, CounterMetric};
use chrono::NaiveDateTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Matching policy knobs
#[derive(Debug, Clone, PartialEq)]
pub struct MatchingPolicy {
    /// Permit sells beyond the held quantity
    pub allow_short: bool,
    /// Adverse fraction applied to market fill prices
    pub slippage: Decimal,
    /// Cap on the share of a bar's volume one bar can fill
    pub max_volume_ratio: Option<Decimal>,
}

impl Default for MatchingPolicy {
    fn default() -> Self {
        Self {
            allow_short: false,
            slippage: Decimal::ZERO,
            max_volume_ratio: None,
        }
    }
}

impl MatchingPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            allow_short: config.policy.allow_short,
            slippage: config.cost.slippage,
            max_volume_ratio: config.policy.max_volume_ratio,
        }
    }

    fn market_price(&self, open: Decimal, side: Side) -> Decimal {
        let factor = match side {
            Side::Buy => Decimal::ONE + self.slippage,
            Side::Sell => Decimal::ONE - self.slippage,
        };
        (open * factor).round_dp(4)
    }
}

struct BookState {
    next_id: u64,
    orders: BTreeMap<OrderId, Order>,
    fills: Vec<Fill>,
    cost: Arc<dyn CostModel>,
    /// Symbols with a bar in the current period
    tradable: BTreeSet<String>,
    /// Last revealed close per symbol
    reference: HashMap<String, Decimal>,
    /// Fill-time rejections not yet collected by the scheduler
    rejected: Vec<(OrderId, String, RejectReason)>,
}

impl BookState {
    fn open_for<'a>(&'a self, symbol: &'a str) -> impl Iterator<Item = &'a Order> + 'a {
        self.orders
            .values()
            .filter(move |o| o.is_open() && o.symbol == symbol)
    }
}

/// Broker that fills orders against historical bars
pub struct BacktestBroker {
    run_id: String,
    policy: MatchingPolicy,
    state: Mutex<BookState>,
}

impl BacktestBroker {
    /// Create a broker for one run
    pub fn new(run_id: impl Into<String>, policy: MatchingPolicy, cost: Arc<dyn CostModel>) -> Self {
        Self {
            run_id: run_id.into(),
            policy,
            state: Mutex::new(BookState {
                next_id: 0,
                orders: BTreeMap::new(),
                fills: Vec::new(),
                cost,
                tradable: BTreeSet::new(),
                reference: HashMap::new(),
                rejected: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BookState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Declare which symbols have data in the period about to run
    pub fn begin_period(&self, tradable: impl IntoIterator<Item = String>) {
        self.lock().tradable = tradable.into_iter().collect();
    }

    /// Orders rejected while matching since the last call
    pub fn take_rejections(&self) -> Vec<(OrderId, String, RejectReason)> {
        std::mem::take(&mut self.lock().rejected)
    }

    /// Record the latest revealed close of `symbol`
    pub fn update_reference(&self, symbol: &str, price: Decimal) {
        self.lock().reference.insert(symbol.to_string(), price);
    }

    /// Symbols with open orders
    pub fn open_symbols(&self) -> BTreeSet<String> {
        self.lock()
            .orders
            .values()
            .filter(|o| o.is_open())
            .map(|o| o.symbol.clone())
            .collect()
    }

    fn pre_trade_check(
        &self,
        state: &BookState,
        order: &Order,
        account: &LedgerSnapshot,
    ) -> Option<RejectReason> {
        if order.quantity == 0 {
            return Some(RejectReason::InvalidQuantity);
        }
        if let OrderKind::Limit { price } = order.kind {
            if price <= Decimal::ZERO {
                return Some(RejectReason::InvalidLimitPrice);
            }
        }
        if !state.tradable.contains(&order.symbol) {
            return Some(RejectReason::NoMarketData);
        }

        match order.side() {
            Side::Sell if !self.policy.allow_short => {
                let pending_sells: i64 = state
                    .open_for(&order.symbol)
                    .filter(|o| o.remaining() < 0)
                    .map(|o| o.remaining().abs())
                    .sum();
                let available = (account.quantity(&order.symbol) - pending_sells).max(0);
                if order.quantity.abs() > available {
                    return Some(RejectReason::InsufficientPosition {
                        requested: order.quantity.abs(),
                        available,
                    });
                }
            }
            Side::Sell => {}
            Side::Buy => {
                let Some(price) = self.estimate_price(state, order) else {
                    // Nothing revealed yet; the fill-time check still applies
                    return None;
                };
                let required = self.estimated_cost(state, price, order.quantity);
                let reserved: Decimal = state
                    .orders
                    .values()
                    .filter(|o| o.is_open() && o.remaining() > 0)
                    .filter_map(|o| {
                        self.estimate_price(state, o)
                            .map(|p| self.estimated_cost(state, p, o.remaining()))
                    })
                    .sum();
                let available = account.cash - reserved;
                if required > available {
                    return Some(RejectReason::InsufficientCash {
                        required,
                        available,
                    });
                }
            }
        }
        None
    }

    fn estimate_price(&self, state: &BookState, order: &Order) -> Option<Decimal> {
        match order.kind {
            OrderKind::Limit { price } => Some(price),
            OrderKind::Market => state
                .reference
                .get(&order.symbol)
                .map(|p| self.policy.market_price(*p, order.side())),
        }
    }

    fn estimated_cost(&self, state: &BookState, price: Decimal, quantity: i64) -> Decimal {
        price * Decimal::from(quantity) + state.cost.commission(Side::Buy, price, quantity)
    }

    /// Match open orders for `bar.symbol` against `bar`.
    ///
    /// `account` is the ledger as of just before this bar; cash and position
    /// are re-checked at fill time. Fills are stamped `at`, and orders
    /// created after `at` wait for a later bar.
    pub fn match_bar(&self, bar: &Bar, account: &LedgerSnapshot, at: NaiveDateTime) -> Vec<Fill> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let cost = state.cost.clone();

        let mut cash = account.cash;
        let mut position = account.quantity(&bar.symbol);
        let mut volume_left = self
            .policy
            .max_volume_ratio
            .map(|ratio| (bar.volume * ratio).floor().to_i64().unwrap_or(0));

        let ids: Vec<OrderId> = state
            .open_for(&bar.symbol)
            .filter(|o| o.created_at <= at)
            .map(|o| o.id)
            .collect();
        let mut fills = Vec::new();

        for id in ids {
            let Some(order) = state.orders.get_mut(&id) else {
                continue;
            };
            let side = order.side();

            let price = match order.kind {
                OrderKind::Market => self.policy.market_price(bar.open, side),
                OrderKind::Limit { price } => {
                    let crossed = match side {
                        Side::Buy => bar.low <= price,
                        Side::Sell => bar.high >= price,
                    };
                    if !crossed {
                        continue;
                    }
                    price
                }
            };

            let mut quantity = order.remaining();
            if let Some(left) = volume_left {
                if left <= 0 {
                    continue;
                }
                if quantity.abs() > left {
                    quantity = left * quantity.signum();
                }
            }

            let commission = cost.commission(side, price, quantity);

            match side {
                Side::Buy => {
                    let required = price * Decimal::from(quantity) + commission;
                    if required > cash {
                        let reason = RejectReason::InsufficientCash {
                            required,
                            available: cash,
                        };
                        order.reject(reason.clone(), at);
                        state.rejected.push((id, bar.symbol.clone(), reason));
                        telemetry::increment(CounterMetric::OrdersRejected, 1);
                        tracing::info!(order_id = %id, symbol = %bar.symbol, "Order rejected at fill: insufficient cash");
                        continue;
                    }
                }
                Side::Sell if !self.policy.allow_short => {
                    if quantity.abs() > position.max(0) {
                        let reason = RejectReason::InsufficientPosition {
                            requested: quantity.abs(),
                            available: position.max(0),
                        };
                        order.reject(reason.clone(), at);
                        state.rejected.push((id, bar.symbol.clone(), reason));
                        telemetry::increment(CounterMetric::OrdersRejected, 1);
                        tracing::info!(order_id = %id, symbol = %bar.symbol, "Order rejected at fill: insufficient position");
                        continue;
                    }
                }
                Side::Sell => {}
            }

            cash -= price * Decimal::from(quantity) + commission;
            position += quantity;
            if let Some(left) = volume_left.as_mut() {
                *left -= quantity.abs();
            }

            order.record_fill(quantity, price, at);
            let fill = Fill {
                order_id: id,
                symbol: bar.symbol.clone(),
                quantity,
                price,
                commission,
                timestamp: at,
            };
            tracing::debug!(
                order_id = %id,
                symbol = %bar.symbol,
                quantity,
                price = %price,
                status = %order.status,
                "Order matched"
            );
            telemetry::increment(CounterMetric::Fills, 1);
            state.fills.push(fill.clone());
            fills.push(fill);
        }

        fills
    }

    /// Cancel every open order, returning their ids
    pub fn cancel_all(&self, now: NaiveDateTime) -> Vec<OrderId> {
        let mut state = self.lock();
        let mut cancelled = Vec::new();
        for order in state.orders.values_mut().filter(|o| o.is_open()) {
            if order.transition(OrderStatus::Cancelled, now) {
                cancelled.push(order.id);
            }
        }
        cancelled
    }
}

impl Broker for BacktestBroker {
    fn name(&self) -> &str {
        "backtest"
    }

    fn submit(
        &self,
        request: OrderRequest,
        account: &LedgerSnapshot,
        now: NaiveDateTime,
    ) -> Result<OrderId> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = OrderId(state.next_id);
        let mut order = Order::new(id, request, &self.run_id, now);

        if let Some(reason) = self.pre_trade_check(&state, &order, account) {
            let symbol = order.symbol.clone();
            order.reject(reason.clone(), now);
            state.orders.insert(id, order);
            telemetry::increment(CounterMetric::OrdersRejected, 1);
            tracing::info!(order_id = %id, %symbol, %reason, "Order rejected");
            return Err(EngineError::rejected(symbol, reason));
        }

        tracing::debug!(
            order_id = %id,
            symbol = %order.symbol,
            quantity = order.quantity,
            kind = ?order.kind,
            "Order accepted"
        );
        state.orders.insert(id, order);
        telemetry::increment(CounterMetric::OrdersSubmitted, 1);
        Ok(id)
    }

    fn cancel(&self, id: OrderId, now: NaiveDateTime) -> Result<()> {
        let mut state = self.lock();
        let order = state
            .orders
            .get_mut(&id)
            .ok_or(EngineError::UnknownOrder(id))?;
        if order.transition(OrderStatus::Cancelled, now) {
            tracing::debug!(order_id = %id, "Order cancelled");
        } else {
            tracing::debug!(order_id = %id, status = %order.status, "Cancel ignored for closed order");
        }
        Ok(())
    }

    fn order(&self, id: OrderId) -> Option<Order> {
        self.lock().orders.get(&id).cloned()
    }

    fn open_orders(&self) -> Vec<Order> {
        self.lock()
            .orders
            .values()
            .filter(|o| o.is_open())
            .cloned()
            .collect()
    }

    fn orders(&self) -> Vec<Order> {
        self.lock().orders.values().cloned().collect()
    }

    fn fills(&self) -> Vec<Fill> {
        self.lock().fills.clone()
    }

    fn set_cost_model(&self, model: Arc<dyn CostModel>) {
        self.lock().cost = model;
    }
}
