//! Execution types

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Order identifier. Sequential per broker so backtests replay identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Trade side, derived from the sign of a quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Side of a signed quantity (zero counts as buy)
    pub fn of(quantity: i64) -> Self {
        if quantity < 0 {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OrderKind {
    /// Fill at the next bar's open
    Market,
    /// Fill only when the bar range crosses `price`, at `price`
    Limit { price: Decimal },
}

impl OrderKind {
    pub fn limit_price(&self) -> Option<Decimal> {
        match self {
            OrderKind::Market => None,
            OrderKind::Limit { price } => Some(*price),
        }
    }
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    /// Filled, rejected and cancelled orders never reopen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    /// Whether moving to `next` keeps the lifecycle monotonic
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, PartiallyFilled | Filled | Rejected | Cancelled) => true,
            (PartiallyFilled, PartiallyFilled | Filled | Rejected | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why an order was refused
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("insufficient cash: required {required}, available {available}")]
    InsufficientCash { required: Decimal, available: Decimal },
    #[error("insufficient position: requested {requested}, available {available}")]
    InsufficientPosition { requested: i64, available: i64 },
    #[error("no market data for the current period")]
    NoMarketData,
    #[error("quantity must be non-zero")]
    InvalidQuantity,
    #[error("limit price must be positive")]
    InvalidLimitPrice,
    #[error("venue rejected order: {message}")]
    Venue { message: String },
}

/// What a strategy asks the broker to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    /// Signed share count; positive buys, negative sells
    pub quantity: i64,
    pub kind: OrderKind,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, quantity: i64) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            kind: OrderKind::Market,
        }
    }

    pub fn limit(symbol: impl Into<String>, quantity: i64, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            kind: OrderKind::Limit { price },
        }
    }
}

/// An order as tracked by a broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    /// Signed requested quantity
    pub quantity: i64,
    pub kind: OrderKind,
    pub status: OrderStatus,
    /// Signed quantity filled so far
    pub filled: i64,
    /// Volume-weighted fill price
    pub avg_fill_price: Decimal,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    /// Run that owns this order
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
}

impl Order {
    /// New pending order from a request
    pub fn new(id: OrderId, request: OrderRequest, run_id: &str, now: NaiveDateTime) -> Self {
        Self {
            id,
            symbol: request.symbol,
            quantity: request.quantity,
            kind: request.kind,
            status: OrderStatus::Pending,
            filled: 0,
            avg_fill_price: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            run_id: run_id.to_string(),
            reject_reason: None,
        }
    }

    pub fn side(&self) -> Side {
        Side::of(self.quantity)
    }

    /// Signed quantity still to fill
    pub fn remaining(&self) -> i64 {
        self.quantity - self.filled
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Move to `next`, refusing non-monotonic transitions
    pub fn transition(&mut self, next: OrderStatus, now: NaiveDateTime) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        true
    }

    /// Record an execution of `quantity` (signed) at `price`
    pub fn record_fill(&mut self, quantity: i64, price: Decimal, now: NaiveDateTime) {
        let prev = Decimal::from(self.filled.abs());
        let add = Decimal::from(quantity.abs());
        if prev + add > Decimal::ZERO {
            self.avg_fill_price = (self.avg_fill_price * prev + price * add) / (prev + add);
        }
        self.filled += quantity;
        let next = if self.remaining() == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.transition(next, now);
    }

    /// Mark rejected with a reason
    pub fn reject(&mut self, reason: RejectReason, now: NaiveDateTime) -> bool {
        if self.transition(OrderStatus::Rejected, now) {
            self.reject_reason = Some(reason);
            true
        } else {
            false
        }
    }
}

/// An executed trade. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub symbol: String,
    /// Signed filled quantity
    pub quantity: i64,
    pub price: Decimal,
    pub commission: Decimal,
    pub timestamp: NaiveDateTime,
}

impl Fill {
    pub fn side(&self) -> Side {
        Side::of(self.quantity)
    }

    /// Unsigned traded value
    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.quantity.abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    }

    #[test]
    fn test_terminal_statuses_never_reopen() {
        for terminal in [OrderStatus::Filled, OrderStatus::Rejected, OrderStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                OrderStatus::Pending,
                OrderStatus::PartiallyFilled,
                OrderStatus::Filled,
                OrderStatus::Rejected,
                OrderStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_pending_cannot_return_to_pending() {
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Pending));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::PartiallyFilled));
    }

    #[test]
    fn test_record_partial_then_full_fill() {
        let mut order = Order::new(OrderId(1), OrderRequest::market("X", 300), "run", ts());
        order.record_fill(100, dec!(10), ts());
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.remaining(), 200);

        order.record_fill(200, dec!(10.3), ts());
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, dec!(10.2));
    }

    #[test]
    fn test_sell_order_side_and_remaining() {
        let mut order = Order::new(OrderId(2), OrderRequest::limit("X", -100, dec!(11)), "run", ts());
        assert_eq!(order.side(), Side::Sell);
        order.record_fill(-40, dec!(11), ts());
        assert_eq!(order.remaining(), -60);
        assert_eq!(order.kind.limit_price(), Some(dec!(11)));
    }

    #[test]
    fn test_reject_after_fill_is_refused() {
        let mut order = Order::new(OrderId(3), OrderRequest::market("X", 100), "run", ts());
        order.record_fill(100, dec!(10), ts());
        assert!(!order.reject(RejectReason::NoMarketData, ts()));
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(order.reject_reason.is_none());
    }

    #[test]
    fn test_order_serializes_deterministically() {
        let order = Order::new(OrderId(7), OrderRequest::limit("X", 100, dec!(9.5)), "run", ts());
        let a = serde_json::to_string(&order).unwrap();
        let b = serde_json::to_string(&order.clone()).unwrap();
        assert_eq!(a, b);
        assert!(a.contains("\"id\":7"));
        assert!(a.contains("\"type\":\"limit\""));
    }

    #[test]
    fn test_fill_notional_unsigned() {
        let fill = Fill {
            order_id: OrderId(1),
            symbol: "X".into(),
            quantity: -200,
            price: dec!(5),
            commission: dec!(1),
            timestamp: ts(),
        };
        assert_eq!(fill.notional(), dec!(1000));
        assert_eq!(fill.side(), Side::Sell);
    }
}
