//! Commission and tax models

use super::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Pluggable commission model applied at fill time
pub trait CostModel: Send + Sync {
    /// Total charge for trading `quantity` shares at `price`
    fn commission(&self, side: Side, price: Decimal, quantity: i64) -> Decimal;
}

/// Percentage commission with a per-order minimum, plus a sell-side tax
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderCost {
    /// Commission rate on buys
    pub open_commission: Decimal,
    /// Commission rate on sells
    pub close_commission: Decimal,
    /// Stamp tax rate on sells
    pub close_tax: Decimal,
    /// Minimum commission per fill
    pub min_commission: Decimal,
}

impl OrderCost {
    /// No charges at all
    pub fn zero() -> Self {
        Self {
            open_commission: Decimal::ZERO,
            close_commission: Decimal::ZERO,
            close_tax: Decimal::ZERO,
            min_commission: Decimal::ZERO,
        }
    }
}

impl Default for OrderCost {
    fn default() -> Self {
        Self {
            open_commission: Decimal::new(3, 4),
            close_commission: Decimal::new(3, 4),
            close_tax: Decimal::new(1, 3),
            min_commission: Decimal::new(5, 0),
        }
    }
}

impl CostModel for OrderCost {
    fn commission(&self, side: Side, price: Decimal, quantity: i64) -> Decimal {
        let notional = price * Decimal::from(quantity.abs());
        if notional.is_zero() {
            return Decimal::ZERO;
        }

        let (rate, tax) = match side {
            Side::Buy => (self.open_commission, Decimal::ZERO),
            Side::Sell => (self.close_commission, self.close_tax),
        };

        let commission = (notional * rate).max(self.min_commission);
        (commission + notional * tax).round_dp(2)
    }
}
