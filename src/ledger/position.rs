//! Position tracking

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A held position in one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed share count (negative when short)
    pub quantity: i64,
    /// Average cost per share, excluding commission
    pub avg_cost: Decimal,
    /// Latest known market price
    pub last_price: Decimal,
    /// P&L realized by partial closes while this position stayed open
    pub realized_pnl: Decimal,
}

impl Position {
    /// Open a position from a first execution
    pub fn open(symbol: impl Into<String>, quantity: i64, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            avg_cost: price,
            last_price: price,
            realized_pnl: Decimal::ZERO,
        }
    }

    /// Quantity as a decimal
    pub fn qty(&self) -> Decimal {
        Decimal::from(self.quantity)
    }

    /// Signed market value at the last price
    pub fn market_value(&self) -> Decimal {
        self.qty() * self.last_price
    }

    /// Signed cost of the position
    pub fn cost_basis(&self) -> Decimal {
        self.qty() * self.avg_cost
    }

    /// Mark-to-market P&L on the open quantity
    pub fn unrealized_pnl(&self) -> Decimal {
        (self.last_price - self.avg_cost) * self.qty()
    }

    /// Apply a signed execution. Returns the P&L realized by any closed part.
    pub fn apply(&mut self, quantity: i64, price: Decimal) -> Decimal {
        self.last_price = price;

        if self.quantity == 0 || self.quantity.signum() == quantity.signum() {
            let held = Decimal::from(self.quantity.abs());
            let added = Decimal::from(quantity.abs());
            self.avg_cost = (self.avg_cost * held + price * added) / (held + added);
            self.quantity += quantity;
            return Decimal::ZERO;
        }

        let closing = self.quantity.abs().min(quantity.abs());
        let direction = Decimal::from(self.quantity.signum());
        let realized = (price - self.avg_cost) * Decimal::from(closing) * direction;
        self.realized_pnl += realized;

        let before = self.quantity;
        self.quantity += quantity;
        if self.quantity != 0 && self.quantity.signum() != before.signum() {
            // Flipped through zero: the remainder opens at this price
            self.avg_cost = price;
        }
        realized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_add_averages_cost() {
        let mut pos = Position::open("X", 100, dec!(10));
        pos.apply(100, dec!(12));
        assert_eq!(pos.quantity, 200);
        assert_eq!(pos.avg_cost, dec!(11));
        assert_eq!(pos.last_price, dec!(12));
    }

    #[test]
    fn test_partial_close_realizes_against_average() {
        let mut pos = Position::open("X", 200, dec!(11));
        let realized = pos.apply(-50, dec!(13));
        assert_eq!(realized, dec!(100));
        assert_eq!(pos.quantity, 150);
        assert_eq!(pos.avg_cost, dec!(11));
        assert_eq!(pos.realized_pnl, dec!(100));
    }

    #[test]
    fn test_short_close_realizes_inverted() {
        let mut pos = Position::open("X", -100, dec!(20));
        let realized = pos.apply(100, dec!(18));
        assert_eq!(realized, dec!(200));
        assert_eq!(pos.quantity, 0);
    }

    #[test]
    fn test_flip_resets_cost() {
        let mut pos = Position::open("X", 100, dec!(10));
        let realized = pos.apply(-150, dec!(12));
        assert_eq!(realized, dec!(200));
        assert_eq!(pos.quantity, -50);
        assert_eq!(pos.avg_cost, dec!(12));
    }

    #[test]
    fn test_unrealized_and_market_value() {
        let mut pos = Position::open("X", 100, dec!(10));
        pos.last_price = dec!(10.5);
        assert_eq!(pos.market_value(), dec!(1050));
        assert_eq!(pos.unrealized_pnl(), dec!(50));
        assert_eq!(pos.cost_basis(), dec!(1000));
    }
}
