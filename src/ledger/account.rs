//! Account ledger: cash, positions and P&L

use super::reconcile::{diff, AccountSnapshot, ReconcileReport};
use super::Position;
use crate::data::{CorporateAction, CorporateActionKind};
use crate::error::{EngineError, Result};
use crate::execution::Fill;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Immutable copy of the ledger for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub as_of: Option<NaiveDateTime>,
    pub cash: Decimal,
    pub positions: BTreeMap<String, Position>,
    pub positions_value: Decimal,
    pub total_value: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_commission: Decimal,
}

impl LedgerSnapshot {
    /// Snapshot of an account holding only cash
    pub fn cash_only(cash: Decimal) -> Self {
        Self {
            as_of: None,
            cash,
            positions: BTreeMap::new(),
            positions_value: Decimal::ZERO,
            total_value: cash,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            total_commission: Decimal::ZERO,
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Held quantity, zero when flat
    pub fn quantity(&self, symbol: &str) -> i64 {
        self.positions.get(symbol).map_or(0, |p| p.quantity)
    }
}

type ActionKey = (String, NaiveDate, CorporateActionKind);

/// Owns cash and positions. Single writer; readers get snapshots.
#[derive(Debug, Clone)]
pub struct Ledger {
    initial_cash: Decimal,
    cash: Decimal,
    positions: BTreeMap<String, Position>,
    realized_pnl: Decimal,
    total_commission: Decimal,
    applied_actions: BTreeSet<ActionKey>,
    fill_count: u64,
    as_of: Option<NaiveDateTime>,
}

impl Ledger {
    /// Create a ledger holding `initial_cash`
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            initial_cash,
            cash: initial_cash,
            positions: BTreeMap::new(),
            realized_pnl: Decimal::ZERO,
            total_commission: Decimal::ZERO,
            applied_actions: BTreeSet::new(),
            fill_count: 0,
            as_of: None,
        }
    }

    pub fn initial_cash(&self) -> Decimal {
        self.initial_cash
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn fill_count(&self) -> u64 {
        self.fill_count
    }

    /// Apply one fill to cash and the symbol's position
    pub fn apply_fill(&mut self, fill: &Fill) {
        if fill.quantity == 0 {
            tracing::debug!(order_id = %fill.order_id, "Ignoring zero-quantity fill");
            return;
        }

        // Buys spend cash, sells raise it; commission always costs
        self.cash -= fill.price * Decimal::from(fill.quantity);
        self.cash -= fill.commission;
        self.total_commission += fill.commission;

        let realized = match self.positions.get_mut(&fill.symbol) {
            Some(position) => position.apply(fill.quantity, fill.price),
            None => {
                self.positions.insert(
                    fill.symbol.clone(),
                    Position::open(&fill.symbol, fill.quantity, fill.price),
                );
                Decimal::ZERO
            }
        };
        self.realized_pnl += realized;

        if self.positions.get(&fill.symbol).is_some_and(|p| p.quantity == 0) {
            self.positions.remove(&fill.symbol);
        }

        self.fill_count += 1;
        self.touch(fill.timestamp);

        tracing::debug!(
            symbol = %fill.symbol,
            order_id = %fill.order_id,
            quantity = fill.quantity,
            price = %fill.price,
            cash = %self.cash,
            "Fill applied"
        );
    }

    /// Apply a corporate action to the held position.
    ///
    /// Each (symbol, ex-date, kind) is applied at most once; returns whether
    /// this call changed the account.
    pub fn apply_corporate_action(&mut self, action: &CorporateAction) -> Result<bool> {
        let key = (action.symbol.clone(), action.ex_date, action.kind);
        if self.applied_actions.contains(&key) {
            return Ok(false);
        }

        let invalid = |detail: &str| EngineError::CorporateActionConflict {
            symbol: action.symbol.clone(),
            ex_date: action.ex_date,
            detail: detail.to_string(),
        };

        match action.kind {
            CorporateActionKind::Split if action.ratio <= Decimal::ZERO => {
                return Err(invalid("split ratio must be positive"));
            }
            CorporateActionKind::Rights if action.ratio < Decimal::ZERO => {
                return Err(invalid("rights ratio must be non-negative"));
            }
            _ => {}
        }

        self.applied_actions.insert(key);

        let Some(position) = self.positions.get_mut(&action.symbol) else {
            return Ok(false);
        };

        match action.kind {
            CorporateActionKind::Dividend => {
                let cash = position.qty() * action.amount;
                self.cash += cash;
                tracing::info!(
                    symbol = %action.symbol,
                    ex_date = %action.ex_date,
                    per_share = %action.amount,
                    cash = %cash,
                    "Dividend credited"
                );
            }
            CorporateActionKind::Split => {
                let old_qty = position.quantity;
                let new_qty = (position.qty() * action.ratio)
                    .trunc()
                    .to_i64()
                    .ok_or_else(|| invalid("split quantity overflow"))?;
                if new_qty != 0 {
                    // Total cost basis is preserved exactly
                    position.avg_cost =
                        position.avg_cost * Decimal::from(old_qty) / Decimal::from(new_qty);
                }
                position.last_price /= action.ratio;
                position.quantity = new_qty;
                tracing::info!(
                    symbol = %action.symbol,
                    ex_date = %action.ex_date,
                    ratio = %action.ratio,
                    old_qty,
                    new_qty,
                    "Split applied"
                );
            }
            CorporateActionKind::Rights => {
                if position.quantity <= 0 {
                    return Ok(false);
                }
                let new_shares = (position.qty() * action.ratio)
                    .floor()
                    .to_i64()
                    .ok_or_else(|| invalid("rights quantity overflow"))?;
                if new_shares == 0 {
                    return Ok(false);
                }
                let cost = Decimal::from(new_shares) * action.amount;
                let held = position.qty();
                let added = Decimal::from(new_shares);
                position.avg_cost = (position.avg_cost * held + cost) / (held + added);
                position.quantity += new_shares;
                self.cash -= cost;
                tracing::info!(
                    symbol = %action.symbol,
                    ex_date = %action.ex_date,
                    new_shares,
                    cost = %cost,
                    "Rights issue subscribed"
                );
            }
        }

        if self.positions.get(&action.symbol).is_some_and(|p| p.quantity == 0) {
            self.positions.remove(&action.symbol);
        }
        Ok(true)
    }

    /// Update the last known price of a held symbol
    pub fn mark(&mut self, symbol: &str, price: Decimal, at: NaiveDateTime) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.last_price = price;
        }
        self.touch(at);
    }

    /// Overwrite local state with the venue's authoritative snapshot
    pub fn reconcile(&mut self, venue: &AccountSnapshot, at: NaiveDateTime) -> ReconcileReport {
        let report = diff(&self.snapshot(), venue);

        self.cash = venue.cash;
        let mut positions = BTreeMap::new();
        for (symbol, vp) in &venue.positions {
            if vp.quantity == 0 {
                continue;
            }
            let local = self.positions.get(symbol);
            positions.insert(
                symbol.clone(),
                Position {
                    symbol: symbol.clone(),
                    quantity: vp.quantity,
                    avg_cost: vp.avg_cost,
                    last_price: vp
                        .last_price
                        .or_else(|| local.map(|p| p.last_price))
                        .unwrap_or(vp.avg_cost),
                    realized_pnl: local.map_or(Decimal::ZERO, |p| p.realized_pnl),
                },
            );
        }
        self.positions = positions;
        self.touch(at);

        report
    }

    /// Immutable copy of current state
    pub fn snapshot(&self) -> LedgerSnapshot {
        let positions_value: Decimal = self.positions.values().map(|p| p.market_value()).sum();
        let unrealized_pnl: Decimal = self.positions.values().map(|p| p.unrealized_pnl()).sum();

        LedgerSnapshot {
            as_of: self.as_of,
            cash: self.cash,
            positions: self.positions.clone(),
            positions_value,
            total_value: self.cash + positions_value,
            realized_pnl: self.realized_pnl,
            unrealized_pnl,
            total_commission: self.total_commission,
        }
    }

    /// Advance the snapshot timestamp; never moves backwards
    pub fn touch(&mut self, at: NaiveDateTime) {
        if self.as_of.map_or(true, |current| current <= at) {
            self.as_of = Some(at);
        }
    }
}
