//! Reconciliation of local state against a venue snapshot

use super::LedgerSnapshot;
use crate::execution::{Order, OrderId, OrderStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A position as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub quantity: i64,
    pub avg_cost: Decimal,
    #[serde(default)]
    pub last_price: Option<Decimal>,
}

/// A working order as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueOrder {
    pub order_id: OrderId,
    pub symbol: String,
    pub filled: i64,
    pub status: OrderStatus,
}

/// Authoritative account state fetched from a live venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub cash: Decimal,
    #[serde(default)]
    pub positions: BTreeMap<String, VenuePosition>,
    #[serde(default)]
    pub orders: Vec<VenueOrder>,
}

impl AccountSnapshot {
    /// Snapshot holding only cash
    pub fn new(cash: Decimal) -> Self {
        Self {
            cash,
            positions: BTreeMap::new(),
            orders: vec![],
        }
    }
}

/// One disagreement between local and venue state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "diff", rename_all = "snake_case")]
pub enum ReconcileDiff {
    Cash {
        local: Decimal,
        venue: Decimal,
    },
    PositionQty {
        symbol: String,
        local_qty: i64,
        venue_qty: i64,
    },
    UnknownVenueOrder {
        order_id: OrderId,
    },
    OrderState {
        order_id: OrderId,
        local_status: OrderStatus,
        venue_status: OrderStatus,
        local_filled: i64,
        venue_filled: i64,
    },
}

/// Ordered list of differences found by one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub diffs: Vec<ReconcileDiff>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn extend(&mut self, more: Vec<ReconcileDiff>) {
        self.diffs.extend(more);
    }
}

/// Compare cash and positions. Symbols are visited in sorted order.
pub fn diff(local: &LedgerSnapshot, venue: &AccountSnapshot) -> ReconcileReport {
    let mut diffs = Vec::new();

    if local.cash != venue.cash {
        diffs.push(ReconcileDiff::Cash {
            local: local.cash,
            venue: venue.cash,
        });
    }

    let symbols: BTreeSet<&String> = local.positions.keys().chain(venue.positions.keys()).collect();
    for symbol in symbols {
        let local_qty = local.quantity(symbol);
        let venue_qty = venue.positions.get(symbol).map_or(0, |p| p.quantity);
        if local_qty != venue_qty {
            diffs.push(ReconcileDiff::PositionQty {
                symbol: symbol.clone(),
                local_qty,
                venue_qty,
            });
        }
    }

    ReconcileReport { diffs }
}

/// Compare locally tracked orders with the venue's working orders.
///
/// A local open order the venue no longer lists was closed while we were
/// not looking. It counts as filled as far as the venue position moved past
/// `held` in its direction, and as cancelled for the rest.
pub fn diff_orders(
    local: &BTreeMap<OrderId, Order>,
    held: &LedgerSnapshot,
    venue: &AccountSnapshot,
) -> Vec<ReconcileDiff> {
    let mut venue_sorted: Vec<&VenueOrder> = venue.orders.iter().collect();
    venue_sorted.sort_by_key(|o| o.order_id);

    let mut diffs = Vec::new();
    for remote in &venue_sorted {
        match local.get(&remote.order_id) {
            None => diffs.push(ReconcileDiff::UnknownVenueOrder {
                order_id: remote.order_id,
            }),
            Some(order) if order.status != remote.status || order.filled != remote.filled => {
                diffs.push(ReconcileDiff::OrderState {
                    order_id: remote.order_id,
                    local_status: order.status,
                    venue_status: remote.status,
                    local_filled: order.filled,
                    venue_filled: remote.filled,
                });
            }
            Some(_) => {}
        }
    }

    let listed: BTreeSet<OrderId> = venue_sorted.iter().map(|o| o.order_id).collect();
    let mut unexplained: BTreeMap<&str, i64> = BTreeMap::new();
    for order in local.values() {
        if !order.is_open() || listed.contains(&order.id) {
            continue;
        }
        let moved = unexplained.entry(order.symbol.as_str()).or_insert_with(|| {
            let venue_qty = venue.positions.get(&order.symbol).map_or(0, |p| p.quantity);
            venue_qty - held.quantity(&order.symbol)
        });

        let remaining = order.remaining();
        let done = if remaining.signum() == moved.signum() {
            remaining.abs().min(moved.abs()) * remaining.signum()
        } else {
            0
        };
        *moved -= done;

        let venue_filled = order.filled + done;
        diffs.push(ReconcileDiff::OrderState {
            order_id: order.id,
            local_status: order.status,
            venue_status: if venue_filled == order.quantity {
                OrderStatus::Filled
            } else {
                OrderStatus::Cancelled
            },
            local_filled: order.filled,
            venue_filled,
        });
    }
    diffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::OrderRequest;
    use crate::ledger::Ledger;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[test]
    fn test_clean_when_identical() {
        let ledger = Ledger::new(dec!(1000));
        let report = diff(&ledger.snapshot(), &AccountSnapshot::new(dec!(1000)));
        assert!(report.is_clean());
    }

    #[test]
    fn test_diffs_are_sorted_by_symbol() {
        let local = LedgerSnapshot::cash_only(dec!(1000));
        let mut venue = AccountSnapshot::new(dec!(900));
        for symbol in ["Z", "A", "M"] {
            venue.positions.insert(
                symbol.to_string(),
                VenuePosition {
                    quantity: 10,
                    avg_cost: dec!(10),
                    last_price: None,
                },
            );
        }

        let report = diff(&local, &venue);
        assert_eq!(report.diffs.len(), 4);
        assert!(matches!(report.diffs[0], ReconcileDiff::Cash { .. }));
        let symbols: Vec<&str> = report
            .diffs
            .iter()
            .filter_map(|d| match d {
                ReconcileDiff::PositionQty { symbol, .. } => Some(symbol.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(symbols, vec!["A", "M", "Z"]);
    }

    #[test]
    fn test_order_diffs() {
        let now = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let mut local = BTreeMap::new();
        local.insert(
            OrderId(1),
            Order::new(OrderId(1), OrderRequest::market("X", 100), "run", now),
        );

        let mut venue = AccountSnapshot::new(dec!(1000));
        venue.orders = vec![
            VenueOrder {
                order_id: OrderId(9),
                symbol: "Y".into(),
                filled: 0,
                status: OrderStatus::Pending,
            },
            VenueOrder {
                order_id: OrderId(1),
                symbol: "X".into(),
                filled: 40,
                status: OrderStatus::PartiallyFilled,
            },
        ];

        let diffs = diff_orders(&local, &LedgerSnapshot::cash_only(dec!(1000)), &venue);
        assert_eq!(diffs.len(), 2);
        assert!(matches!(diffs[0], ReconcileDiff::OrderState { order_id: OrderId(1), .. }));
        assert!(matches!(diffs[1], ReconcileDiff::UnknownVenueOrder { order_id: OrderId(9) }));
    }

    #[test]
    fn test_orders_missing_at_venue_are_closed() {
        let now = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let mut local = BTreeMap::new();
        local.insert(
            OrderId(1),
            Order::new(OrderId(1), OrderRequest::limit("X", 100, dec!(9)), "run", now),
        );
        local.insert(
            OrderId(2),
            Order::new(OrderId(2), OrderRequest::limit("X", 50, dec!(8)), "run", now),
        );
        local.insert(
            OrderId(3),
            Order::new(OrderId(3), OrderRequest::limit("Y", 10, dec!(5)), "run", now),
        );

        // The venue holds 120 X and nothing of Y; none of the orders are working
        let mut venue = AccountSnapshot::new(dec!(0));
        venue.positions.insert(
            "X".into(),
            VenuePosition {
                quantity: 120,
                avg_cost: dec!(9),
                last_price: None,
            },
        );

        let diffs = diff_orders(&local, &LedgerSnapshot::cash_only(dec!(1000)), &venue);
        assert_eq!(
            diffs,
            vec![
                ReconcileDiff::OrderState {
                    order_id: OrderId(1),
                    local_status: OrderStatus::Pending,
                    venue_status: OrderStatus::Filled,
                    local_filled: 0,
                    venue_filled: 100,
                },
                ReconcileDiff::OrderState {
                    order_id: OrderId(2),
                    local_status: OrderStatus::Pending,
                    venue_status: OrderStatus::Cancelled,
                    local_filled: 0,
                    venue_filled: 20,
                },
                ReconcileDiff::OrderState {
                    order_id: OrderId(3),
                    local_status: OrderStatus::Pending,
                    venue_status: OrderStatus::Cancelled,
                    local_filled: 0,
                    venue_filled: 0,
                },
            ]
        );
    }
}
