//! Account ledger module
//!
//! Owns cash, positions and P&L. Consumes fills from whichever broker is
//! active and hands out immutable snapshots for reporting.

mod account;
mod position;
mod reconcile;
mod service;

pub use account::{Ledger, LedgerSnapshot};
pub use position::Position;
pub use reconcile::{
    diff, diff_orders, AccountSnapshot, ReconcileDiff, ReconcileReport, VenueOrder, VenuePosition,
};
pub use service::{spawn_ledger, LedgerCommand, LedgerHandle};
