//! Prometheus metrics

use crate::ledger::LedgerSnapshot;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::time::Duration;

/// Latency metric types
#[derive(Debug, Clone, Copy)]
pub enum LatencyMetric {
    /// Strategy order call to broker acknowledgment
    OrderSubmission,
    /// Venue snapshot fetch during reconciliation
    Reconciliation,
    /// One full scheduler period (trading day)
    Period,
}

/// Gauge metric types
#[derive(Debug, Clone, Copy)]
pub enum GaugeMetric {
    /// Current equity
    Equity,
    /// Cash balance
    Cash,
    /// Unrealized P&L
    UnrealizedPnl,
    /// Realized P&L
    RealizedPnl,
    /// Open position count
    OpenPositions,
}

/// Counter metric types
#[derive(Debug, Clone, Copy)]
pub enum CounterMetric {
    OrdersSubmitted,
    OrdersRejected,
    Fills,
    BrokerReconnects,
    ReconcileDrifts,
    StrategyErrors,
}

fn latency_name(metric: LatencyMetric) -> &'static str {
    match metric {
        LatencyMetric::OrderSubmission => "bullet_order_submission_latency_ms",
        LatencyMetric::Reconciliation => "bullet_reconciliation_latency_ms",
        LatencyMetric::Period => "bullet_period_latency_ms",
    }
}

fn gauge_name(metric: GaugeMetric) -> &'static str {
    match metric {
        GaugeMetric::Equity => "bullet_equity",
        GaugeMetric::Cash => "bullet_cash",
        GaugeMetric::UnrealizedPnl => "bullet_unrealized_pnl",
        GaugeMetric::RealizedPnl => "bullet_realized_pnl",
        GaugeMetric::OpenPositions => "bullet_open_positions",
    }
}

fn counter_name(metric: CounterMetric) -> &'static str {
    match metric {
        CounterMetric::OrdersSubmitted => "bullet_orders_submitted_total",
        CounterMetric::OrdersRejected => "bullet_orders_rejected_total",
        CounterMetric::Fills => "bullet_fills_total",
        CounterMetric::BrokerReconnects => "bullet_broker_reconnects_total",
        CounterMetric::ReconcileDrifts => "bullet_reconcile_drifts_total",
        CounterMetric::StrategyErrors => "bullet_strategy_errors_total",
    }
}

/// Record a latency measurement
pub fn record_latency(metric: LatencyMetric, duration: Duration) {
    metrics::histogram!(latency_name(metric)).record(duration.as_secs_f64() * 1000.0);
}

/// Set a gauge value
pub fn set_gauge(metric: GaugeMetric, value: f64) {
    metrics::gauge!(gauge_name(metric)).set(value);
}

/// Increment a counter
pub fn increment(metric: CounterMetric, by: u64) {
    metrics::counter!(counter_name(metric)).increment(by);
}

fn as_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Publish account gauges from a ledger snapshot
pub fn record_snapshot(snapshot: &LedgerSnapshot) {
    set_gauge(GaugeMetric::Equity, as_f64(snapshot.total_value));
    set_gauge(GaugeMetric::Cash, as_f64(snapshot.cash));
    set_gauge(GaugeMetric::UnrealizedPnl, as_f64(snapshot.unrealized_pnl));
    set_gauge(GaugeMetric::RealizedPnl, as_f64(snapshot.realized_pnl));
    set_gauge(GaugeMetric::OpenPositions, snapshot.positions.len() as f64);
}

/// Count differences found by a reconciliation pass
pub fn record_reconcile_drift(diffs: usize) {
    increment(CounterMetric::ReconcileDrifts, diffs as u64);
}
