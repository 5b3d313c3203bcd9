//! The API surface strategy code calls
//!
//! One context exists per run. It forwards orders to the active broker and
//! data queries to the provider; it never matches orders itself. Time only
//! moves when the scheduler advances it.

use super::{Callback, Globals, Schedule, TaskTime};
use crate::config::SessionConfig;
use crate::data::{Bar, DataProvider, Frequency};
use crate::engine::EventLog;
use crate::error::{EngineError, Result};
use crate::execution::{Broker, Order, OrderCost, OrderId, OrderRequest, OrderStatus};
use crate::ledger::LedgerSnapshot;
use crate::telemetry::{self, LatencyMetric};
use chrono::{Duration, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Everything a context is built from
pub(crate) struct ContextParts {
    pub run_id: String,
    pub live: bool,
    pub frequency: Frequency,
    pub session: SessionConfig,
    pub start: NaiveDateTime,
    pub portfolio: LedgerSnapshot,
    pub broker: Arc<dyn Broker>,
    pub provider: Arc<dyn DataProvider>,
    pub events: EventLog,
    pub universe: Vec<String>,
    pub benchmark: Option<String>,
}

/// Per-run strategy context
pub struct StrategyContext {
    /// Strategy globals, scoped to this run
    pub g: Globals,
    run_id: String,
    live: bool,
    frequency: Frequency,
    session: SessionConfig,
    current_dt: NaiveDateTime,
    /// Latest bar timestamp the strategy may see
    revealed: Option<NaiveDateTime>,
    portfolio: LedgerSnapshot,
    broker: Arc<dyn Broker>,
    provider: Arc<dyn DataProvider>,
    events: EventLog,
    schedule: Schedule,
    benchmark: Option<String>,
    universe: Vec<String>,
    prices: BTreeMap<String, Decimal>,
    /// Bars built from live quotes that no provider has yet
    intraday: BTreeMap<String, Vec<Bar>>,
}

impl StrategyContext {
    pub(crate) fn new(parts: ContextParts) -> Self {
        Self {
            g: Globals::new(),
            run_id: parts.run_id,
            live: parts.live,
            frequency: parts.frequency,
            session: parts.session,
            current_dt: parts.start,
            revealed: None,
            portfolio: parts.portfolio,
            broker: parts.broker,
            provider: parts.provider,
            events: parts.events,
            schedule: Schedule::default(),
            benchmark: parts.benchmark,
            universe: parts.universe,
            prices: BTreeMap::new(),
            intraday: BTreeMap::new(),
        }
    }

    // Scheduler-side controls

    pub(crate) fn set_time(&mut self, at: NaiveDateTime) {
        self.current_dt = at;
    }

    pub(crate) fn reveal(&mut self, through: NaiveDateTime) {
        if self.revealed.map_or(true, |r| r < through) {
            self.revealed = Some(through);
        }
    }

    pub(crate) fn set_portfolio(&mut self, snapshot: LedgerSnapshot) {
        self.portfolio = snapshot;
    }

    pub(crate) fn update_price(&mut self, symbol: &str, price: Decimal) {
        self.prices.insert(symbol.to_string(), price);
    }

    pub(crate) fn push_intraday(&mut self, bar: Bar) {
        self.intraday.entry(bar.symbol.clone()).or_default().push(bar);
    }

    pub(crate) fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub(crate) fn benchmark(&self) -> Option<&str> {
        self.benchmark.as_deref()
    }

    pub(crate) fn events(&self) -> &EventLog {
        &self.events
    }

    // Strategy API

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Current engine time (simulated in backtests)
    pub fn current_dt(&self) -> NaiveDateTime {
        self.current_dt
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    /// Latest ledger snapshot
    pub fn portfolio(&self) -> &LedgerSnapshot {
        &self.portfolio
    }

    pub fn universe(&self) -> &[String] {
        &self.universe
    }

    /// Symbols the scheduler loads and reveals each period
    pub fn set_universe(&mut self, symbols: Vec<String>) {
        self.universe = symbols;
    }

    /// Index whose daily bars define the calendar and the comparison series
    pub fn set_benchmark(&mut self, code: impl Into<String>) {
        self.benchmark = Some(code.into());
    }

    /// Replace the commission model for subsequent fills
    pub fn set_order_cost(&mut self, cost: OrderCost) {
        self.broker.set_cost_model(Arc::new(cost));
    }

    /// Market order for `amount` shares (negative sells). Zero is a no-op.
    pub fn order(&self, symbol: &str, amount: i64) -> Result<Option<OrderId>> {
        if amount == 0 {
            return Ok(None);
        }
        self.submit(OrderRequest::market(symbol, amount))
    }

    /// Limit order. Zero is a no-op.
    pub fn order_limit(&self, symbol: &str, amount: i64, limit_price: Decimal) -> Result<Option<OrderId>> {
        if amount == 0 {
            return Ok(None);
        }
        self.submit(OrderRequest::limit(symbol, amount, limit_price))
    }

    /// Market order sized by cash value, truncated to whole shares
    pub fn order_value(&self, symbol: &str, value: Decimal) -> Result<Option<OrderId>> {
        let price = self.reference_price(symbol)?;
        self.order(symbol, shares_for(value, price))
    }

    /// Trade toward holding `target` shares, counting orders still working
    pub fn order_target(&self, symbol: &str, target: i64) -> Result<Option<OrderId>> {
        let held = self.portfolio.quantity(symbol);
        let pending: i64 = self
            .broker
            .open_orders()
            .iter()
            .filter(|o| o.symbol == symbol)
            .map(|o| o.remaining())
            .sum();
        self.order(symbol, target - held - pending)
    }

    /// Trade toward holding `target_value` worth of `symbol`
    pub fn order_target_value(&self, symbol: &str, target_value: Decimal) -> Result<Option<OrderId>> {
        let price = self.reference_price(symbol)?;
        self.order_target(symbol, shares_for(target_value, price))
    }

    pub fn cancel_order(&self, id: OrderId) -> Result<()> {
        self.broker.cancel(id, self.current_dt).inspect_err(|e| {
            self.events.error(self.current_dt, e);
        })
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.broker.open_orders()
    }

    pub fn order_status(&self, id: OrderId) -> Option<OrderStatus> {
        self.broker.order(id).map(|o| o.status)
    }

    pub fn get_order(&self, id: OrderId) -> Option<Order> {
        self.broker.order(id)
    }

    /// Last revealed close, or latest quote in live runs
    pub fn current_price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).copied()
    }

    /// The last `count` bars at the run frequency visible now. Never
    /// includes a bar the scheduler has not yet revealed.
    pub fn history(&self, symbol: &str, count: usize) -> Result<Vec<Bar>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let Some(cutoff) = self.revealed else {
            return Err(self.unavailable(symbol, "no bars revealed yet"));
        };

        let end = cutoff.date();
        let span = match self.frequency {
            Frequency::Day => count as i64 * 2 + 10,
            Frequency::Minute => count as i64 / 200 + 5,
        };
        let intraday = self.intraday.get(symbol);

        let mut bars = match self
            .provider
            .bars(symbol, end - Duration::days(span), end, self.frequency)
        {
            Ok(bars) => bars,
            Err(EngineError::DataUnavailable { .. }) if intraday.is_some() => Vec::new(),
            Err(e) => {
                self.events.error(self.current_dt, &e);
                return Err(e);
            }
        };
        bars.retain(|b| b.timestamp <= cutoff);

        if let Some(extra) = intraday {
            let last = bars.last().map(|b| b.timestamp);
            bars.extend(
                extra
                    .iter()
                    .filter(|b| b.timestamp <= cutoff && last.map_or(true, |l| b.timestamp > l))
                    .cloned(),
            );
        }

        if bars.is_empty() {
            return Err(self.unavailable(symbol, format!("no bars at or before {cutoff}")));
        }
        let skip = bars.len().saturating_sub(count);
        Ok(bars.split_off(skip))
    }

    /// Register a daily task. `time` is `HH:MM[:SS]` or one of
    /// `before_open`, `open`, `close`, `after_close`, `every_bar`.
    pub fn run_daily(
        &mut self,
        callback: impl Fn(&mut StrategyContext) -> anyhow::Result<()> + Send + Sync + 'static,
        time: &str,
    ) -> Result<()> {
        self.add_task(None, callback, time)
    }

    /// `run_daily` with a name used in logs and fault reports
    pub fn run_daily_named(
        &mut self,
        name: &str,
        callback: impl Fn(&mut StrategyContext) -> anyhow::Result<()> + Send + Sync + 'static,
        time: &str,
    ) -> Result<()> {
        self.add_task(Some(name.to_string()), callback, time)
    }

    fn add_task(
        &mut self,
        name: Option<String>,
        callback: impl Fn(&mut StrategyContext) -> anyhow::Result<()> + Send + Sync + 'static,
        time: &str,
    ) -> Result<()> {
        let time: TaskTime = time.parse()?;
        let callback: Callback = Arc::new(callback);
        let seq = self.schedule.add(name, time, callback);
        tracing::debug!(seq, %time, "Daily task registered");
        Ok(())
    }

    pub fn log_info(&self, message: impl Into<String>) {
        self.events.info(self.current_dt, "strategy", message);
    }

    pub fn log_warn(&self, message: impl Into<String>) {
        self.events.warn(self.current_dt, "strategy", message);
    }

    fn submit(&self, request: OrderRequest) -> Result<Option<OrderId>> {
        let started = Instant::now();
        let result = self.broker.submit(request, &self.portfolio, self.current_dt);
        telemetry::record_latency(LatencyMetric::OrderSubmission, started.elapsed());
        match result {
            Ok(id) => Ok(Some(id)),
            Err(e) => {
                self.events.error(self.current_dt, &e);
                Err(e)
            }
        }
    }

    fn reference_price(&self, symbol: &str) -> Result<Decimal> {
        self.current_price(symbol)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| self.unavailable(symbol, "no price revealed yet"))
    }

    fn unavailable(&self, symbol: &str, detail: impl Into<String>) -> EngineError {
        let err = EngineError::data_unavailable(symbol, detail);
        self.events.error(self.current_dt, &err);
        err
    }
}

fn shares_for(value: Decimal, price: Decimal) -> i64 {
    (value / price).trunc().to_i64().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryProvider;
    use crate::execution::{BacktestBroker, MatchingPolicy};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn bar(d: u32, close: Decimal) -> Bar {
        Bar {
            symbol: "X".into(),
            timestamp: day(d),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(100000),
        }
    }

    fn context() -> (StrategyContext, Arc<BacktestBroker>) {
        let broker = Arc::new(BacktestBroker::new(
            "run",
            MatchingPolicy::default(),
            Arc::new(OrderCost::zero()),
        ));
        broker.begin_period(vec!["X".to_string()]);
        let provider = MemoryProvider::new()
            .with_bars(Frequency::Day, (2..=5).map(|d| bar(d, Decimal::from(d))));
        let ctx = StrategyContext::new(ContextParts {
            run_id: "run".into(),
            live: false,
            frequency: Frequency::Day,
            session: SessionConfig::default(),
            start: day(2),
            portfolio: LedgerSnapshot::cash_only(dec!(100000)),
            broker: broker.clone(),
            provider: Arc::new(provider),
            events: EventLog::default(),
            universe: vec!["X".into()],
            benchmark: None,
        });
        (ctx, broker)
    }

    #[test]
    fn test_zero_order_is_noop() {
        let (ctx, broker) = context();
        assert_eq!(ctx.order("X", 0).unwrap(), None);
        assert!(broker.orders().is_empty());
    }

    #[test]
    fn test_order_target_counts_pending() {
        let (ctx, _broker) = context();
        ctx.order("X", 100).unwrap();
        // 100 already working; target 300 needs 200 more
        let id = ctx.order_target("X", 300).unwrap().unwrap();
        assert_eq!(ctx.get_order(id).unwrap().quantity, 200);
        assert_eq!(ctx.order_target("X", 300).unwrap(), None);
    }

    #[test]
    fn test_history_hides_unrevealed_bars() {
        let (mut ctx, _broker) = context();
        assert!(matches!(
            ctx.history("X", 2),
            Err(EngineError::DataUnavailable { .. })
        ));

        ctx.reveal(day(3));
        let bars = ctx.history("X", 5).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars.last().unwrap().timestamp, day(3));

        ctx.reveal(day(5));
        let bars = ctx.history("X", 2).unwrap();
        assert_eq!(bars.iter().map(|b| b.close).collect::<Vec<_>>(), vec![dec!(4), dec!(5)]);
    }

    #[test]
    fn test_order_value_uses_revealed_price() {
        let (mut ctx, _broker) = context();
        assert!(ctx.order_value("X", dec!(1000)).is_err());

        ctx.update_price("X", dec!(3));
        let id = ctx.order_value("X", dec!(1000)).unwrap().unwrap();
        assert_eq!(ctx.get_order(id).unwrap().quantity, 333);
    }

    #[test]
    fn test_rejection_reaches_event_stream() {
        let (ctx, _broker) = context();
        assert!(ctx.order("X", -10).is_err());
        assert_eq!(ctx.events().count("order_rejected"), 1);
        assert_eq!(ctx.order_status(OrderId(1)), Some(OrderStatus::Rejected));
    }

    #[test]
    fn test_run_daily_registers_in_order() {
        let (mut ctx, _broker) = context();
        ctx.run_daily(|_| Ok(()), "open").unwrap();
        ctx.run_daily_named("rebalance", |_| Ok(()), "14:50").unwrap();
        assert!(ctx.run_daily(|_| Ok(()), "later").is_err());
        assert_eq!(ctx.schedule().len(), 2);
    }
}
