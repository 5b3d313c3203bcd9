//! Deterministic historical replay
//!
//! Single-threaded: each period runs to completion, fills included, before
//! the next one starts. Every input comes from the data provider, so the
//! same configuration and data always produce the same orders and fills.

use super::clock::{plan_day, Step};
use super::results::{create_run_dir, new_run_id, write_report};
use super::{invoke, EventLog, RunControl, RunReport, RunState};
use crate::config::Config;
use crate::data::{resolve_conflicts, Bar, CorporateAction, DataProvider, Frequency};
use crate::error::{EngineError, Result};
use crate::execution::{BacktestBroker, Broker, CostModel, MatchingPolicy};
use crate::ledger::{Ledger, LedgerSnapshot};
use crate::strategy::{BarData, ContextParts, StrategyContext, StrategyModule};
use crate::telemetry::{self, LatencyMetric};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Why a replay stopped early
enum Halt {
    Cancelled,
    Fault(EngineError),
}

impl From<EngineError> for Halt {
    fn from(err: EngineError) -> Self {
        Halt::Fault(err)
    }
}

/// One configured backtest, ready to run
pub struct BacktestEngine {
    config: Config,
    module: StrategyModule,
    provider: Arc<dyn DataProvider>,
    run_id: String,
    run_dir: Option<PathBuf>,
    events: EventLog,
    control: Arc<RunControl>,
}

impl BacktestEngine {
    /// Validate the configuration and create the run directory when a
    /// result root is configured. The run id defaults to the directory name.
    pub fn new(
        config: Config,
        module: StrategyModule,
        provider: Arc<dyn DataProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let run_dir = match &config.run.result_dir {
            Some(base) => Some(create_run_dir(base)?),
            None => None,
        };
        let run_id = run_dir
            .as_ref()
            .and_then(|d| d.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(new_run_id);

        let events = EventLog::default();
        let control = RunControl::new(false, events.clone());

        Ok(Self {
            config,
            module,
            provider,
            run_id,
            run_dir,
            events,
            control,
        })
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    pub fn events(&self) -> EventLog {
        self.events.clone()
    }

    pub(crate) fn control(&self) -> Arc<RunControl> {
        self.control.clone()
    }

    /// Replay the whole window on the calling thread
    pub fn run(self) -> Result<RunReport> {
        let started = Instant::now();
        let cost: Arc<dyn CostModel> = Arc::new(self.config.cost.order_cost());
        let broker = Arc::new(BacktestBroker::new(
            self.run_id.clone(),
            MatchingPolicy::from_config(&self.config),
            cost,
        ));
        let mut replay = Replay::new(&self, broker.clone());

        tracing::info!(
            run_id = %self.run_id,
            strategy = self.module.name(),
            start = %self.config.run.start_date,
            end = %self.config.run.end_date,
            frequency = %self.config.run.frequency,
            "Starting backtest"
        );

        self.control.set_time(replay.ctx.current_dt());
        self.control.advance(RunState::Running)?;

        let (state, fault) = match replay.execute() {
            Ok(()) => (RunState::Finished, None),
            Err(Halt::Cancelled) => (RunState::Aborted, Some("cancelled".to_string())),
            Err(Halt::Fault(err)) => {
                self.events.error(replay.ctx.current_dt(), &err);
                (RunState::Aborted, Some(err.to_string()))
            }
        };

        let end_at = replay.ctx.current_dt();
        let cancelled = broker.cancel_all(end_at);
        if !cancelled.is_empty() {
            self.events.info(
                end_at,
                "orders_cancelled",
                format!("{} order(s) still open at end of run cancelled", cancelled.len()),
            );
        }

        self.control.advance(state)?;

        let report = RunReport {
            run_id: self.run_id.clone(),
            state,
            run_dir: self.run_dir.clone(),
            orders: broker.orders(),
            fills: broker.fills(),
            snapshots: replay.snapshots,
            benchmark: replay.benchmark,
            events: self.events.history(),
            fault,
        };

        if let Some(dir) = &self.run_dir {
            if let Err(e) = write_report(dir, &report) {
                self.events.error(end_at, &e);
            }
        }

        tracing::info!(
            run_id = %self.run_id,
            state = %report.state,
            orders = report.orders.len(),
            fills = report.fills.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backtest finished"
        );
        Ok(report)
    }
}

/// Mutable state of one replay
struct Replay<'a> {
    config: &'a Config,
    module: &'a StrategyModule,
    provider: &'a dyn DataProvider,
    events: &'a EventLog,
    control: &'a RunControl,
    broker: Arc<BacktestBroker>,
    ledger: Ledger,
    ctx: StrategyContext,
    series: BTreeMap<String, Vec<Bar>>,
    actions: BTreeMap<String, Vec<CorporateAction>>,
    snapshots: Vec<LedgerSnapshot>,
    benchmark: Vec<Bar>,
    last_period: Option<NaiveDate>,
}

impl<'a> Replay<'a> {
    fn new(engine: &'a BacktestEngine, broker: Arc<BacktestBroker>) -> Self {
        let config = &engine.config;
        let ledger = Ledger::new(config.run.initial_cash);
        let start = config
            .run
            .start_date
            .and_time(config.session.before_open);

        let ctx = StrategyContext::new(ContextParts {
            run_id: engine.run_id.clone(),
            live: false,
            frequency: config.run.frequency,
            session: config.session.clone(),
            start,
            portfolio: ledger.snapshot(),
            broker: broker.clone(),
            provider: engine.provider.clone(),
            events: engine.events.clone(),
            universe: config.run.universe.clone(),
            benchmark: config.run.benchmark.clone(),
        });

        Self {
            config,
            module: &engine.module,
            provider: engine.provider.as_ref(),
            events: &engine.events,
            control: &engine.control,
            broker,
            ledger,
            ctx,
            series: BTreeMap::new(),
            actions: BTreeMap::new(),
            snapshots: Vec::new(),
            benchmark: Vec::new(),
            last_period: None,
        }
    }

    fn execute(&mut self) -> std::result::Result<(), Halt> {
        invoke("initialize", &mut self.ctx, |c| (self.module.initialize)(c))?;
        self.ctx.g.apply_overrides(&self.config.params);

        let calendar = self.calendar();
        if calendar.is_empty() {
            self.events.warn(
                self.ctx.current_dt(),
                "calendar",
                "no trading days in the configured window",
            );
        }

        for day in calendar {
            if self.control.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            let period_started = Instant::now();
            self.period(day)?;
            telemetry::record_latency(LatencyMetric::Period, period_started.elapsed());
        }
        Ok(())
    }

    /// Benchmark bar dates when a benchmark is set, else the dates present
    /// in the universe's bars, else the provider calendar.
    fn calendar(&mut self) -> Vec<NaiveDate> {
        let (start, end) = (self.config.run.start_date, self.config.run.end_date);
        let at = self.ctx.current_dt();

        if let Some(code) = self.ctx.benchmark().map(str::to_string) {
            match self.provider.benchmark(&code, start, end) {
                Ok(bars) => {
                    self.benchmark = bars;
                    let days: BTreeSet<NaiveDate> =
                        self.benchmark.iter().map(Bar::date).collect();
                    return days.into_iter().collect();
                }
                Err(e) => self.events.error(at, &e),
            }
        }

        let universe = self.ctx.universe().to_vec();
        for symbol in &universe {
            self.load(symbol);
        }
        let days: BTreeSet<NaiveDate> = universe
            .iter()
            .filter_map(|s| self.series.get(s))
            .flatten()
            .map(Bar::date)
            .filter(|d| *d >= start && *d <= end)
            .collect();
        if !days.is_empty() {
            return days.into_iter().collect();
        }

        match self.provider.trading_days(start, end) {
            Ok(days) => days,
            Err(e) => {
                self.events.error(at, &e);
                Vec::new()
            }
        }
    }

    /// Fetch a symbol's series and corporate actions once per run
    fn load(&mut self, symbol: &str) {
        if self.series.contains_key(symbol) {
            return;
        }
        let (start, end) = (self.config.run.start_date, self.config.run.end_date);
        let at = self.ctx.current_dt();

        // The warm-up range primes the provider cache for history() calls
        let warm = start - Duration::days(i64::from(self.config.data.warmup_days));
        let bars = match self
            .provider
            .bars(symbol, warm, end, self.config.run.frequency)
        {
            Ok(bars) => bars.into_iter().filter(|b| b.date() >= start).collect(),
            Err(e) => {
                self.events.error(at, &e);
                Vec::new()
            }
        };
        tracing::debug!(symbol, bars = bars.len(), "Series loaded");
        self.series.insert(symbol.to_string(), bars);

        let actions = match self.provider.corporate_actions(symbol, start, end) {
            Ok(actions) => actions,
            Err(EngineError::DataUnavailable { .. }) => Vec::new(),
            Err(e) => {
                self.events.error(at, &e);
                Vec::new()
            }
        };
        let (resolved, conflicts) = resolve_conflicts(actions);
        for conflict in &conflicts {
            self.events.error(at, &conflict.to_error());
        }
        self.actions.insert(symbol.to_string(), resolved);
    }

    /// Load the universe and open the period for symbols with a bar today
    fn prepare(&mut self, day: NaiveDate) {
        let mut symbols: BTreeSet<String> = self.ctx.universe().iter().cloned().collect();
        symbols.extend(self.broker.open_symbols());
        for symbol in &symbols {
            self.load(symbol);
        }

        let tradable: Vec<String> = self
            .series
            .iter()
            .filter(|(_, bars)| day_slice(bars, day).first().is_some())
            .map(|(symbol, _)| symbol.clone())
            .collect();
        self.broker.begin_period(tradable);
    }

    fn period(&mut self, day: NaiveDate) -> std::result::Result<(), Halt> {
        let session = self.config.session.clone();
        self.set_time(day.and_time(session.before_open));
        tracing::debug!(date = %day, "Period start");

        self.apply_corporate_actions(day);
        self.prepare(day);
        self.refresh_portfolio();

        if let Some(f) = self.module.before_trading_start.clone() {
            invoke("before_trading_start", &mut self.ctx, |c| f(c))?;
        }
        // The universe may have changed
        self.prepare(day);

        let bar_times = match self.config.run.frequency {
            Frequency::Day => Vec::new(),
            Frequency::Minute => self.minute_times(day),
        };
        let steps = plan_day(
            self.ctx.schedule(),
            &session,
            self.config.run.frequency,
            &bar_times,
        );

        for planned in steps {
            if self.control.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            match planned.step {
                Step::Task(task) => {
                    self.set_time(day.and_time(planned.at));
                    self.refresh_portfolio();
                    invoke(&task.name, &mut self.ctx, |c| (task.callback)(c))?;
                }
                Step::Open => self.open_session(day),
                Step::Session => self.daily_bars(day)?,
                Step::Bar(ts) => self.minute_bar(day, ts)?,
                Step::AfterTradingClose => {
                    self.set_time(day.and_time(session.after_close));
                    self.refresh_portfolio();
                    if let Some(f) = self.module.after_trading_close.clone() {
                        invoke("after_trading_close", &mut self.ctx, |c| f(c))?;
                    }
                }
            }
        }

        self.ledger.touch(day.and_time(session.after_close));
        let snapshot = self.ledger.snapshot();
        telemetry::record_snapshot(&snapshot);
        self.snapshots.push(snapshot);
        self.last_period = Some(day);
        Ok(())
    }

    /// Apply actions with ex-dates after the previous period, up to `day`
    fn apply_corporate_actions(&mut self, day: NaiveDate) {
        let held: Vec<String> = self.ledger.snapshot().positions.into_keys().collect();
        for symbol in &held {
            self.load(symbol);
        }

        let after = self.last_period;
        let mut due: Vec<CorporateAction> = self
            .actions
            .values()
            .flatten()
            .filter(|a| a.ex_date <= day && after.map_or(true, |p| a.ex_date > p))
            .cloned()
            .collect();
        due.sort_by(|a, b| (a.ex_date, &a.symbol).cmp(&(b.ex_date, &b.symbol)));

        let at = self.ctx.current_dt();
        for action in due {
            match self.ledger.apply_corporate_action(&action) {
                Ok(true) => self.events.info(
                    at,
                    "corporate_action",
                    format!(
                        "{} {} ex {} applied (ratio {}, amount {})",
                        action.symbol, action.kind, action.ex_date, action.ratio, action.amount
                    ),
                ),
                Ok(false) => {}
                Err(e) => self.events.error(at, &e),
            }
        }
    }

    fn day_bars(&self, day: NaiveDate) -> Vec<Bar> {
        self.series
            .values()
            .filter_map(|bars| day_slice(bars, day).first().cloned())
            .collect()
    }

    /// Match open orders against the day's bars at the open
    fn open_session(&mut self, day: NaiveDate) {
        let open_at = day.and_time(self.config.session.open);
        self.set_time(open_at);
        let bars = self.day_bars(day);
        self.match_bars(&bars, open_at);
    }

    fn daily_bars(&mut self, day: NaiveDate) -> std::result::Result<(), Halt> {
        let close_at = day.and_time(self.config.session.close);
        let bars = self.day_bars(day);
        for bar in &bars {
            self.ledger.mark(&bar.symbol, bar.close, close_at);
        }

        self.set_time(close_at);
        self.ctx.reveal(day.and_time(chrono::NaiveTime::MIN));
        self.deliver(day.and_time(chrono::NaiveTime::MIN), bars)
    }

    fn minute_bar(&mut self, day: NaiveDate, ts: NaiveDateTime) -> std::result::Result<(), Halt> {
        self.set_time(ts);
        let per_bar = self.ctx.schedule().per_bar();
        for task in per_bar {
            self.refresh_portfolio();
            invoke(&task.name, &mut self.ctx, |c| (task.callback)(c))?;
        }

        let bars: Vec<Bar> = self
            .series
            .values()
            .filter_map(|bars| {
                let slice = day_slice(bars, day);
                slice
                    .binary_search_by_key(&ts, |b| b.timestamp)
                    .ok()
                    .map(|i| slice[i].clone())
            })
            .collect();

        self.match_bars(&bars, ts);
        for bar in &bars {
            self.ledger.mark(&bar.symbol, bar.close, ts);
        }

        self.ctx.reveal(ts);
        self.deliver(ts, bars)
    }

    /// Match open orders against each bar, symbols in order
    fn match_bars(&mut self, bars: &[Bar], at: NaiveDateTime) {
        for bar in bars {
            let fills = self.broker.match_bar(bar, &self.ledger.snapshot(), at);
            for fill in &fills {
                self.ledger.apply_fill(fill);
            }
        }
        for (_, symbol, reason) in self.broker.take_rejections() {
            self.events.error(at, &EngineError::rejected(symbol, reason));
        }
    }

    /// Publish revealed closes and call `handle_data`
    fn deliver(&mut self, timestamp: NaiveDateTime, bars: Vec<Bar>) -> std::result::Result<(), Halt> {
        let mut data = BarData::new(timestamp);
        for bar in bars {
            self.broker.update_reference(&bar.symbol, bar.close);
            self.ctx.update_price(&bar.symbol, bar.close);
            data.bars.insert(bar.symbol.clone(), bar);
        }
        self.refresh_portfolio();

        if let Some(f) = self.module.handle_data.clone() {
            invoke("handle_data", &mut self.ctx, |c| f(c, &data))?;
        }
        Ok(())
    }

    /// Distinct minute bar timestamps across loaded series on `day`
    fn minute_times(&self, day: NaiveDate) -> Vec<NaiveDateTime> {
        let times: BTreeSet<NaiveDateTime> = self
            .series
            .values()
            .flat_map(|bars| day_slice(bars, day).iter().map(|b| b.timestamp))
            .collect();
        times.into_iter().collect()
    }

    fn set_time(&mut self, at: NaiveDateTime) {
        self.ctx.set_time(at);
        self.control.set_time(at);
    }

    fn refresh_portfolio(&mut self) {
        self.ctx.set_portfolio(self.ledger.snapshot());
    }
}

/// Bars of a sorted series dated `day`
fn day_slice(bars: &[Bar], day: NaiveDate) -> &[Bar] {
    let from = bars.partition_point(|b| b.date() < day);
    let to = bars.partition_point(|b| b.date() <= day);
    &bars[from..to]
}
