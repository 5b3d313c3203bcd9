//! Live trading session
//!
//! Three units run side by side: the quote forwarder, the broker's
//! order-management task and the scheduler. They hand work to each other
//! over channels. Only the scheduler calls strategy code, and only the
//! ledger task writes account state.

use super::clock::{plan_day, Clock, LiveEvent, Step};
use super::results::{create_run_dir, new_run_id, write_report};
use super::{invoke, EventLog, RunControl, RunHandle, RunReport, RunState};
use crate::config::Config;
use crate::data::{weekdays, Bar, DataProvider, Frequency, Quote};
use crate::error::{EngineError, Result};
use crate::execution::{Broker, LiveBroker, LiveBrokerSettings, Venue};
use crate::feed::QuoteFeed;
use crate::ledger::{spawn_ledger, Ledger, LedgerCommand, LedgerHandle, LedgerSnapshot};
use crate::strategy::{BarData, ContextParts, StrategyContext, StrategyModule};
use crate::telemetry;
use chrono::{DurationRound, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

const EVENT_QUEUE: usize = 1024;

/// Components of a live run
pub struct LiveSetup {
    config: Config,
    module: StrategyModule,
    provider: Arc<dyn DataProvider>,
    venue: Arc<dyn Venue>,
    feed: Arc<dyn QuoteFeed>,
    clock: Option<Clock>,
    run_id: Option<String>,
}

impl LiveSetup {
    pub fn new(
        config: Config,
        module: StrategyModule,
        provider: Arc<dyn DataProvider>,
        venue: Arc<dyn Venue>,
        feed: Arc<dyn QuoteFeed>,
    ) -> Self {
        Self {
            config,
            module,
            provider,
            venue,
            feed,
            clock: None,
            run_id: None,
        }
    }

    /// Replace the wall clock, e.g. with `Clock::manual` in tests
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

pub(crate) async fn start(setup: LiveSetup) -> Result<RunHandle> {
    let LiveSetup {
        config,
        module,
        provider,
        venue,
        feed,
        clock,
        run_id,
    } = setup;
    config.validate()?;

    let mut quotes = feed.subscribe().await?;

    let run_dir = match &config.run.result_dir {
        Some(base) => Some(create_run_dir(base)?),
        None => None,
    };
    let run_id = run_id
        .or_else(|| {
            run_dir
                .as_ref()
                .and_then(|d| d.file_name())
                .map(|n| n.to_string_lossy().to_string())
        })
        .unwrap_or_else(new_run_id);

    let events = EventLog::default();
    let control = RunControl::new(true, events.clone());

    let (ledger, ledger_task) = spawn_ledger(
        Ledger::new(config.run.initial_cash),
        config.broker.order_queue.max(1),
    );
    let (broker, broker_task) = LiveBroker::spawn(
        venue.clone(),
        ledger.clone(),
        events.clone(),
        LiveBrokerSettings::from_config(&config.broker).allow_short(config.policy.allow_short),
        run_id.clone(),
    );

    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    control.set_wake(tx.clone());
    let clock_task = clock
        .unwrap_or_else(|| Clock::from_session(&config.session))
        .spawn(tx.clone());

    let feed_task = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            while let Some(quote) = quotes.recv().await {
                venue.on_quote(&quote).await;
                let mark = LedgerCommand::Mark {
                    symbol: quote.symbol.clone(),
                    price: quote.price,
                    at: quote.timestamp,
                };
                if let Err(e) = ledger.send(mark).await {
                    tracing::warn!(error = %e, "Quote mark not applied");
                }
                if tx.send(LiveEvent::Quote(quote)).await.is_err() {
                    break;
                }
            }
            tracing::info!("Quote feed closed");
        })
    };

    let scheduler = LiveScheduler::new(
        &config,
        module,
        provider,
        broker.clone(),
        ledger,
        events.clone(),
        control.clone(),
        run_id.clone(),
    );

    tracing::info!(run_id = %run_id, strategy = scheduler.module.name(), "Live run started");

    let task = {
        let run_id = run_id.clone();
        let run_dir = run_dir.clone();
        let events = events.clone();
        let shutdown_wait = config.broker.connect_timeout();
        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || scheduler.run(rx))
                .await
                .map_err(|e| EngineError::Results(format!("scheduler task failed: {e}")))?;

            broker.shutdown().await;
            clock_task.abort();
            feed_task.abort();
            if tokio::time::timeout(shutdown_wait, broker_task).await.is_err() {
                tracing::warn!("Order manager did not stop in time");
            }
            drop(ledger_task);

            let report = RunReport {
                run_id: run_id.clone(),
                state: outcome.state,
                run_dir: run_dir.clone(),
                orders: broker.orders(),
                fills: broker.fills(),
                snapshots: outcome.snapshots,
                benchmark: Vec::new(),
                events: events.history(),
                fault: outcome.fault,
            };
            if let Some(dir) = &run_dir {
                if let Err(e) = write_report(dir, &report) {
                    events.error(Local::now().naive_local(), &e);
                }
            }
            tracing::info!(
                run_id = %run_id,
                state = %report.state,
                orders = report.orders.len(),
                fills = report.fills.len(),
                "Live run finished"
            );
            Ok(report)
        })
    };

    Ok(RunHandle {
        run_id,
        run_dir,
        events,
        control,
        task,
    })
}

/// Builds bars at the run frequency from quotes.
///
/// Minute bars are stamped at the end of their minute (a quote at 09:30:15
/// belongs to the 09:31 bar); daily bars at midnight of their date.
#[derive(Debug)]
pub(crate) struct BarAggregator {
    frequency: Frequency,
    open: BTreeMap<(NaiveDateTime, String), Bar>,
}

impl BarAggregator {
    pub(crate) fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            open: BTreeMap::new(),
        }
    }

    fn bucket(&self, ts: NaiveDateTime) -> NaiveDateTime {
        match self.frequency {
            Frequency::Day => ts.date().and_time(NaiveTime::MIN),
            Frequency::Minute => {
                let floor = ts.duration_trunc(TimeDelta::minutes(1)).unwrap_or(ts);
                if floor == ts {
                    ts
                } else {
                    floor + TimeDelta::minutes(1)
                }
            }
        }
    }

    pub(crate) fn push(&mut self, quote: &Quote) {
        let key = (self.bucket(quote.timestamp), quote.symbol.clone());
        let bar = self.open.entry(key).or_insert_with_key(|(ts, symbol)| Bar {
            symbol: symbol.clone(),
            timestamp: *ts,
            open: quote.price,
            high: quote.price,
            low: quote.price,
            close: quote.price,
            volume: rust_decimal::Decimal::ZERO,
        });
        bar.high = bar.high.max(quote.price);
        bar.low = bar.low.min(quote.price);
        bar.close = quote.price;
        bar.volume += quote.volume;
    }

    /// Remove and return bars stamped before `cutoff`, by time then symbol
    pub(crate) fn take_before(&mut self, cutoff: NaiveDateTime) -> Vec<Bar> {
        let later = self.open.split_off(&(cutoff, String::new()));
        std::mem::replace(&mut self.open, later).into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.open.len()
    }
}

struct LiveOutcome {
    state: RunState,
    fault: Option<String>,
    snapshots: Vec<LedgerSnapshot>,
}

/// Scheduler for one live run, driven from a blocking thread
struct LiveScheduler {
    config: Config,
    module: StrategyModule,
    provider: Arc<dyn DataProvider>,
    ledger: LedgerHandle,
    events: EventLog,
    control: Arc<RunControl>,
    ctx: StrategyContext,
    bars: BarAggregator,
    day: Option<NaiveDate>,
    trading_day: bool,
    /// `before_trading_start` ran today
    started: bool,
    /// Session time handled by the previous tick
    last: Option<NaiveTime>,
    snapshots: Vec<LedgerSnapshot>,
}

impl LiveScheduler {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: &Config,
        module: StrategyModule,
        provider: Arc<dyn DataProvider>,
        broker: Arc<LiveBroker>,
        ledger: LedgerHandle,
        events: EventLog,
        control: Arc<RunControl>,
        run_id: String,
    ) -> Self {
        let broker: Arc<dyn Broker> = broker;
        let ctx = StrategyContext::new(ContextParts {
            run_id,
            live: true,
            frequency: config.run.frequency,
            session: config.session.clone(),
            start: Local::now().naive_local(),
            portfolio: ledger.snapshot(),
            broker,
            provider: provider.clone(),
            events: events.clone(),
            universe: config.run.universe.clone(),
            benchmark: config.run.benchmark.clone(),
        });

        Self {
            config: config.clone(),
            module,
            provider,
            ledger,
            events,
            control,
            ctx,
            bars: BarAggregator::new(config.run.frequency),
            day: None,
            trading_day: false,
            started: false,
            last: None,
            snapshots: Vec::new(),
        }
    }

    fn run(mut self, mut rx: mpsc::Receiver<LiveEvent>) -> LiveOutcome {
        let (state, fault) = match self.drive(&mut rx) {
            Ok(()) => (RunState::Finished, None),
            Err(e) => {
                self.events.error(self.ctx.current_dt(), &e);
                (RunState::Aborted, Some(e.to_string()))
            }
        };
        self.close_day();

        if let Err(e) = self.control.advance(state) {
            tracing::warn!(error = %e, "Final state not recorded");
        }
        LiveOutcome {
            state,
            fault,
            snapshots: self.snapshots,
        }
    }

    fn drive(&mut self, rx: &mut mpsc::Receiver<LiveEvent>) -> Result<()> {
        let initialize = self.module.initialize.clone();
        invoke("initialize", &mut self.ctx, |c| initialize(c))?;
        self.ctx.g.apply_overrides(&self.config.params);
        if let Some(f) = self.module.process_initialize.clone() {
            invoke("process_initialize", &mut self.ctx, |c| f(c))?;
        }
        self.control.advance(RunState::Running)?;

        while let Some(event) = rx.blocking_recv() {
            if self.control.is_cancelled() {
                tracing::info!("Live run stopping on request");
                break;
            }
            match event {
                LiveEvent::Tick(now) => self.on_tick(now)?,
                LiveEvent::Quote(quote) => {
                    self.ctx.update_price(&quote.symbol, quote.price);
                    self.bars.push(&quote);
                }
                LiveEvent::Wake => {}
                LiveEvent::ClockStopped => {
                    tracing::info!("Clock stopped");
                    break;
                }
            }
        }
        Ok(())
    }

    fn on_tick(&mut self, now: NaiveDateTime) -> Result<()> {
        let date = now.date();
        if self.day != Some(date) {
            let first_day = self.day.is_none();
            self.close_day();
            self.open_day(date);
            if first_day {
                // Tasks due before the run started are not caught up
                let (start, wrapped) = now.time().overflowing_sub_signed(TimeDelta::seconds(1));
                self.last = (wrapped == 0).then_some(start);
            }
        }
        if !self.trading_day {
            return Ok(());
        }

        self.ctx.set_time(now);
        self.control.set_time(now);

        if self.control.state() == RunState::Paused {
            let skipped = self.bars.take_before(now);
            if !skipped.is_empty() {
                tracing::debug!(bars = skipped.len(), "Bars skipped while paused");
            }
            self.last = Some(now.time());
            return Ok(());
        }

        let session = self.config.session.clone();
        if !self.started {
            if now.time() < session.before_open {
                return Ok(());
            }
            self.started = true;
            self.refresh_portfolio();
            if let Some(f) = self.module.before_trading_start.clone() {
                invoke("before_trading_start", &mut self.ctx, |c| f(c))?;
            }
        }

        let mut ready: BTreeMap<NaiveDateTime, Vec<Bar>> = BTreeMap::new();
        if self.config.run.frequency == Frequency::Minute {
            for bar in self.bars.take_before(now) {
                ready.entry(bar.timestamp).or_default().push(bar);
            }
        }
        let bar_times: Vec<NaiveDateTime> = ready.keys().copied().collect();

        let steps = plan_day(
            self.ctx.schedule(),
            &session,
            self.config.run.frequency,
            &bar_times,
        );
        let last = self.last;
        let due = |at: NaiveTime| last.map_or(true, |l| at > l) && at <= now.time();

        for planned in steps {
            match planned.step {
                Step::Task(task) if due(planned.at) => {
                    self.refresh_portfolio();
                    invoke(&task.name, &mut self.ctx, |c| (task.callback)(c))?;
                }
                Step::Session if due(planned.at) => {
                    let next_day = date.succ_opt().unwrap_or(date).and_time(NaiveTime::MIN);
                    let bars = self.bars.take_before(next_day);
                    self.deliver(date.and_time(NaiveTime::MIN), bars)?;
                }
                Step::Bar(ts) => {
                    let per_bar = self.ctx.schedule().per_bar();
                    for task in per_bar {
                        self.refresh_portfolio();
                        invoke(&task.name, &mut self.ctx, |c| (task.callback)(c))?;
                    }
                    let bars = ready.remove(&ts).unwrap_or_default();
                    self.deliver(ts, bars)?;
                }
                Step::AfterTradingClose if due(planned.at) => {
                    self.refresh_portfolio();
                    if let Some(f) = self.module.after_trading_close.clone() {
                        invoke("after_trading_close", &mut self.ctx, |c| f(c))?;
                    }
                }
                _ => {}
            }
        }

        self.last = Some(now.time());
        Ok(())
    }

    fn deliver(&mut self, timestamp: NaiveDateTime, bars: Vec<Bar>) -> Result<()> {
        let mut data = BarData::new(timestamp);
        for bar in bars {
            self.ctx.update_price(&bar.symbol, bar.close);
            self.ctx.push_intraday(bar.clone());
            data.bars.insert(bar.symbol.clone(), bar);
        }
        self.ctx.reveal(timestamp);
        self.refresh_portfolio();

        if let Some(f) = self.module.handle_data.clone() {
            invoke("handle_data", &mut self.ctx, |c| f(c, &data))?;
        }
        Ok(())
    }

    fn open_day(&mut self, date: NaiveDate) {
        let stale = self.bars.take_before(date.and_time(NaiveTime::MIN));
        if !stale.is_empty() {
            tracing::debug!(bars = stale.len(), "Dropped bars from previous day");
        }
        self.day = Some(date);
        self.started = false;
        self.last = None;
        self.trading_day = match self.provider.trading_days(date, date) {
            Ok(days) => days.contains(&date),
            Err(e) => {
                tracing::warn!(error = %e, "Calendar unavailable, using weekdays");
                weekdays(date, date).contains(&date)
            }
        };
        tracing::info!(date = %date, trading = self.trading_day, "Live day opened");
    }

    /// Record the period snapshot of a day that started trading
    fn close_day(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        let snapshot = self.ledger.snapshot();
        telemetry::record_snapshot(&snapshot);
        self.snapshots.push(snapshot);
    }

    fn refresh_portfolio(&mut self) {
        self.ctx.set_portfolio(self.ledger.snapshot());
    }
}
