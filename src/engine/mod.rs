//! Clock & scheduler
//!
//! The only component that advances time. It drives a strategy through its
//! lifecycle callbacks and daily tasks in a fixed order, against either the
//! backtest broker or a live venue, and hands the outcome back through a
//! `RunHandle`.

mod backtest;
mod clock;
mod events;
mod live;
mod results;
mod state;

pub use backtest::BacktestEngine;
pub use clock::Clock;
pub use events::{EventLog, RunEvent, Severity};
pub use live::LiveSetup;
pub use results::{
    create_run_dir, equity_schema, fills_schema, new_run_id, write_equity, write_fills,
    write_report, RunReport,
};
pub use state::RunState;

use crate::config::Config;
use crate::data::DataProvider;
use crate::error::{EngineError, Result};
use crate::strategy::{StrategyContext, StrategyModule};
use crate::telemetry::{self, CounterMetric};
use chrono::{Local, NaiveDateTime};
use clock::LiveEvent;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between a scheduler and its handle
pub(crate) struct RunControl {
    live: bool,
    state: Mutex<RunState>,
    cancelled: AtomicBool,
    now: Mutex<Option<NaiveDateTime>>,
    events: EventLog,
    wake: Mutex<Option<mpsc::Sender<LiveEvent>>>,
}

impl RunControl {
    pub(crate) fn new(live: bool, events: EventLog) -> Arc<Self> {
        Arc::new(Self {
            live,
            state: Mutex::new(RunState::Idle),
            cancelled: AtomicBool::new(false),
            now: Mutex::new(None),
            events,
            wake: Mutex::new(None),
        })
    }

    pub(crate) fn state(&self) -> RunState {
        *lock(&self.state)
    }

    /// Latest engine time seen by the scheduler
    pub(crate) fn set_time(&self, at: NaiveDateTime) {
        *lock(&self.now) = Some(at);
    }

    fn time(&self) -> NaiveDateTime {
        lock(&self.now).unwrap_or_else(|| Local::now().naive_local())
    }

    pub(crate) fn advance(&self, next: RunState) -> Result<()> {
        let mut state = lock(&self.state);
        let from = *state;
        state.advance(next, self.live)?;
        drop(state);
        self.events
            .info(self.time(), "state", format!("{from} -> {next}"));
        self.nudge();
        Ok(())
    }

    pub(crate) fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            tracing::info!("Run cancellation requested");
        }
        self.nudge();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_wake(&self, tx: mpsc::Sender<LiveEvent>) {
        *lock(&self.wake) = Some(tx);
    }

    fn nudge(&self) {
        if let Some(tx) = lock(&self.wake).as_ref() {
            let _ = tx.try_send(LiveEvent::Wake);
        }
    }
}

/// Handle to a started run
pub struct RunHandle {
    run_id: String,
    run_dir: Option<PathBuf>,
    events: EventLog,
    control: Arc<RunControl>,
    task: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Directory receiving this run's output files, when configured
    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    /// Follow events from now on. Earlier ones are in `event_history`.
    pub fn events(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn event_history(&self) -> Vec<RunEvent> {
        self.events.history()
    }

    pub fn state(&self) -> RunState {
        self.control.state()
    }

    /// Stop after the current callback completes. Open live orders stay
    /// working at the venue.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Suspend strategy callbacks (live runs only)
    pub fn pause(&self) -> Result<()> {
        self.control.advance(RunState::Paused)
    }

    pub fn resume(&self) -> Result<()> {
        self.control.advance(RunState::Running)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end and collect its report
    pub async fn wait(self) -> Result<RunReport> {
        self.task
            .await
            .map_err(|e| EngineError::Results(format!("run task failed: {e}")))?
    }
}

/// Validate `config` and replay it on a blocking worker thread.
///
/// `run_id` overrides the generated id, which makes replays comparable.
pub fn start_backtest(
    config: Config,
    module: StrategyModule,
    provider: Arc<dyn DataProvider>,
    run_id: Option<String>,
) -> Result<RunHandle> {
    let mut engine = BacktestEngine::new(config, module, provider)?;
    if let Some(id) = run_id {
        engine = engine.with_run_id(id);
    }

    let run_id = engine.run_id().to_string();
    let run_dir = engine.run_dir().map(Path::to_path_buf);
    let events = engine.events();
    let control = engine.control();

    tracing::info!(run_id = %run_id, "Backtest started");
    let task = tokio::task::spawn_blocking(move || engine.run());

    Ok(RunHandle {
        run_id,
        run_dir,
        events,
        control,
        task,
    })
}

/// Connect the live components described by `setup` and start scheduling
pub async fn start_live(setup: LiveSetup) -> Result<RunHandle> {
    live::start(setup).await
}

/// Run one strategy callback.
///
/// Recoverable engine errors returned by the callback are logged and
/// swallowed. Any other error, or a panic, becomes `StrategyRuntime`.
pub(crate) fn invoke(
    name: &str,
    ctx: &mut StrategyContext,
    f: impl FnOnce(&mut StrategyContext) -> anyhow::Result<()>,
) -> Result<()> {
    let at = ctx.current_dt();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(ctx)));

    let message = match outcome {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => match err.downcast_ref::<EngineError>() {
            Some(e) if e.is_recoverable() => {
                ctx.events()
                    .warn(at, "strategy_callback", format!("{name}: {e}"));
                return Ok(());
            }
            _ => format!("{err:#}"),
        },
        Err(payload) => panic_message(payload.as_ref()),
    };

    telemetry::increment(CounterMetric::StrategyErrors, 1);
    tracing::error!(callback = name, at = %at, error = %message, "Strategy callback failed");
    Err(EngineError::StrategyRuntime {
        callback: name.to_string(),
        timestamp: at,
        message,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
