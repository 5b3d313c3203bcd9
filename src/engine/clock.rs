//! Session timeline and live time sources
//!
//! `plan_day` fixes the order of everything that happens inside one trading
//! period; backtest and live schedulers both walk that plan. `Clock` feeds
//! wall-clock (or injected) ticks to the live scheduler.

use crate::config::SessionConfig;
use crate::data::{Frequency, Quote};
use crate::strategy::{Schedule, ScheduledTask};
use chrono::{Local, NaiveDateTime, NaiveTime};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const RANK_TASK: u8 = 0;
const RANK_BARS: u8 = 1;
const RANK_AFTER_CLOSE: u8 = 2;
const RANK_LATE_TASK: u8 = 3;

/// One step of a trading period after `before_trading_start`
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Task(ScheduledTask),
    /// Daily frequency: match open orders against the day's bars
    Open,
    /// Daily frequency: mark and `handle_data` for the day's bars
    Session,
    /// Minute frequency: one bar timestamp
    Bar(NaiveDateTime),
    AfterTradingClose,
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedStep {
    /// Session clock time the step is keyed on
    pub at: NaiveTime,
    rank: u8,
    seq: u64,
    pub step: Step,
}

/// Order the steps of one period.
///
/// Tasks at or before the close run in time order (ties by registration)
/// and a task at `T` precedes any bar at or after `T`. In daily frequency
/// orders are matched at the open, after the tasks due by then, and the
/// day's bars are delivered at the close. Tasks after the close run after
/// `after_trading_close`.
pub(crate) fn plan_day(
    schedule: &Schedule,
    session: &SessionConfig,
    frequency: Frequency,
    bar_times: &[NaiveDateTime],
) -> Vec<PlannedStep> {
    let mut steps = Vec::new();

    for task in schedule.due(session, frequency, None, None) {
        let Some(at) = task.time.resolve(session, frequency) else {
            continue;
        };
        let (at, rank) = if at <= session.close {
            (at, RANK_TASK)
        } else {
            (at.max(session.after_close), RANK_LATE_TASK)
        };
        steps.push(PlannedStep {
            at,
            rank,
            seq: task.seq,
            step: Step::Task(task),
        });
    }

    match frequency {
        Frequency::Day => {
            steps.push(PlannedStep {
                at: session.open,
                rank: RANK_BARS,
                seq: 0,
                step: Step::Open,
            });
            steps.push(PlannedStep {
                at: session.close,
                rank: RANK_BARS,
                seq: 0,
                step: Step::Session,
            });
        }
        Frequency::Minute => steps.extend(bar_times.iter().map(|ts| PlannedStep {
            at: ts.time(),
            rank: RANK_BARS,
            seq: 0,
            step: Step::Bar(*ts),
        })),
    }

    steps.push(PlannedStep {
        at: session.after_close,
        rank: RANK_AFTER_CLOSE,
        seq: 0,
        step: Step::AfterTradingClose,
    });

    steps.sort_by_key(|s| (s.at, s.rank, s.seq));
    steps
}

/// Input to the live scheduler
#[derive(Debug)]
pub(crate) enum LiveEvent {
    Tick(NaiveDateTime),
    Quote(Quote),
    /// Re-check run controls
    Wake,
    /// The time source ended
    ClockStopped,
}

/// Time source for live runs
#[derive(Debug)]
pub enum Clock {
    /// Local wall clock sampled every `interval`
    Wall { interval: Duration },
    /// Ticks pushed by the caller. Dropping the sender ends the run.
    Manual(mpsc::Receiver<NaiveDateTime>),
}

impl Clock {
    pub fn wall(interval: Duration) -> Self {
        Clock::Wall { interval }
    }

    /// Wall clock at the session's configured tick interval
    pub fn from_session(session: &SessionConfig) -> Self {
        Self::wall(Duration::from_millis(session.clock_interval_ms.max(1)))
    }

    /// Manual clock and the sender that drives it
    pub fn manual(capacity: usize) -> (Self, mpsc::Sender<NaiveDateTime>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Clock::Manual(rx), tx)
    }

    pub(crate) fn spawn(self, events: mpsc::Sender<LiveEvent>) -> JoinHandle<()> {
        match self {
            Clock::Wall { interval } => tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let now = Local::now().naive_local();
                    if events.send(LiveEvent::Tick(now)).await.is_err() {
                        break;
                    }
                }
            }),
            Clock::Manual(mut rx) => tokio::spawn(async move {
                while let Some(now) = rx.recv().await {
                    if events.send(LiveEvent::Tick(now)).await.is_err() {
                        return;
                    }
                }
                tracing::debug!("Manual clock exhausted");
                let _ = events.send(LiveEvent::ClockStopped).await;
            }),
        }
    }
}
