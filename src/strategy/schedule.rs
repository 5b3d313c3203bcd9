//! Daily task schedule

use super::Callback;
use crate::config::{parse_clock, SessionConfig};
use crate::data::Frequency;
use crate::error::EngineError;
use chrono::NaiveTime;
use std::fmt;
use std::str::FromStr;

/// When a daily task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTime {
    BeforeOpen,
    Open,
    Close,
    AfterClose,
    /// Before every bar (minute runs) or once at open (daily runs)
    EveryBar,
    At(NaiveTime),
}

impl FromStr for TaskTime {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "before_open" => Ok(TaskTime::BeforeOpen),
            "open" => Ok(TaskTime::Open),
            "close" => Ok(TaskTime::Close),
            "after_close" => Ok(TaskTime::AfterClose),
            "every_bar" => Ok(TaskTime::EveryBar),
            other => parse_clock(other)
                .map(TaskTime::At)
                .ok_or_else(|| EngineError::InvalidConfig(format!("invalid task time: {s}"))),
        }
    }
}

impl fmt::Display for TaskTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskTime::BeforeOpen => f.write_str("before_open"),
            TaskTime::Open => f.write_str("open"),
            TaskTime::Close => f.write_str("close"),
            TaskTime::AfterClose => f.write_str("after_close"),
            TaskTime::EveryBar => f.write_str("every_bar"),
            TaskTime::At(t) => write!(f, "{}", t.format("%H:%M:%S")),
        }
    }
}

impl TaskTime {
    /// Clock time within the session. `None` for per-bar tasks on minute runs.
    pub fn resolve(&self, session: &SessionConfig, frequency: Frequency) -> Option<NaiveTime> {
        match self {
            TaskTime::BeforeOpen => Some(session.before_open),
            TaskTime::Open => Some(session.open),
            TaskTime::Close => Some(session.close),
            TaskTime::AfterClose => Some(session.after_close),
            TaskTime::EveryBar => match frequency {
                Frequency::Day => Some(session.open),
                Frequency::Minute => None,
            },
            TaskTime::At(t) => Some(*t),
        }
    }
}

/// A registered daily task
#[derive(Clone)]
pub struct ScheduledTask {
    /// Registration order
    pub seq: u64,
    pub name: String,
    pub time: TaskTime,
    pub(crate) callback: Callback,
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("seq", &self.seq)
            .field("name", &self.name)
            .field("time", &self.time)
            .finish()
    }
}

/// Tasks registered through `run_daily`. Duplicates are kept.
#[derive(Default, Clone)]
pub struct Schedule {
    tasks: Vec<ScheduledTask>,
    next_seq: u64,
}

impl Schedule {
    pub fn add(&mut self, name: Option<String>, time: TaskTime, callback: Callback) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.push(ScheduledTask {
            seq,
            name: name.unwrap_or_else(|| format!("task_{seq}")),
            time,
            callback,
        });
        seq
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks whose time falls in `(after, up_to]`, ascending by time then
    /// registration order. `after = None` means from the start of the day.
    pub fn due(
        &self,
        session: &SessionConfig,
        frequency: Frequency,
        after: Option<NaiveTime>,
        up_to: Option<NaiveTime>,
    ) -> Vec<ScheduledTask> {
        let mut due: Vec<(NaiveTime, ScheduledTask)> = self
            .tasks
            .iter()
            .filter_map(|task| {
                let at = task.time.resolve(session, frequency)?;
                let started = after.map_or(true, |a| at > a);
                let reached = up_to.map_or(true, |u| at <= u);
                (started && reached).then(|| (at, task.clone()))
            })
            .collect();
        due.sort_by_key(|(at, task)| (*at, task.seq));
        due.into_iter().map(|(_, task)| task).collect()
    }

    /// Per-bar tasks for minute runs, in registration order
    pub fn per_bar(&self) -> Vec<ScheduledTask> {
        self.tasks
            .iter()
            .filter(|t| t.time == TaskTime::EveryBar)
            .cloned()
            .collect()
    }
}
