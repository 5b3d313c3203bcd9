//! Run lifecycle

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduler state. `Paused` exists in live runs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Finished,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Finished => "finished",
            RunState::Aborted => "aborted",
        })
    }
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Finished | RunState::Aborted)
    }

    pub fn can_transition_to(&self, next: RunState, live: bool) -> bool {
        use RunState::*;
        match (self, next) {
            (Idle, Running) | (Idle, Aborted) => true,
            (Running, Finished) | (Running, Aborted) => true,
            (Running, Paused) | (Paused, Running) => live,
            (Paused, Finished) | (Paused, Aborted) => live,
            _ => false,
        }
    }

    /// Checked transition
    pub fn advance(&mut self, next: RunState, live: bool) -> Result<()> {
        if !self.can_transition_to(next, live) {
            return Err(EngineError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}
