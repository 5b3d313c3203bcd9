//! Run event stream
//!
//! Every run keeps an append-only log of notable events (rejections, data
//! gaps, reconnects, strategy faults, state changes). Events are also
//! broadcast so callers can follow a run while it progresses.

use crate::error::EngineError;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// One entry in a run's event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Engine time (simulated in backtests)
    pub timestamp: NaiveDateTime,
    pub severity: Severity,
    /// Error kind or event category, e.g. `order_rejected`, `state`
    pub kind: String,
    pub message: String,
}

/// Shared, cloneable event log
#[derive(Clone)]
pub struct EventLog {
    tx: broadcast::Sender<RunEvent>,
    history: Arc<Mutex<Vec<RunEvent>>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventLog {
    /// `capacity` bounds how far a slow subscriber may lag before skipping
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RunEvent>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn emit(&self, event: RunEvent) {
        match event.severity {
            Severity::Info => tracing::info!(kind = %event.kind, at = %event.timestamp, "{}", event.message),
            Severity::Warning => tracing::warn!(kind = %event.kind, at = %event.timestamp, "{}", event.message),
            Severity::Error => tracing::error!(kind = %event.kind, at = %event.timestamp, "{}", event.message),
        }
        self.lock().push(event.clone());
        // No subscribers is fine; history keeps everything
        let _ = self.tx.send(event);
    }

    pub fn record(
        &self,
        timestamp: NaiveDateTime,
        severity: Severity,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.emit(RunEvent {
            timestamp,
            severity,
            kind: kind.into(),
            message: message.into(),
        });
    }

    pub fn info(&self, timestamp: NaiveDateTime, kind: &str, message: impl Into<String>) {
        self.record(timestamp, Severity::Info, kind, message);
    }

    pub fn warn(&self, timestamp: NaiveDateTime, kind: &str, message: impl Into<String>) {
        self.record(timestamp, Severity::Warning, kind, message);
    }

    /// Record an engine error under its kind. Recoverable errors are warnings.
    pub fn error(&self, timestamp: NaiveDateTime, err: &EngineError) {
        let severity = if err.is_recoverable() {
            Severity::Warning
        } else {
            Severity::Error
        };
        self.record(timestamp, severity, err.kind().to_string(), err.to_string());
    }

    /// Follow events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Everything emitted so far, in order
    pub fn history(&self) -> Vec<RunEvent> {
        self.lock().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.lock().iter().filter(|e| e.kind == kind).count()
    }
}
